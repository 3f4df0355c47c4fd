//! Call Engine seam: the media stack the coordinator drives but does not implement.

use crate::protocol::IceCandidate;
use crate::room::RoomConnectionParameters;

/// Negotiation role. The initiator sends the offer; the responder sends the answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Initiator,
    Responder,
}

/// Which side produced a session description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpType {
    Offer,
    Answer,
}

/// Commands the coordinator issues to a live peer connection.
///
/// Results come back asynchronously as [`EngineEvent`]s delivered to
/// [`SessionCoordinator::on_engine_event`](crate::SessionCoordinator::on_engine_event).
/// After `close` an engine must not deliver further events.
pub trait CallEngine: Send {
    fn create_offer(&mut self) -> Result<(), EngineError>;
    fn create_answer(&mut self) -> Result<(), EngineError>;
    fn set_remote_description(&mut self, sdp_type: SdpType, sdp: &str) -> Result<(), EngineError>;
    fn add_remote_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<(), EngineError>;
    fn remove_remote_ice_candidates(&mut self, candidates: &[IceCandidate]) -> Result<(), EngineError>;
    fn close(&mut self);
}

/// Creates one engine per negotiated session.
pub trait CallEngineFactory: Send {
    type Engine: CallEngine;

    fn create(
        &mut self,
        params: &RoomConnectionParameters,
        role: Role,
    ) -> Result<Self::Engine, EngineError>;
}

/// Callbacks from the engine, handed back into the coordinator's serialized context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    LocalDescription(String),
    IceCandidate(IceCandidate),
    IceCandidatesRemoved(Vec<IceCandidate>),
    Connected,
    Disconnected,
    Error(String),
}

/// Failure reported by the engine; surfaced verbatim.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct EngineError(pub String);

impl EngineError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

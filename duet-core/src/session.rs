//! Host-driven call setup: the host feeds transport, message and engine events
//! in; the coordinator drives the Call Engine, sends through its sink and
//! returns actions for the host. Not safe for concurrent entry; the host must
//! call it from one serialized context.

use crate::codec::{DecodeError, EncodeError};
use crate::engine::{CallEngine, CallEngineFactory, EngineError, EngineEvent, Role, SdpType};
use crate::protocol::{IceCandidate, MessageKind, SignalingMessage};
use crate::room::RoomConnectionParameters;

/// Default bound on remote candidates held while no engine exists.
pub const DEFAULT_MAX_PENDING_CANDIDATES: usize = 64;

/// Where outbound signaling messages go. Must fail fast when nothing is connected.
pub trait SignalSink {
    fn send(&mut self, msg: SignalingMessage) -> Result<(), SendError>;
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("sending message in non connected state")]
    NotConnected,
    #[error(transparent)]
    Encode(#[from] EncodeError),
}

/// Why a session failed. Terminal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("call engine error: {0}")]
    Engine(String),
    #[error("setup error: {0}")]
    Setup(String),
}

impl From<EngineError> for SessionError {
    fn from(e: EngineError) -> Self {
        SessionError::Engine(e.0)
    }
}

/// Observable session state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    AwaitingConnection,
    Negotiating(Role),
    Connected,
    Closed,
    Failed(SessionError),
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed(_))
    }
}

/// Action for host to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Open the outbound signaling connection.
    Dial { host: String, port: u16 },
    StateChanged(SessionState),
    /// Session ended normally; release the transport. Emitted at most once per session.
    Closed,
    /// Session failed; release the transport and report. Emitted at most once per session.
    Failed(SessionError),
}

struct Negotiation<E> {
    role: Role,
    engine: E,
    local_sent: bool,
    remote_applied: bool,
    engine_connected: bool,
}

impl<E> Negotiation<E> {
    fn ready(&self) -> bool {
        self.engine_connected
            && match self.role {
                Role::Initiator => self.remote_applied,
                Role::Responder => self.local_sent,
            }
    }
}

/// Engine ownership lives in the phase: no engine before Negotiating, none after Closed/Failed.
enum Phase<E> {
    Idle,
    AwaitingConnection { initiate: bool, dialing: bool },
    Negotiating(Negotiation<E>),
    Connected { role: Role, engine: E },
    Closed,
    Failed(SessionError),
}

/// Call-setup state machine for one logical session at a time.
pub struct SessionCoordinator<F: CallEngineFactory, S: SignalSink> {
    factory: F,
    sink: S,
    local_room_id: String,
    params: Option<RoomConnectionParameters>,
    phase: Phase<F::Engine>,
    pending_candidates: Vec<IceCandidate>,
    max_pending_candidates: usize,
    terminal_reported: bool,
    /// The session runs over the connection this side dialed.
    via_outbound: bool,
}

impl<F: CallEngineFactory, S: SignalSink> SessionCoordinator<F, S> {
    /// `local_room_id` identifies this side until a connect request supplies its own.
    pub fn new(local_room_id: impl Into<String>, factory: F, sink: S) -> Self {
        Self {
            factory,
            sink,
            local_room_id: local_room_id.into(),
            params: None,
            phase: Phase::Idle,
            pending_candidates: Vec::new(),
            max_pending_candidates: DEFAULT_MAX_PENDING_CANDIDATES,
            terminal_reported: false,
            via_outbound: false,
        }
    }

    /// Bound the candidate queue used before an engine exists. Zero drops early candidates.
    pub fn set_max_pending_candidates(&mut self, n: usize) {
        self.max_pending_candidates = n;
        self.trim_pending();
    }

    pub fn state(&self) -> SessionState {
        match &self.phase {
            Phase::Idle => SessionState::Idle,
            Phase::AwaitingConnection { .. } => SessionState::AwaitingConnection,
            Phase::Negotiating(n) => SessionState::Negotiating(n.role),
            Phase::Connected { .. } => SessionState::Connected,
            Phase::Closed => SessionState::Closed,
            Phase::Failed(e) => SessionState::Failed(e.clone()),
        }
    }

    pub fn role(&self) -> Option<Role> {
        match &self.phase {
            Phase::Negotiating(n) => Some(n.role),
            Phase::Connected { role, .. } => Some(*role),
            _ => None,
        }
    }

    pub fn has_engine(&self) -> bool {
        matches!(self.phase, Phase::Negotiating(_) | Phase::Connected { .. })
    }

    /// Room id used for `from`/`sendto` of outbound messages.
    pub fn room_id(&self) -> &str {
        self.params
            .as_ref()
            .map(|p| p.room_id())
            .unwrap_or(&self.local_room_id)
    }

    pub fn params(&self) -> Option<&RoomConnectionParameters> {
        self.params.as_ref()
    }

    pub fn pending_candidates(&self) -> &[IceCandidate] {
        &self.pending_candidates
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// True when the session runs over the outbound connection.
    pub fn rides_outbound(&self) -> bool {
        self.via_outbound
    }

    /// Whether events from an outbound (or inbound) connection concern this session.
    /// Inbound peers are unrelated while the session rides the outbound connection.
    pub fn accepts_from(&self, outbound: bool) -> bool {
        outbound || !self.via_outbound
    }

    /// Start a new session after the previous one ended. Any live engine is closed.
    pub fn reset(&mut self) {
        self.release_engine();
        self.phase = Phase::Idle;
        self.params = None;
        self.pending_candidates.clear();
        self.terminal_reported = false;
        self.via_outbound = false;
    }

    /// Connect-to-room request. Ignored unless Idle.
    ///
    /// With a dial target the coordinator waits for the outbound connection to
    /// open. Without one it starts negotiating as initiator right away when
    /// `as_initiator` or loopback is set, and otherwise waits for the remote offer.
    pub fn connect(&mut self, params: RoomConnectionParameters, as_initiator: bool) -> Vec<Action> {
        if !matches!(self.phase, Phase::Idle) {
            return Vec::new();
        }
        let target = params.dial_target();
        let loopback = params.is_loopback();
        self.params = Some(params);
        match target {
            Some(Err(e)) => self.fail(SessionError::Setup(e.to_string())),
            Some(Ok((host, port))) => {
                self.via_outbound = true;
                self.phase = Phase::AwaitingConnection {
                    initiate: as_initiator,
                    dialing: true,
                };
                vec![
                    Action::StateChanged(SessionState::AwaitingConnection),
                    Action::Dial { host, port },
                ]
            }
            None => {
                let initiate = as_initiator || loopback;
                self.phase = Phase::AwaitingConnection {
                    initiate,
                    dialing: false,
                };
                let mut actions = vec![Action::StateChanged(SessionState::AwaitingConnection)];
                if initiate {
                    actions.extend(self.begin(Role::Initiator, None));
                }
                actions
            }
        }
    }

    /// A signaling connection opened. `outbound` is true for the connection this side dialed.
    pub fn on_transport_open(&mut self, outbound: bool) -> Vec<Action> {
        let Phase::AwaitingConnection { initiate, dialing } = self.phase else {
            return Vec::new();
        };
        if dialing && !outbound {
            return Vec::new();
        }
        if initiate {
            return self.begin(Role::Initiator, None);
        }
        match self.send(MessageKind::CallMe) {
            Ok(()) => Vec::new(),
            Err(e) => self.fail(SessionError::Transport(e.to_string())),
        }
    }

    /// A signaling connection closed. Ends the session unless nothing is in progress,
    /// the connection is unrelated, or the close was local (those follow a terminal report).
    pub fn on_transport_closed(
        &mut self,
        outbound: bool,
        _code: u16,
        _reason: &str,
        remote: bool,
    ) -> Vec<Action> {
        if !remote || !self.accepts_from(outbound) {
            return Vec::new();
        }
        match self.phase {
            Phase::Idle | Phase::Closed | Phase::Failed(_) => Vec::new(),
            _ => self.close(),
        }
    }

    /// A signaling connection reported an error (including a failed dial).
    pub fn on_transport_error(&mut self, outbound: bool, reason: &str) -> Vec<Action> {
        if !self.accepts_from(outbound) {
            return Vec::new();
        }
        match self.phase {
            Phase::Idle | Phase::Closed | Phase::Failed(_) => Vec::new(),
            _ => self.fail(SessionError::Transport(reason.to_owned())),
        }
    }

    /// A line could not be decoded.
    pub fn on_malformed(&mut self, outbound: bool, err: &DecodeError) -> Vec<Action> {
        if self.is_terminal() || !self.accepts_from(outbound) {
            return Vec::new();
        }
        let error = if err.is_syntax() {
            SessionError::Transport(format!("message JSON parsing error: {err}"))
        } else {
            SessionError::Protocol(err.to_string())
        };
        self.fail(error)
    }

    /// An inbound signaling message. Messages carry no origin; one logical session is tracked.
    pub fn on_message(&mut self, msg: SignalingMessage) -> Vec<Action> {
        if self.is_terminal() {
            return Vec::new();
        }
        match msg.into_kind() {
            MessageKind::Offer { sdp } => self.on_remote_offer(&sdp),
            MessageKind::Answer { sdp } => self.on_remote_answer(&sdp),
            MessageKind::Candidate(candidate) => self.on_remote_candidate(candidate),
            MessageKind::RemoveCandidates { candidates } => {
                self.on_remote_candidates_removed(&candidates)
            }
            MessageKind::CallMe => match self.phase {
                Phase::Idle => {
                    let mut actions = vec![Action::StateChanged(SessionState::AwaitingConnection)];
                    actions.extend(self.begin(Role::Initiator, None));
                    actions
                }
                Phase::AwaitingConnection { .. } => self.begin(Role::Initiator, None),
                _ => Vec::new(),
            },
            MessageKind::Bye => self.close(),
        }
    }

    /// A callback from the Call Engine.
    pub fn on_engine_event(&mut self, event: EngineEvent) -> Vec<Action> {
        if self.is_terminal() {
            return Vec::new();
        }
        match event {
            EngineEvent::LocalDescription(sdp) => {
                let role = match &self.phase {
                    Phase::Negotiating(n) if !n.local_sent => n.role,
                    _ => return Vec::new(),
                };
                let kind = match role {
                    Role::Initiator => MessageKind::Offer { sdp },
                    Role::Responder => MessageKind::Answer { sdp },
                };
                if let Err(e) = self.send(kind) {
                    return self.fail(SessionError::Transport(e.to_string()));
                }
                if let Phase::Negotiating(n) = &mut self.phase {
                    n.local_sent = true;
                }
                self.complete_if_ready()
            }
            EngineEvent::IceCandidate(candidate) => {
                self.send_if_engine(MessageKind::Candidate(candidate))
            }
            EngineEvent::IceCandidatesRemoved(candidates) => {
                self.send_if_engine(MessageKind::RemoveCandidates { candidates })
            }
            EngineEvent::Connected => {
                if let Phase::Negotiating(n) = &mut self.phase {
                    n.engine_connected = true;
                }
                self.complete_if_ready()
            }
            EngineEvent::Disconnected => {
                if self.has_engine() {
                    self.close()
                } else {
                    Vec::new()
                }
            }
            EngineEvent::Error(reason) => self.fail(SessionError::Engine(reason)),
        }
    }

    /// Local hang-up: best-effort `bye`, then Closed. Nothing to do while Idle.
    pub fn hang_up(&mut self) -> Vec<Action> {
        if self.is_terminal() || matches!(self.phase, Phase::Idle) {
            return Vec::new();
        }
        let _ = self.send(MessageKind::Bye);
        self.close()
    }

    fn is_terminal(&self) -> bool {
        matches!(self.phase, Phase::Closed | Phase::Failed(_))
    }

    fn send(&mut self, kind: MessageKind) -> Result<(), SendError> {
        let msg = SignalingMessage::in_room(self.room_id(), kind);
        self.sink.send(msg)
    }

    fn send_if_engine(&mut self, kind: MessageKind) -> Vec<Action> {
        if !self.has_engine() {
            return Vec::new();
        }
        match self.send(kind) {
            Ok(()) => Vec::new(),
            Err(e) => self.fail(SessionError::Transport(e.to_string())),
        }
    }

    /// Create the engine for `role` and prime it. A responder applies the remote offer first.
    fn begin(&mut self, role: Role, remote_offer: Option<&str>) -> Vec<Action> {
        let local_room_id = &self.local_room_id;
        let params = self
            .params
            .get_or_insert_with(|| RoomConnectionParameters::listening(local_room_id.clone()))
            .clone();
        let mut engine = match self.factory.create(&params, role) {
            Ok(engine) => engine,
            Err(e) => return self.fail(e.into()),
        };
        let pending = std::mem::take(&mut self.pending_candidates);
        if let Err(e) = prime(&mut engine, remote_offer, &pending) {
            engine.close();
            return self.fail(e.into());
        }
        self.phase = Phase::Negotiating(Negotiation {
            role,
            engine,
            local_sent: false,
            remote_applied: remote_offer.is_some(),
            engine_connected: false,
        });
        vec![Action::StateChanged(SessionState::Negotiating(role))]
    }

    /// First offer wins: Idle and AwaitingConnection become responder, and so does an
    /// initiator whose own offer has not gone out yet. Later offers are ignored.
    fn on_remote_offer(&mut self, sdp: &str) -> Vec<Action> {
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Idle | Phase::AwaitingConnection { .. } => self.begin(Role::Responder, Some(sdp)),
            Phase::Negotiating(mut n) if n.role == Role::Initiator && !n.local_sent => {
                n.engine.close();
                self.begin(Role::Responder, Some(sdp))
            }
            other => {
                self.phase = other;
                Vec::new()
            }
        }
    }

    fn on_remote_answer(&mut self, sdp: &str) -> Vec<Action> {
        let applied = match &mut self.phase {
            Phase::Negotiating(n)
                if n.role == Role::Initiator && n.local_sent && !n.remote_applied =>
            {
                let result = n.engine.set_remote_description(SdpType::Answer, sdp);
                if result.is_ok() {
                    n.remote_applied = true;
                }
                Some(result)
            }
            _ => None,
        };
        match applied {
            Some(Ok(())) => self.complete_if_ready(),
            Some(Err(e)) => self.fail(e.into()),
            None => {
                let state = self.state();
                self.fail(SessionError::Protocol(format!(
                    "answer received in state {state:?}"
                )))
            }
        }
    }

    fn on_remote_candidate(&mut self, candidate: IceCandidate) -> Vec<Action> {
        let applied = match &mut self.phase {
            Phase::Negotiating(n) => Some(n.engine.add_remote_ice_candidate(&candidate)),
            Phase::Connected { engine, .. } => Some(engine.add_remote_ice_candidate(&candidate)),
            _ => None,
        };
        match applied {
            Some(Ok(())) => Vec::new(),
            Some(Err(e)) => self.fail(e.into()),
            // Held only while a session is pending; in Idle they belong to no session.
            None if matches!(self.phase, Phase::AwaitingConnection { .. }) => {
                self.pending_candidates.push(candidate);
                self.trim_pending();
                Vec::new()
            }
            None => Vec::new(),
        }
    }

    fn on_remote_candidates_removed(&mut self, candidates: &[IceCandidate]) -> Vec<Action> {
        let applied = match &mut self.phase {
            Phase::Negotiating(n) => Some(n.engine.remove_remote_ice_candidates(candidates)),
            Phase::Connected { engine, .. } => Some(engine.remove_remote_ice_candidates(candidates)),
            _ => None,
        };
        match applied {
            Some(Ok(())) => Vec::new(),
            Some(Err(e)) => self.fail(e.into()),
            None => {
                self.pending_candidates.retain(|c| !candidates.contains(c));
                Vec::new()
            }
        }
    }

    fn complete_if_ready(&mut self) -> Vec<Action> {
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Negotiating(n) if n.ready() => {
                self.phase = Phase::Connected {
                    role: n.role,
                    engine: n.engine,
                };
                vec![Action::StateChanged(SessionState::Connected)]
            }
            other => {
                self.phase = other;
                Vec::new()
            }
        }
    }

    fn trim_pending(&mut self) {
        if self.pending_candidates.len() > self.max_pending_candidates {
            let excess = self.pending_candidates.len() - self.max_pending_candidates;
            self.pending_candidates.drain(..excess);
        }
    }

    fn release_engine(&mut self) {
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Negotiating(mut n) => n.engine.close(),
            Phase::Connected { mut engine, .. } => engine.close(),
            other => self.phase = other,
        }
    }

    fn close(&mut self) -> Vec<Action> {
        if self.terminal_reported {
            return Vec::new();
        }
        self.terminal_reported = true;
        self.release_engine();
        self.phase = Phase::Closed;
        self.pending_candidates.clear();
        vec![Action::StateChanged(SessionState::Closed), Action::Closed]
    }

    fn fail(&mut self, error: SessionError) -> Vec<Action> {
        if self.terminal_reported {
            return Vec::new();
        }
        self.terminal_reported = true;
        self.release_engine();
        self.phase = Phase::Failed(error.clone());
        self.pending_candidates.clear();
        vec![
            Action::StateChanged(SessionState::Failed(error.clone())),
            Action::Failed(error),
        ]
    }
}

fn prime<E: CallEngine>(
    engine: &mut E,
    remote_offer: Option<&str>,
    pending: &[IceCandidate],
) -> Result<(), EngineError> {
    if let Some(sdp) = remote_offer {
        engine.set_remote_description(SdpType::Offer, sdp)?;
    }
    for candidate in pending {
        engine.add_remote_ice_candidate(candidate)?;
    }
    match remote_offer {
        Some(_) => engine.create_answer(),
        None => engine.create_offer(),
    }
}

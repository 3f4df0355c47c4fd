//! Duet call-setup reference implementation.
//! Host-driven: no I/O; host passes transport, message and engine events and receives actions.

pub mod codec;
pub mod engine;
pub mod protocol;
pub mod room;
pub mod session;
pub mod sim;
pub mod wire;

pub use codec::{
    decode_line, decode_message, encode_line, encode_message, DecodeError, EncodeError,
};
pub use engine::{CallEngine, CallEngineFactory, EngineError, EngineEvent, Role, SdpType};
pub use protocol::{
    Beacon, IceCandidate, MessageKind, SignalingMessage, DEFAULT_SERVICE_TYPE, DISCOVERY_VERSION,
};
pub use room::{parse_target, RoomConnectionParameters, TargetError};
pub use session::{
    Action, SendError, SessionCoordinator, SessionError, SessionState, SignalSink,
    DEFAULT_MAX_PENDING_CANDIDATES,
};
pub use sim::{EventEmitter, SimulatedEngine, SimulatedEngineFactory};
pub use wire::{decode_datagram, encode_datagram, DatagramError, MAX_DATAGRAM_LEN};

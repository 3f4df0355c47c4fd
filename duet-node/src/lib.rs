//! Duet node: LAN discovery, TCP signaling and the session task around `duet-core`.

pub mod config;
pub mod directory;
pub mod discovery;
pub mod node;
pub mod session;
pub mod signaling;

pub use config::{Config, ConfigError};
pub use directory::{DirectoryEvent, PeerDirectory, PeerRecord};
pub use discovery::{AdvertiserEvent, DiscoveryEvent, Registration};
pub use node::{Node, NodeError};
pub use session::{SessionCommand, SessionReport};
pub use signaling::{ChannelEvent, SignalingChannel, TransportError, CLOSE_ABNORMAL, CLOSE_NORMAL};

//! Duet wire protocol: signaling message types and discovery beacons.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current discovery beacon version. Beacons carrying another version are ignored.
pub const DISCOVERY_VERSION: u8 = 1;

/// Service type advertised and browsed on the local network.
pub const DEFAULT_SERVICE_TYPE: &str = "_fax._tcp.";

/// A connectivity candidate for the media transport. Opaque here; equality is exact on all fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IceCandidate {
    #[serde(rename = "sdpMid")]
    pub sdp_mid: String,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_m_line_index: u32,
    pub candidate: String,
}

impl IceCandidate {
    pub fn new(sdp_mid: impl Into<String>, sdp_m_line_index: u32, candidate: impl Into<String>) -> Self {
        Self {
            sdp_mid: sdp_mid.into(),
            sdp_m_line_index,
            candidate: candidate.into(),
        }
    }
}

/// Kind-specific payload of a signaling message. The `type` field on the wire selects the variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MessageKind {
    #[serde(rename = "offer")]
    Offer { sdp: String },
    #[serde(rename = "answer")]
    Answer { sdp: String },
    #[serde(rename = "candidate")]
    Candidate(IceCandidate),
    /// Removed candidates travel as one batch, in order.
    #[serde(rename = "remove-candidates")]
    RemoveCandidates { candidates: Vec<IceCandidate> },
    /// Ask the remote side to start the call as initiator.
    #[serde(rename = "call me")]
    CallMe,
    #[serde(rename = "bye")]
    Bye,
}

impl MessageKind {
    /// Every `type` value this protocol understands.
    pub const TYPES: [&'static str; 6] = [
        "offer",
        "answer",
        "candidate",
        "remove-candidates",
        "call me",
        "bye",
    ];

    /// Wire name of this kind (value of the `type` field).
    pub fn type_name(&self) -> &'static str {
        match self {
            MessageKind::Offer { .. } => "offer",
            MessageKind::Answer { .. } => "answer",
            MessageKind::Candidate(_) => "candidate",
            MessageKind::RemoveCandidates { .. } => "remove-candidates",
            MessageKind::CallMe => "call me",
            MessageKind::Bye => "bye",
        }
    }
}

/// One signaling message: routing room ids plus an immutable kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalingMessage {
    from: String,
    sendto: String,
    #[serde(flatten)]
    kind: MessageKind,
}

impl SignalingMessage {
    pub fn new(from: impl Into<String>, sendto: impl Into<String>, kind: MessageKind) -> Self {
        Self {
            from: from.into(),
            sendto: sendto.into(),
            kind,
        }
    }

    /// Message addressed from and to the same room, which is how both peers of a direct call address each other.
    pub fn in_room(room_id: &str, kind: MessageKind) -> Self {
        Self::new(room_id, room_id, kind)
    }

    pub fn from_room(&self) -> &str {
        &self.from
    }

    pub fn sendto(&self) -> &str {
        &self.sendto
    }

    pub fn kind(&self) -> &MessageKind {
        &self.kind
    }

    pub fn into_kind(self) -> MessageKind {
        self.kind
    }

    pub fn type_name(&self) -> &'static str {
        self.kind.type_name()
    }
}

/// Discovery datagrams. Encoding is bincode; framing is length-prefix (see wire module).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Beacon {
    /// Advertise a callable endpoint. `host` is optional; receivers fall back to the datagram source address.
    Announce {
        version: u8,
        service_type: String,
        instance: Uuid,
        name: String,
        host: Option<String>,
        port: u16,
    },
    /// Ask every advertiser of `service_type` to announce now.
    Query { version: u8, service_type: String },
    /// Advertiser is going away.
    Goodbye {
        version: u8,
        service_type: String,
        instance: Uuid,
        name: String,
    },
}

impl Beacon {
    pub fn version(&self) -> u8 {
        match self {
            Beacon::Announce { version, .. }
            | Beacon::Query { version, .. }
            | Beacon::Goodbye { version, .. } => *version,
        }
    }

    pub fn service_type(&self) -> &str {
        match self {
            Beacon::Announce { service_type, .. }
            | Beacon::Query { service_type, .. }
            | Beacon::Goodbye { service_type, .. } => service_type,
        }
    }

    /// True when this beacon is for `service_type` and speaks our version.
    pub fn is_for(&self, service_type: &str) -> bool {
        self.version() == DISCOVERY_VERSION && self.service_type() == service_type
    }
}

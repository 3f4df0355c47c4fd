//! Signaling codec: one JSON object per line.
//!
//! Decoding is lenient about extra fields but strict about the `type` field and
//! the fields that type requires.

use serde_json::Value;

use crate::protocol::{MessageKind, SignalingMessage};

/// Encode a message as a single JSON object (no trailing newline).
pub fn encode_message(msg: &SignalingMessage) -> Result<String, EncodeError> {
    Ok(serde_json::to_string(msg)?)
}

/// Encode a message as one line, newline terminated, ready for the stream.
pub fn encode_line(msg: &SignalingMessage) -> Result<String, EncodeError> {
    let mut line = encode_message(msg)?;
    line.push('\n');
    Ok(line)
}

/// Decode one raw line off the stream. Invalid UTF-8 is malformed, never patched up.
pub fn decode_line(line: &[u8]) -> Result<SignalingMessage, DecodeError> {
    let text = std::str::from_utf8(line).map_err(DecodeError::Utf8)?;
    decode_message(text)
}

/// Decode one JSON object. Surrounding whitespace (including the line terminator) is ignored.
pub fn decode_message(text: &str) -> Result<SignalingMessage, DecodeError> {
    let value: Value = serde_json::from_str(text.trim()).map_err(DecodeError::Syntax)?;
    let obj = value.as_object().ok_or(DecodeError::NotAnObject)?;
    let kind = match obj.get("type") {
        Some(Value::String(s)) => s.clone(),
        Some(_) | None => return Err(DecodeError::MissingType),
    };
    if !MessageKind::TYPES.contains(&kind.as_str()) {
        return Err(DecodeError::UnknownType(kind));
    }
    serde_json::from_value(value).map_err(|source| DecodeError::Invalid { kind, source })
}

#[derive(Debug, thiserror::Error)]
#[error("encode error: {0}")]
pub struct EncodeError(#[from] serde_json::Error);

/// Error decoding a signaling line.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("line is not valid UTF-8: {0}")]
    Utf8(std::str::Utf8Error),
    #[error("malformed JSON: {0}")]
    Syntax(serde_json::Error),
    #[error("message is not a JSON object")]
    NotAnObject,
    #[error("message has no string `type` field")]
    MissingType,
    #[error("unrecognized message type `{0}`")]
    UnknownType(String),
    #[error("invalid `{kind}` message: {source}")]
    Invalid {
        kind: String,
        source: serde_json::Error,
    },
}

impl DecodeError {
    /// True when the line was not JSON at all, as opposed to JSON that breaks the protocol.
    pub fn is_syntax(&self) -> bool {
        matches!(
            self,
            DecodeError::Utf8(_) | DecodeError::Syntax(_) | DecodeError::NotAnObject
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::IceCandidate;

    fn all_kinds() -> Vec<MessageKind> {
        vec![
            MessageKind::Offer {
                sdp: "v=0\r\no=- 1 2 IN IP4 127.0.0.1\r\n".into(),
            },
            MessageKind::Answer { sdp: "v=0\r\n".into() },
            MessageKind::Candidate(IceCandidate::new(
                "0",
                0,
                "candidate:1 1 udp 2122260223 192.168.1.20 50000 typ host",
            )),
            MessageKind::RemoveCandidates {
                candidates: vec![
                    IceCandidate::new("0", 0, "candidate:a"),
                    IceCandidate::new("1", 1, "candidate:b"),
                ],
            },
            MessageKind::CallMe,
            MessageKind::Bye,
        ]
    }

    #[test]
    fn every_kind_survives_encode_decode() {
        for kind in all_kinds() {
            let msg = SignalingMessage::new("r1", "r2", kind);
            let line = encode_line(&msg).unwrap();
            assert!(line.ends_with('\n'));
            assert_eq!(line.matches('\n').count(), 1, "sdp newlines must stay escaped");
            assert_eq!(decode_message(&line).unwrap(), msg);
        }
    }

    #[test]
    fn wire_field_names() {
        let msg = SignalingMessage::in_room(
            "r1",
            MessageKind::Candidate(IceCandidate::new("audio", 1, "candidate:x")),
        );
        let v: Value = serde_json::from_str(&encode_message(&msg).unwrap()).unwrap();
        assert_eq!(v["type"], "candidate");
        assert_eq!(v["sdpMid"], "audio");
        assert_eq!(v["sdpMLineIndex"], 1);
        assert_eq!(v["candidate"], "candidate:x");
        assert_eq!(v["from"], "r1");
        assert_eq!(v["sendto"], "r1");

        let call_me = SignalingMessage::in_room("r1", MessageKind::CallMe);
        let v: Value = serde_json::from_str(&encode_message(&call_me).unwrap()).unwrap();
        assert_eq!(v["type"], "call me");
    }

    #[test]
    fn decodes_foreign_json_with_extra_fields() {
        let text = r#"{"type":"offer","sdp":"v=0...","from":"r1","sendto":"r1","extra":true}"#;
        let msg = decode_message(text).unwrap();
        assert_eq!(msg.kind(), &MessageKind::Offer { sdp: "v=0...".into() });
        assert_eq!(msg.from_room(), "r1");
    }

    #[test]
    fn offer_without_sdp_is_invalid() {
        let err = decode_message(r#"{"type":"offer"}"#).unwrap_err();
        assert!(matches!(err, DecodeError::Invalid { ref kind, .. } if kind == "offer"));
        assert!(!err.is_syntax());
    }

    #[test]
    fn unknown_type_is_reported() {
        let err = decode_message(r#"{"type":"hello","from":"a","sendto":"b"}"#).unwrap_err();
        assert!(matches!(err, DecodeError::UnknownType(ref t) if t == "hello"));
    }

    #[test]
    fn missing_type_and_garbage() {
        assert!(matches!(
            decode_message(r#"{"from":"a","sendto":"b"}"#),
            Err(DecodeError::MissingType)
        ));
        assert!(decode_message("not json").unwrap_err().is_syntax());
        assert!(matches!(decode_message("[1,2]"), Err(DecodeError::NotAnObject)));
    }

    #[test]
    fn invalid_utf8_line_is_syntax_error() {
        let line = b"{\"type\":\"offer\",\"sdp\":\"v=0\xff\",\"from\":\"a\",\"sendto\":\"a\"}\n";
        let err = decode_line(line).unwrap_err();
        assert!(matches!(err, DecodeError::Utf8(_)));
        assert!(err.is_syntax());

        let ok = b"{\"type\":\"bye\",\"from\":\"a\",\"sendto\":\"a\"}\n";
        assert_eq!(decode_line(ok).unwrap().type_name(), "bye");
    }

    #[test]
    fn candidate_index_must_be_integer() {
        let text = r#"{"type":"candidate","sdpMid":"0","sdpMLineIndex":"zero","candidate":"c","from":"a","sendto":"a"}"#;
        assert!(matches!(decode_message(text), Err(DecodeError::Invalid { .. })));
    }
}

//! Beacon datagrams: one bincode-encoded `Beacon` per UDP payload, nothing else.

use bincode::Options;

use crate::protocol::Beacon;

/// Largest UDP payload over IPv4.
pub const MAX_DATAGRAM_LEN: usize = 65_507;

fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DATAGRAM_LEN as u64)
        .reject_trailing_bytes()
}

#[derive(Debug, thiserror::Error)]
pub enum DatagramError {
    #[error("beacon does not fit one datagram")]
    TooLarge,
    #[error("bincode: {0}")]
    Bincode(#[from] bincode::Error),
}

pub fn encode_datagram(beacon: &Beacon) -> Result<Vec<u8>, DatagramError> {
    options().serialize(beacon).map_err(|e| match *e {
        bincode::ErrorKind::SizeLimit => DatagramError::TooLarge,
        _ => DatagramError::Bincode(e),
    })
}

/// Decode a whole datagram. Truncated payloads and trailing garbage are both errors.
pub fn decode_datagram(bytes: &[u8]) -> Result<Beacon, DatagramError> {
    if bytes.len() > MAX_DATAGRAM_LEN {
        return Err(DatagramError::TooLarge);
    }
    Ok(options().deserialize(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{DEFAULT_SERVICE_TYPE, DISCOVERY_VERSION};
    use uuid::Uuid;

    fn announce(name: String) -> Beacon {
        Beacon::Announce {
            version: DISCOVERY_VERSION,
            service_type: DEFAULT_SERVICE_TYPE.into(),
            instance: Uuid::new_v4(),
            name,
            host: None,
            port: 8888,
        }
    }

    #[test]
    fn announce_fits_and_decodes() {
        let beacon = announce("kitchen".into());
        let bytes = encode_datagram(&beacon).unwrap();
        assert!(bytes.len() < 128);
        let decoded = decode_datagram(&bytes).unwrap();
        assert_eq!(decoded, beacon);
        assert!(decoded.is_for(DEFAULT_SERVICE_TYPE));
        assert!(!decoded.is_for("_other._tcp."));
    }

    #[test]
    fn truncated_or_padded_datagram_rejected() {
        let bytes = encode_datagram(&announce("kitchen".into())).unwrap();
        assert!(decode_datagram(&bytes[..bytes.len() - 1]).is_err());
        let mut padded = bytes.clone();
        padded.push(0);
        assert!(decode_datagram(&padded).is_err());
    }

    #[test]
    fn oversized_name_rejected() {
        let beacon = announce("x".repeat(MAX_DATAGRAM_LEN));
        assert!(matches!(encode_datagram(&beacon), Err(DatagramError::TooLarge)));
    }

    #[test]
    fn other_version_not_for_us() {
        let query = Beacon::Query {
            version: DISCOVERY_VERSION + 1,
            service_type: DEFAULT_SERVICE_TYPE.into(),
        };
        let decoded = decode_datagram(&encode_datagram(&query).unwrap()).unwrap();
        assert!(!decoded.is_for(DEFAULT_SERVICE_TYPE));
    }
}

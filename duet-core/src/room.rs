//! Room connection parameters: how a call attempt reaches its peer or identifies itself.

/// Immutable description of one call attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomConnectionParameters {
    room_uri: Option<String>,
    room_id: String,
    is_loopback: bool,
    url_parameters: Vec<(String, String)>,
}

impl RoomConnectionParameters {
    /// `room_uri` is the dial target; `None` means this side does not dial (listening or direct call).
    pub fn new(room_uri: Option<&str>, room_id: impl Into<String>, is_loopback: bool) -> Self {
        let url_parameters = room_uri.map(parse_query).unwrap_or_default();
        Self {
            room_uri: room_uri.map(str::to_owned),
            room_id: room_id.into(),
            is_loopback,
            url_parameters,
        }
    }

    /// Parameters for a side that only listens, identified by `room_id`.
    pub fn listening(room_id: impl Into<String>) -> Self {
        Self::new(None, room_id, false)
    }

    pub fn room_uri(&self) -> Option<&str> {
        self.room_uri.as_deref()
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn is_loopback(&self) -> bool {
        self.is_loopback
    }

    pub fn url_parameters(&self) -> &[(String, String)] {
        &self.url_parameters
    }

    /// First value of a query parameter of the room URI.
    pub fn url_parameter(&self, key: &str) -> Option<&str> {
        self.url_parameters
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Dial target as `(host, port)`, if this attempt dials.
    pub fn dial_target(&self) -> Option<Result<(String, u16), TargetError>> {
        self.room_uri.as_deref().map(parse_target)
    }
}

/// Parse a dial target. Accepts `ws://`, `wss://`, `http://`, `https://`, `tcp://` URIs
/// (path and query are ignored) or a bare `host:port`. IPv6 hosts must be bracketed.
pub fn parse_target(uri: &str) -> Result<(String, u16), TargetError> {
    let rest = uri.trim();
    let rest = match rest.split_once("://") {
        Some((scheme, rest)) => match scheme.to_ascii_lowercase().as_str() {
            "ws" | "wss" | "http" | "https" | "tcp" => rest,
            _ => return Err(TargetError::Scheme(scheme.to_owned())),
        },
        None => rest,
    };
    let authority = rest
        .split(['/', '?', '#'])
        .next()
        .unwrap_or_default();
    let (host, port) = if let Some(after) = authority.strip_prefix('[') {
        let (host, tail) = after
            .split_once(']')
            .ok_or_else(|| TargetError::Malformed(uri.to_owned()))?;
        let port = tail
            .strip_prefix(':')
            .ok_or_else(|| TargetError::MissingPort(uri.to_owned()))?;
        (host, port)
    } else {
        authority
            .rsplit_once(':')
            .ok_or_else(|| TargetError::MissingPort(uri.to_owned()))?
    };
    if host.is_empty() {
        return Err(TargetError::Malformed(uri.to_owned()));
    }
    let port: u16 = port
        .parse()
        .map_err(|_| TargetError::BadPort(port.to_owned()))?;
    Ok((host.to_owned(), port))
}

fn parse_query(uri: &str) -> Vec<(String, String)> {
    let Some((_, query)) = uri.split_once('?') else {
        return Vec::new();
    };
    let query = query.split('#').next().unwrap_or_default();
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_owned(), v.to_owned()),
            None => (pair.to_owned(), String::new()),
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TargetError {
    #[error("unsupported scheme `{0}`")]
    Scheme(String),
    #[error("malformed target `{0}`")]
    Malformed(String),
    #[error("target `{0}` has no port")]
    MissingPort(String),
    #[error("invalid port `{0}`")]
    BadPort(String),
}

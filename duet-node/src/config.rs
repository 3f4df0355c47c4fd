//! Load config from file and environment.

use serde::Deserialize;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use duet_core::{DEFAULT_MAX_PENDING_CANDIDATES, DEFAULT_SERVICE_TYPE};

/// Node configuration. File: ~/.config/duet/config.toml or /etc/duet/config.toml.
/// Env overrides: DUET_DEVICE_NAME, DUET_SIGNALING_PORT, DUET_DISCOVERY_PORT.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Name advertised on the local network (default "MyDevice").
    #[serde(default = "default_device_name")]
    pub device_name: String,
    /// Signaling TCP listen port (default 8888). 0 picks an ephemeral port.
    #[serde(default = "default_signaling_port")]
    pub signaling_port: u16,
    /// Discovery UDP port (default 45688).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    #[serde(default = "default_multicast_group")]
    pub multicast_group: Ipv4Addr,
    #[serde(default = "default_service_type")]
    pub service_type: String,
    #[serde(default = "default_announce_interval_ms")]
    pub announce_interval_ms: u64,
    /// A peer not heard from for this long is lost.
    #[serde(default = "default_peer_timeout_ms")]
    pub peer_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Remote candidates held before a call engine exists.
    #[serde(default = "default_max_pending_candidates")]
    pub max_pending_candidates: usize,
    /// Room id for outbound messages; generated when unset.
    #[serde(default)]
    pub room_id: Option<String>,
    /// Register this node on the local network.
    #[serde(default = "default_true")]
    pub advertise: bool,
    /// Browse for other nodes. With both flags off no multicast socket is opened.
    #[serde(default = "default_true")]
    pub discovery: bool,
}

fn default_device_name() -> String {
    "MyDevice".to_owned()
}
fn default_signaling_port() -> u16 {
    8888
}
fn default_discovery_port() -> u16 {
    45688
}
fn default_multicast_group() -> Ipv4Addr {
    Ipv4Addr::new(239, 255, 60, 61)
}
fn default_service_type() -> String {
    DEFAULT_SERVICE_TYPE.to_owned()
}
fn default_announce_interval_ms() -> u64 {
    2000
}
fn default_peer_timeout_ms() -> u64 {
    8000
}
fn default_connect_timeout_ms() -> u64 {
    5000
}
fn default_max_pending_candidates() -> usize {
    DEFAULT_MAX_PENDING_CANDIDATES
}
fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            signaling_port: default_signaling_port(),
            discovery_port: default_discovery_port(),
            multicast_group: default_multicast_group(),
            service_type: default_service_type(),
            announce_interval_ms: default_announce_interval_ms(),
            peer_timeout_ms: default_peer_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            max_pending_candidates: default_max_pending_candidates(),
            room_id: None,
            advertise: true,
            discovery: true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Load config: merge default, then the first config file found (if any), then env vars.
pub fn load() -> Result<Config, ConfigError> {
    let mut c = match config_paths().into_iter().find(|p| p.exists()) {
        Some(p) => load_from(&p)?,
        None => Config::default(),
    };
    apply_env(&mut c, |k| std::env::var(k).ok());
    Ok(c)
}

/// Load one explicit config file. Missing keys take their defaults.
pub fn load_from(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_owned(),
        source,
    })?;
    toml::from_str::<Config>(&s).map_err(|source| ConfigError::Parse {
        path: path.to_owned(),
        source,
    })
}

/// Apply env overrides. Unparseable values are ignored.
pub fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("DUET_DEVICE_NAME") {
        if !s.trim().is_empty() {
            c.device_name = s;
        }
    }
    if let Some(s) = var("DUET_SIGNALING_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.signaling_port = p;
        }
    }
    if let Some(s) = var("DUET_DISCOVERY_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.discovery_port = p;
        }
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/duet/config.toml"));
    }
    out.push(PathBuf::from("/etc/duet/config.toml"));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let c: Config = toml::from_str("device_name = \"kitchen\"\nsignaling_port = 9000\n").unwrap();
        assert_eq!(c.device_name, "kitchen");
        assert_eq!(c.signaling_port, 9000);
        assert_eq!(c.discovery_port, 45688);
        assert_eq!(c.multicast_group, Ipv4Addr::new(239, 255, 60, 61));
        assert_eq!(c.service_type, "_fax._tcp.");
        assert!(c.advertise && c.discovery);
        assert!(c.room_id.is_none());
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(toml::from_str::<Config>("proxy_port = 3128\n").is_err());
    }

    #[test]
    fn env_overrides() {
        let mut c = Config::default();
        apply_env(&mut c, |k| match k {
            "DUET_DEVICE_NAME" => Some("hall".into()),
            "DUET_SIGNALING_PORT" => Some("7000".into()),
            "DUET_DISCOVERY_PORT" => Some("not a port".into()),
            _ => None,
        });
        assert_eq!(c.device_name, "hall");
        assert_eq!(c.signaling_port, 7000);
        assert_eq!(c.discovery_port, 45688);
    }

    #[test]
    fn missing_file_is_read_error() {
        let err = load_from(Path::new("/nonexistent/duet/config.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}

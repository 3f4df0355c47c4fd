//! Peer directory: the set of callable peers currently visible on the LAN.

use std::sync::RwLock;

use tokio::sync::broadcast;

use crate::signaling::format_target;

/// A discovered, resolved peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub name: String,
    pub address: String,
    pub port: u16,
}

impl PeerRecord {
    pub fn new(name: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            port,
        }
    }

    /// Dial target for this peer (bare `host:port`, IPv6 bracketed).
    pub fn target(&self) -> String {
        format_target(&self.address, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryEvent {
    Added(PeerRecord),
    Changed(PeerRecord),
    Removed(String),
}

const EVENT_CAPACITY: usize = 64;

/// Insertion-ordered peer list keyed by name. Reads return copies.
pub struct PeerDirectory {
    peers: RwLock<Vec<PeerRecord>>,
    events: broadcast::Sender<DirectoryEvent>,
}

impl Default for PeerDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerDirectory {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            peers: RwLock::new(Vec::new()),
            events,
        }
    }

    /// Insert or update by name. Emits `Added` for a new name, `Changed` only when address or port differ.
    pub fn upsert(&self, record: PeerRecord) {
        let event = {
            let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
            match peers.iter_mut().find(|p| p.name == record.name) {
                Some(existing) if *existing == record => None,
                Some(existing) => {
                    *existing = record.clone();
                    Some(DirectoryEvent::Changed(record))
                }
                None => {
                    peers.push(record.clone());
                    Some(DirectoryEvent::Added(record))
                }
            }
        };
        if let Some(ev) = event {
            let _ = self.events.send(ev);
        }
    }

    /// Remove by name; no-op if absent.
    pub fn remove(&self, name: &str) {
        let removed = {
            let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
            let before = peers.len();
            peers.retain(|p| p.name != name);
            peers.len() != before
        };
        if removed {
            let _ = self.events.send(DirectoryEvent::Removed(name.to_owned()));
        }
    }

    pub fn list(&self) -> Vec<PeerRecord> {
        self.peers.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn get(&self, name: &str) -> Option<PeerRecord> {
        self.peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|p| p.name == name)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.peers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DirectoryEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_same_name_keeps_one_entry() {
        let dir = PeerDirectory::new();
        let mut rx = dir.subscribe();
        dir.upsert(PeerRecord::new("kitchen", "192.168.1.20", 8888));
        dir.upsert(PeerRecord::new("kitchen", "192.168.1.20", 8888));
        dir.upsert(PeerRecord::new("kitchen", "192.168.1.21", 8888));
        assert_eq!(dir.list(), vec![PeerRecord::new("kitchen", "192.168.1.21", 8888)]);

        assert!(matches!(rx.try_recv(), Ok(DirectoryEvent::Added(_))));
        assert!(matches!(rx.try_recv(), Ok(DirectoryEvent::Changed(ref p)) if p.address == "192.168.1.21"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn remove_absent_is_noop() {
        let dir = PeerDirectory::new();
        let mut rx = dir.subscribe();
        dir.remove("nobody");
        assert!(dir.is_empty());
        assert!(rx.try_recv().is_err());

        dir.upsert(PeerRecord::new("hall", "10.0.0.3", 8888));
        dir.remove("hall");
        assert!(dir.get("hall").is_none());
        rx.try_recv().unwrap();
        assert_eq!(rx.try_recv().unwrap(), DirectoryEvent::Removed("hall".into()));
    }

    #[test]
    fn list_keeps_insertion_order() {
        let dir = PeerDirectory::new();
        for name in ["c", "a", "b"] {
            dir.upsert(PeerRecord::new(name, "10.0.0.1", 8888));
        }
        let snapshot = dir.list();
        dir.remove("a");
        let names: Vec<_> = snapshot.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["c", "a", "b"]);
        assert_eq!(dir.len(), 2);
    }

    #[test]
    fn targets() {
        assert_eq!(PeerRecord::new("k", "192.168.1.20", 8888).target(), "192.168.1.20:8888");
        assert_eq!(PeerRecord::new("k", "fe80::1", 8888).target(), "[fe80::1]:8888");
    }
}

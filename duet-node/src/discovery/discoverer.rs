//! Discoverer: browse for advertisers, resolve each one independently, report changes.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use duet_core::{Beacon, DISCOVERY_VERSION};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{is_self, BeaconSocket};
use crate::directory::PeerRecord;

/// Turns an advertised host and port into a socket address.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, host: &str, port: u16) -> std::io::Result<SocketAddr>;
}

/// System resolver (literal addresses and host names).
pub struct DnsResolver;

#[async_trait]
impl Resolver for DnsResolver {
    async fn resolve(&self, host: &str, port: u16) -> std::io::Result<SocketAddr> {
        tokio::net::lookup_host((host, port))
            .await?
            .next()
            .ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::NotFound, format!("no address for {host}"))
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    Resolved(PeerRecord),
    Lost { name: String },
}

struct Seen {
    name: String,
    host: String,
    port: u16,
    last_seen: Instant,
    surfaced: bool,
}

#[derive(Debug, PartialEq, Eq)]
enum BrowseStep {
    Resolve {
        instance: Uuid,
        name: String,
        host: String,
        port: u16,
    },
    Lost {
        name: String,
    },
}

/// Browse bookkeeping, free of I/O.
struct Browser {
    peer_timeout: Duration,
    peers: HashMap<Uuid, Seen>,
}

impl Browser {
    fn new(peer_timeout: Duration) -> Self {
        Self {
            peer_timeout,
            peers: HashMap::new(),
        }
    }

    /// Resolve new or changed instances; refresh liveness of known ones.
    fn on_beacon(&mut self, beacon: Beacon, from: SocketAddr, now: Instant) -> Vec<BrowseStep> {
        match beacon {
            Beacon::Announce {
                instance,
                name,
                host,
                port,
                ..
            } => {
                let host = host.unwrap_or_else(|| from.ip().to_string());
                if let Some(seen) = self.peers.get_mut(&instance) {
                    seen.last_seen = now;
                    if seen.name == name && seen.host == host && seen.port == port {
                        return Vec::new();
                    }
                }
                let mut steps = Vec::new();
                let released = self
                    .peers
                    .remove(&instance)
                    .filter(|old| old.surfaced && old.name != name);
                if let Some(old) = released {
                    steps.push(self.release_name(old.name));
                }
                self.peers.insert(
                    instance,
                    Seen {
                        name: name.clone(),
                        host: host.clone(),
                        port,
                        last_seen: now,
                        surfaced: false,
                    },
                );
                steps.push(BrowseStep::Resolve {
                    instance,
                    name,
                    host,
                    port,
                });
                steps
            }
            Beacon::Goodbye { instance, .. } => match self.peers.remove(&instance) {
                Some(seen) if seen.surfaced => vec![self.release_name(seen.name)],
                _ => Vec::new(),
            },
            Beacon::Query { .. } => Vec::new(),
        }
    }

    /// Mark a resolution as surfaced if the instance is still current under `name`.
    fn on_resolved(&mut self, instance: Uuid, name: &str) -> bool {
        match self.peers.get_mut(&instance) {
            Some(seen) if seen.name == name => {
                seen.surfaced = true;
                true
            }
            _ => false,
        }
    }

    /// Drop instances not heard from within the peer timeout.
    fn expire(&mut self, now: Instant) -> Vec<BrowseStep> {
        let timeout = self.peer_timeout;
        let expired: Vec<Uuid> = self
            .peers
            .iter()
            .filter(|(_, s)| now.duration_since(s.last_seen) >= timeout)
            .map(|(id, _)| *id)
            .collect();
        let released: Vec<String> = expired
            .into_iter()
            .filter_map(|id| self.peers.remove(&id))
            .filter(|seen| seen.surfaced)
            .map(|seen| seen.name)
            .collect();
        released
            .into_iter()
            .map(|name| self.release_name(name))
            .collect()
    }

    /// An instance gave up `name`. The directory is keyed by name, so when another
    /// surfaced instance still holds it, re-resolve that one instead of losing the name.
    fn release_name(&mut self, name: String) -> BrowseStep {
        let holder = self
            .peers
            .iter()
            .find(|(_, seen)| seen.surfaced && seen.name == name)
            .map(|(id, seen)| (*id, seen.host.clone(), seen.port));
        match holder {
            Some((instance, host, port)) => BrowseStep::Resolve {
                instance,
                name,
                host,
                port,
            },
            None => BrowseStep::Lost { name },
        }
    }
}

pub struct Discoverer {
    socket: Arc<BeaconSocket>,
    resolver: Arc<dyn Resolver>,
    local_ip: Option<IpAddr>,
    peer_timeout: Duration,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
    task: Option<JoinHandle<()>>,
}

impl Discoverer {
    pub fn new(
        socket: Arc<BeaconSocket>,
        resolver: Arc<dyn Resolver>,
        local_ip: Option<IpAddr>,
        peer_timeout: Duration,
        events: mpsc::UnboundedSender<DiscoveryEvent>,
    ) -> Self {
        Self {
            socket,
            resolver,
            local_ip,
            peer_timeout,
            events,
            task: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    /// Start browsing and ask current advertisers to announce. Idempotent.
    pub async fn start_discovery(&mut self) {
        if self.task.is_some() {
            return;
        }
        let beacons = self.socket.subscribe();
        self.task = Some(tokio::spawn(browse(
            beacons,
            self.resolver.clone(),
            self.local_ip,
            self.peer_timeout,
            self.events.clone(),
        )));
        let query = Beacon::Query {
            version: DISCOVERY_VERSION,
            service_type: self.socket.service_type().to_owned(),
        };
        if let Err(e) = self.socket.send(&query).await {
            warn!(error = %e, "discovery query not sent");
        }
        info!(service_type = %self.socket.service_type(), "discovery started");
    }

    /// Stop browsing. In-flight resolutions are cancelled. Idempotent.
    pub fn stop_discovery(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            info!("discovery stopped");
        }
    }
}

impl Drop for Discoverer {
    fn drop(&mut self) {
        self.stop_discovery();
    }
}

type Resolution = (Uuid, String, std::io::Result<SocketAddr>);

async fn browse(
    mut beacons: broadcast::Receiver<(Beacon, SocketAddr)>,
    resolver: Arc<dyn Resolver>,
    local_ip: Option<IpAddr>,
    peer_timeout: Duration,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
) {
    let mut browser = Browser::new(peer_timeout);
    let mut resolving: JoinSet<Resolution> = JoinSet::new();
    let mut sweep = tokio::time::interval((peer_timeout / 2).max(Duration::from_millis(10)));
    loop {
        let steps = tokio::select! {
            recv = beacons.recv() => match recv {
                Ok((beacon, from)) => browser.on_beacon(beacon, from, Instant::now()),
                Err(RecvError::Lagged(n)) => {
                    warn!(skipped = n, "discoverer lagged behind beacons");
                    Vec::new()
                }
                Err(RecvError::Closed) => return,
            },
            _ = sweep.tick() => browser.expire(Instant::now()),
            Some(joined) = resolving.join_next(), if !resolving.is_empty() => {
                let Ok((instance, name, result)) = joined else {
                    continue;
                };
                match result {
                    Ok(addr) if is_self(addr.ip(), local_ip) => {
                        debug!(%name, %addr, "ignoring own advertisement");
                    }
                    Ok(addr) => {
                        if browser.on_resolved(instance, &name) {
                            info!(%name, %addr, "peer resolved");
                            let record = PeerRecord::new(name, addr.ip().to_string(), addr.port());
                            if events.send(DiscoveryEvent::Resolved(record)).is_err() {
                                return;
                            }
                        } else {
                            debug!(%name, "dropping stale resolution");
                        }
                    }
                    Err(e) => warn!(%name, error = %e, "resolve failed"),
                }
                Vec::new()
            }
        };
        for step in steps {
            match step {
                BrowseStep::Resolve {
                    instance,
                    name,
                    host,
                    port,
                } => {
                    debug!(%name, %host, port, "resolving");
                    let resolver = resolver.clone();
                    resolving.spawn(async move {
                        let result = resolver.resolve(&host, port).await;
                        (instance, name, result)
                    });
                }
                BrowseStep::Lost { name } => {
                    info!(%name, "peer lost");
                    if events.send(DiscoveryEvent::Lost { name }).is_err() {
                        return;
                    }
                }
            }
        }
    }
}

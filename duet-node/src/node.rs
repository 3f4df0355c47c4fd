//! Node lifecycle: everything one device runs, started and stopped as a unit.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use duet_core::{
    CallEngineFactory, EngineEvent, RoomConnectionParameters, SessionCoordinator,
    SimulatedEngineFactory,
};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::directory::PeerDirectory;
use crate::discovery::{
    self, Advertiser, AdvertiserEvent, AdvertiserStatus, BeaconSocket, Discoverer, DiscoveryEvent,
    DnsResolver, Registration,
};
use crate::session::{run_session, SessionCommand, SessionReport};
use crate::signaling::SignalingChannel;

const REPORT_CAPACITY: usize = 64;
const SESSION_DRAIN: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("signaling listen on port {port}: {source}")]
    Listen { port: u16, source: std::io::Error },
    #[error("no peer named `{0}`")]
    UnknownPeer(String),
    #[error("node is shut down")]
    Stopped,
}

pub struct Node {
    room_id: String,
    device_name: String,
    listen_addr: SocketAddr,
    local_ip: IpAddr,
    channel: SignalingChannel,
    directory: Arc<PeerDirectory>,
    advertiser: Option<Advertiser>,
    advertiser_status: AdvertiserStatus,
    discoverer: Option<Discoverer>,
    commands: mpsc::UnboundedSender<SessionCommand>,
    reports: broadcast::Sender<SessionReport>,
    session_task: JoinHandle<()>,
    directory_task: Option<JoinHandle<()>>,
}

impl Node {
    /// Start a node driving the simulated call engine.
    pub async fn start_simulated(config: Config) -> Result<Self, NodeError> {
        Self::start(config, |local_ip, events| {
            SimulatedEngineFactory::new(
                local_ip,
                Arc::new(move |ev: EngineEvent| {
                    let _ = events.send(ev);
                }),
            )
        })
        .await
    }

    /// Start listening, then the session task, then discovery. A listen failure is fatal;
    /// discovery failure leaves the node running dial-only.
    pub async fn start<F, M>(config: Config, make_factory: M) -> Result<Self, NodeError>
    where
        F: CallEngineFactory + 'static,
        M: FnOnce(IpAddr, mpsc::UnboundedSender<EngineEvent>) -> F,
    {
        let room_id = config
            .room_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        let (channel, channel_events) =
            SignalingChannel::new(Duration::from_millis(config.connect_timeout_ms));
        let listen_addr = match channel.listen(config.signaling_port).await {
            Ok(addr) => addr,
            Err(source) => {
                channel.shutdown().await;
                return Err(NodeError::Listen {
                    port: config.signaling_port,
                    source,
                });
            }
        };
        let local_ip = discovery::local_ip(config.multicast_group, config.discovery_port)
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));

        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        let mut coordinator = SessionCoordinator::new(
            room_id.clone(),
            make_factory(local_ip, engine_tx),
            channel.clone(),
        );
        coordinator.set_max_pending_candidates(config.max_pending_candidates);
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (reports, _) = broadcast::channel(REPORT_CAPACITY);
        let session_task = tokio::spawn(run_session(
            coordinator,
            channel.clone(),
            commands_rx,
            channel_events,
            engine_rx,
            reports.clone(),
        ));

        let mut node = Self {
            room_id,
            device_name: config.device_name.clone(),
            listen_addr,
            local_ip,
            channel,
            directory: Arc::new(PeerDirectory::new()),
            advertiser: None,
            advertiser_status: AdvertiserStatus::new(),
            discoverer: None,
            commands,
            reports,
            session_task,
            directory_task: None,
        };
        if config.advertise || config.discovery {
            node.start_discovery(&config).await;
        }
        info!(
            name = %node.device_name,
            addr = %node.listen_addr,
            room = %node.room_id,
            "node started"
        );
        Ok(node)
    }

    async fn start_discovery(&mut self, config: &Config) {
        let socket = match BeaconSocket::bind(
            config.multicast_group,
            config.discovery_port,
            &config.service_type,
        )
        .await
        {
            Ok(socket) => socket,
            Err(e) => {
                warn!(port = config.discovery_port, error = %e, "discovery unavailable, running dial-only");
                if config.advertise {
                    self.advertiser_status
                        .report(AdvertiserEvent::RegistrationFailed {
                            reason: format!("discovery port {}: {e}", config.discovery_port),
                        });
                }
                return;
            }
        };
        if config.advertise {
            let mut advertiser = Advertiser::new(
                socket.clone(),
                Duration::from_millis(config.announce_interval_ms),
                self.advertiser_status.clone(),
            );
            advertiser
                .start(&config.device_name, self.listen_addr.port())
                .await;
            self.advertiser = Some(advertiser);
        }
        if config.discovery {
            let (tx, rx) = mpsc::unbounded_channel();
            let mut discoverer = Discoverer::new(
                socket,
                Arc::new(DnsResolver),
                Some(self.local_ip),
                Duration::from_millis(config.peer_timeout_ms),
                tx,
            );
            discoverer.start_discovery().await;
            self.discoverer = Some(discoverer);
            self.directory_task = Some(tokio::spawn(feed_directory(rx, self.directory.clone())));
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn directory(&self) -> Arc<PeerDirectory> {
        self.directory.clone()
    }

    /// Name registered on the LAN, once registration succeeded.
    pub fn registered_name(&self) -> Option<String> {
        self.advertiser_status.current().name().map(str::to_owned)
    }

    /// Latest registration outcome, including one reached before any subscriber existed.
    pub fn registration(&self) -> watch::Receiver<Registration> {
        self.advertiser_status.watch()
    }

    pub fn advertiser_events(&self) -> broadcast::Receiver<AdvertiserEvent> {
        self.advertiser_status.subscribe()
    }

    pub fn subscribe_reports(&self) -> broadcast::Receiver<SessionReport> {
        self.reports.subscribe()
    }

    /// Request a call. With `target` this node dials; without it the node waits
    /// (or starts at once when `as_initiator` or `loopback` is set).
    pub fn connect(
        &self,
        target: Option<&str>,
        as_initiator: bool,
        loopback: bool,
    ) -> Result<(), NodeError> {
        let params = RoomConnectionParameters::new(target, self.room_id.clone(), loopback);
        self.commands
            .send(SessionCommand::Connect {
                params,
                as_initiator,
            })
            .map_err(|_| NodeError::Stopped)
    }

    /// Call a discovered peer by name.
    pub fn connect_to_peer(&self, name: &str) -> Result<(), NodeError> {
        let peer = self
            .directory
            .get(name)
            .ok_or_else(|| NodeError::UnknownPeer(name.to_owned()))?;
        self.connect(Some(&peer.target()), true, false)
    }

    pub fn hang_up(&self) -> Result<(), NodeError> {
        self.commands
            .send(SessionCommand::HangUp)
            .map_err(|_| NodeError::Stopped)
    }

    /// Stop advertising, stop discovery, end the session, then close the signaling channel.
    pub async fn shutdown(mut self) {
        if let Some(mut advertiser) = self.advertiser.take() {
            advertiser.stop().await;
        }
        if let Some(mut discoverer) = self.discoverer.take() {
            discoverer.stop_discovery();
        }
        if let Some(task) = self.directory_task.take() {
            task.abort();
        }
        let Self {
            channel,
            commands,
            session_task,
            ..
        } = self;
        drop(commands);
        let abort = session_task.abort_handle();
        if tokio::time::timeout(SESSION_DRAIN, session_task).await.is_err() {
            abort.abort();
        }
        channel.shutdown().await;
        info!("node stopped");
    }
}

async fn feed_directory(mut events: mpsc::UnboundedReceiver<DiscoveryEvent>, directory: Arc<PeerDirectory>) {
    while let Some(event) = events.recv().await {
        match event {
            DiscoveryEvent::Resolved(record) => directory.upsert(record),
            DiscoveryEvent::Lost { name } => directory.remove(&name),
        }
    }
}

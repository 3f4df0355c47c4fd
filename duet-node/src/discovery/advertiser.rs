//! Advertiser: announce this node's signaling port under a device name.

use std::sync::Arc;
use std::time::Duration;

use duet_core::{Beacon, DISCOVERY_VERSION};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use super::BeaconSocket;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvertiserEvent {
    /// Registered (or re-registered after a rename) under `name`.
    Registered { name: String },
    /// Not fatal; the node keeps working dial-only.
    RegistrationFailed { reason: String },
    Unregistered,
}

/// Latest registration outcome, readable at any time.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Registration {
    #[default]
    Inactive,
    Pending,
    Registered(String),
    Failed(String),
}

impl Registration {
    pub fn name(&self) -> Option<&str> {
        match self {
            Registration::Registered(name) => Some(name.as_str()),
            _ => None,
        }
    }

    fn apply(&mut self, event: &AdvertiserEvent) {
        *self = match event {
            AdvertiserEvent::Registered { name } => Registration::Registered(name.clone()),
            AdvertiserEvent::RegistrationFailed { reason } => Registration::Failed(reason.clone()),
            AdvertiserEvent::Unregistered => Registration::Inactive,
        };
    }
}

const EVENT_CAPACITY: usize = 16;

/// Where advertiser outcomes go: a broadcast for listeners plus a watch holding the latest.
/// Created before the discovery socket so a bind failure can be reported too.
#[derive(Clone)]
pub struct AdvertiserStatus {
    events: broadcast::Sender<AdvertiserEvent>,
    state: Arc<watch::Sender<Registration>>,
}

impl Default for AdvertiserStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl AdvertiserStatus {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (state, _) = watch::channel(Registration::Inactive);
        Self {
            events,
            state: Arc::new(state),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AdvertiserEvent> {
        self.events.subscribe()
    }

    pub fn watch(&self) -> watch::Receiver<Registration> {
        self.state.subscribe()
    }

    pub fn current(&self) -> Registration {
        self.state.borrow().clone()
    }

    fn set_pending(&self) {
        self.state.send_replace(Registration::Pending);
    }

    /// Record and broadcast one outcome.
    pub fn report(&self, event: AdvertiserEvent) {
        self.state.send_modify(|r| r.apply(&event));
        let _ = self.events.send(event);
    }
}

pub struct Advertiser {
    socket: Arc<BeaconSocket>,
    instance: Uuid,
    interval: Duration,
    status: AdvertiserStatus,
    task: Option<JoinHandle<()>>,
}

impl Advertiser {
    pub fn new(socket: Arc<BeaconSocket>, interval: Duration, status: AdvertiserStatus) -> Self {
        Self {
            socket,
            instance: Uuid::new_v4(),
            interval,
            status,
            task: None,
        }
    }

    pub fn instance(&self) -> Uuid {
        self.instance
    }

    /// Name actually registered; differs from the requested one after a collision.
    pub fn registered_name(&self) -> Option<String> {
        self.status.current().name().map(str::to_owned)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AdvertiserEvent> {
        self.status.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    /// Start announcing `name` for signaling port `port`. Restarts if already running.
    pub async fn start(&mut self, name: &str, port: u16) {
        self.stop().await;
        info!(%name, port, "advertising");
        self.status.set_pending();
        self.task = Some(tokio::spawn(advertise_loop(
            self.socket.clone(),
            Registrar::new(self.instance, name, port),
            self.interval,
            self.status.clone(),
        )));
    }

    /// Stop announcing and say goodbye. Idempotent.
    pub async fn stop(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        task.abort();
        let Some(name) = self.registered_name() else {
            self.status.state.send_modify(|r| {
                if *r == Registration::Pending {
                    *r = Registration::Inactive;
                }
            });
            return;
        };
        let goodbye = goodbye(self.instance, self.socket.service_type(), &name);
        if let Err(e) = self.socket.send(&goodbye).await {
            warn!(%name, error = %e, "goodbye not sent");
        }
        self.status.report(AdvertiserEvent::Unregistered);
        info!(%name, "unregistered");
    }
}

fn goodbye(instance: Uuid, service_type: &str, name: &str) -> Beacon {
    Beacon::Goodbye {
        version: DISCOVERY_VERSION,
        service_type: service_type.to_owned(),
        instance,
        name: name.to_owned(),
    }
}

/// Name to try on attempt `n` (1-based): `base`, then `base (2)`, `base (3)`, ...
pub fn next_candidate_name(base: &str, n: u32) -> String {
    if n <= 1 {
        base.to_owned()
    } else {
        format!("{base} ({n})")
    }
}

/// On a name clash the instance with the greater id renames.
pub fn should_yield(ours: Uuid, theirs: Uuid) -> bool {
    ours > theirs
}

/// Registration bookkeeping, free of I/O.
struct Registrar {
    instance: Uuid,
    base: String,
    port: u16,
    attempt: u32,
    name: String,
    /// The current name has been announced successfully.
    announced: bool,
    /// Any name has ever been announced successfully.
    registered: bool,
}

impl Registrar {
    fn new(instance: Uuid, base: &str, port: u16) -> Self {
        Self {
            instance,
            base: base.to_owned(),
            port,
            attempt: 1,
            name: base.to_owned(),
            announced: false,
            registered: false,
        }
    }

    /// React to a received beacon. True when we should announce now.
    fn on_beacon(&mut self, beacon: &Beacon) -> bool {
        match beacon {
            Beacon::Query { .. } => true,
            Beacon::Announce {
                instance: other,
                name: other_name,
                ..
            } if *other != self.instance && *other_name == self.name => {
                if !should_yield(self.instance, *other) {
                    return false;
                }
                self.attempt += 1;
                let renamed = next_candidate_name(&self.base, self.attempt);
                info!(taken = %self.name, renamed = %renamed, "name collision, renaming");
                self.name = renamed;
                self.announced = false;
                true
            }
            _ => false,
        }
    }

    fn announcement(&self, service_type: &str) -> Beacon {
        Beacon::Announce {
            version: DISCOVERY_VERSION,
            service_type: service_type.to_owned(),
            instance: self.instance,
            name: self.name.clone(),
            host: None,
            port: self.port,
        }
    }

    /// Outcome of sending an announcement. A failure before any registration ends advertising.
    fn on_sent(&mut self, result: &std::io::Result<()>) -> Option<AdvertiserEvent> {
        match result {
            Ok(()) if !self.announced => {
                self.announced = true;
                self.registered = true;
                Some(AdvertiserEvent::Registered {
                    name: self.name.clone(),
                })
            }
            Ok(()) => None,
            Err(e) if !self.registered => Some(AdvertiserEvent::RegistrationFailed {
                reason: e.to_string(),
            }),
            Err(e) => {
                warn!(name = %self.name, error = %e, "announce failed");
                None
            }
        }
    }
}

async fn advertise_loop(
    socket: Arc<BeaconSocket>,
    mut registrar: Registrar,
    interval: Duration,
    status: AdvertiserStatus,
) {
    let mut beacons = socket.subscribe();
    let mut ticker = tokio::time::interval(interval);
    loop {
        let announce_now = tokio::select! {
            _ = ticker.tick() => true,
            recv = beacons.recv() => match recv {
                Ok((beacon, _)) => registrar.on_beacon(&beacon),
                Err(RecvError::Lagged(n)) => {
                    warn!(skipped = n, "advertiser lagged behind beacons");
                    false
                }
                Err(RecvError::Closed) => return,
            },
        };
        if !announce_now {
            continue;
        }
        let result = socket.send(&registrar.announcement(socket.service_type())).await;
        match registrar.on_sent(&result) {
            Some(AdvertiserEvent::Registered { name }) => {
                info!(%name, port = registrar.port, "registered");
                status.report(AdvertiserEvent::Registered { name });
            }
            Some(failed @ AdvertiserEvent::RegistrationFailed { .. }) => {
                warn!(name = %registrar.name, ?failed, "registration failed");
                status.report(failed);
                return;
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duet_core::DEFAULT_SERVICE_TYPE;

    #[test]
    fn candidate_names() {
        assert_eq!(next_candidate_name("kitchen", 1), "kitchen");
        assert_eq!(next_candidate_name("kitchen", 2), "kitchen (2)");
        assert_eq!(next_candidate_name("kitchen", 3), "kitchen (3)");
    }

    #[test]
    fn greater_instance_yields() {
        let a = Uuid::from_u128(1);
        let b = Uuid::from_u128(2);
        assert!(should_yield(b, a));
        assert!(!should_yield(a, b));
        assert!(!should_yield(a, a));
    }

    fn announce_from(id: u128, name: &str) -> Beacon {
        Beacon::Announce {
            version: DISCOVERY_VERSION,
            service_type: DEFAULT_SERVICE_TYPE.into(),
            instance: Uuid::from_u128(id),
            name: name.into(),
            host: None,
            port: 9000,
        }
    }

    fn refused() -> std::io::Result<()> {
        Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "no route"))
    }

    #[test]
    fn first_announce_registers_once() {
        let mut r = Registrar::new(Uuid::from_u128(5), "kitchen", 8888);
        assert_eq!(
            r.on_sent(&Ok(())),
            Some(AdvertiserEvent::Registered {
                name: "kitchen".into()
            })
        );
        assert_eq!(r.on_sent(&Ok(())), None);
        match r.announcement(DEFAULT_SERVICE_TYPE) {
            Beacon::Announce { name, port, host, .. } => {
                assert_eq!(name, "kitchen");
                assert_eq!(port, 8888);
                assert_eq!(host, None);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn collision_renames_greater_instance_and_reregisters() {
        let mut r = Registrar::new(Uuid::from_u128(5), "kitchen", 8888);
        r.on_sent(&Ok(()));

        assert!(r.on_beacon(&announce_from(3, "kitchen")));
        assert_eq!(r.name, "kitchen (2)");
        assert_eq!(
            r.on_sent(&Ok(())),
            Some(AdvertiserEvent::Registered {
                name: "kitchen (2)".into()
            })
        );

        assert!(r.on_beacon(&announce_from(4, "kitchen (2)")));
        assert_eq!(r.name, "kitchen (3)");
    }

    #[test]
    fn smaller_instance_keeps_its_name() {
        let mut r = Registrar::new(Uuid::from_u128(1), "kitchen", 8888);
        assert!(!r.on_beacon(&announce_from(9, "kitchen")));
        assert!(!r.on_beacon(&announce_from(9, "hall")));
        assert!(!r.on_beacon(&announce_from(1, "kitchen")));
        assert_eq!(r.name, "kitchen");
    }

    #[test]
    fn query_triggers_announce() {
        let mut r = Registrar::new(Uuid::from_u128(1), "kitchen", 8888);
        let query = Beacon::Query {
            version: DISCOVERY_VERSION,
            service_type: DEFAULT_SERVICE_TYPE.into(),
        };
        assert!(r.on_beacon(&query));
        assert!(!r.on_beacon(&goodbye(Uuid::from_u128(2), DEFAULT_SERVICE_TYPE, "hall")));
    }

    #[test]
    fn send_failure_fatal_only_before_registration() {
        let mut r = Registrar::new(Uuid::from_u128(1), "kitchen", 8888);
        assert!(matches!(
            r.on_sent(&refused()),
            Some(AdvertiserEvent::RegistrationFailed { .. })
        ));

        let mut r = Registrar::new(Uuid::from_u128(5), "kitchen", 8888);
        r.on_sent(&Ok(()));
        r.on_beacon(&announce_from(3, "kitchen"));
        assert_eq!(r.on_sent(&refused()), None);
    }

    #[test]
    fn status_keeps_latest_outcome() {
        let status = AdvertiserStatus::new();
        let mut events = status.subscribe();
        let state = status.watch();
        assert_eq!(*state.borrow(), Registration::Inactive);

        status.set_pending();
        status.report(AdvertiserEvent::Registered {
            name: "kitchen".into(),
        });
        assert_eq!(status.current().name(), Some("kitchen"));
        assert_eq!(
            events.try_recv().unwrap(),
            AdvertiserEvent::Registered {
                name: "kitchen".into()
            }
        );

        status.report(AdvertiserEvent::Unregistered);
        assert_eq!(*state.borrow(), Registration::Inactive);
    }

    #[test]
    fn goodbye_names_the_registered_instance() {
        let id = Uuid::from_u128(7);
        assert_eq!(
            goodbye(id, DEFAULT_SERVICE_TYPE, "kitchen (2)"),
            Beacon::Goodbye {
                version: DISCOVERY_VERSION,
                service_type: DEFAULT_SERVICE_TYPE.into(),
                instance: id,
                name: "kitchen (2)".into(),
            }
        );
    }
}

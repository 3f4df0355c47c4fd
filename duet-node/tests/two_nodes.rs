//! End-to-end call setup between nodes over loopback TCP with the simulated engine.

use std::time::Duration;

use duet_core::{Role, SessionError, SessionState};
use duet_node::{Config, Node, NodeError, Registration, SessionReport};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::broadcast;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn test_config(name: &str) -> Config {
    Config {
        device_name: name.into(),
        signaling_port: 0,
        advertise: false,
        discovery: false,
        connect_timeout_ms: 2000,
        ..Config::default()
    }
}

/// Collect reports until one matches `done`.
async fn reports_until(
    rx: &mut broadcast::Receiver<SessionReport>,
    done: impl Fn(&SessionReport) -> bool,
) -> Vec<SessionReport> {
    let mut seen = Vec::new();
    loop {
        let report = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for session report")
            .expect("report channel closed");
        let finished = done(&report);
        seen.push(report);
        if finished {
            return seen;
        }
    }
}

fn is_connected(r: &SessionReport) -> bool {
    *r == SessionReport::StateChanged(SessionState::Connected)
}

fn target(node: &Node) -> String {
    format!("ws://127.0.0.1:{}/", node.listen_addr().port())
}

#[tokio::test]
async fn dialer_offers_listener_answers() {
    init_tracing();
    let kitchen = Node::start_simulated(test_config("kitchen")).await.unwrap();
    let hall = Node::start_simulated(test_config("hall")).await.unwrap();
    let mut k = kitchen.subscribe_reports();
    let mut h = hall.subscribe_reports();

    hall.connect(Some(&target(&kitchen)), true, false).unwrap();

    let hall_seen = reports_until(&mut h, is_connected).await;
    assert!(hall_seen.contains(&SessionReport::StateChanged(SessionState::Negotiating(
        Role::Initiator
    ))));
    let kitchen_seen = reports_until(&mut k, is_connected).await;
    assert_eq!(
        kitchen_seen[0],
        SessionReport::StateChanged(SessionState::Negotiating(Role::Responder))
    );

    hall.hang_up().unwrap();
    reports_until(&mut h, |r| *r == SessionReport::Closed).await;
    reports_until(&mut k, |r| *r == SessionReport::Closed).await;

    hall.shutdown().await;
    kitchen.shutdown().await;
}

#[tokio::test]
async fn dialer_can_ask_listener_to_call() {
    init_tracing();
    let kitchen = Node::start_simulated(test_config("kitchen")).await.unwrap();
    let hall = Node::start_simulated(test_config("hall")).await.unwrap();
    let mut k = kitchen.subscribe_reports();
    let mut h = hall.subscribe_reports();

    hall.connect(Some(&target(&kitchen)), false, false).unwrap();

    let kitchen_seen = reports_until(&mut k, is_connected).await;
    assert!(kitchen_seen.contains(&SessionReport::StateChanged(SessionState::Negotiating(
        Role::Initiator
    ))));
    let hall_seen = reports_until(&mut h, is_connected).await;
    assert!(hall_seen.contains(&SessionReport::StateChanged(SessionState::Negotiating(
        Role::Responder
    ))));

    hall.shutdown().await;
    reports_until(&mut k, |r| *r == SessionReport::Closed).await;
    kitchen.shutdown().await;
}

#[tokio::test]
async fn stray_inbound_peer_does_not_end_outbound_call() {
    init_tracing();
    let kitchen = Node::start_simulated(test_config("kitchen")).await.unwrap();
    let hall = Node::start_simulated(test_config("hall")).await.unwrap();
    let mut k = kitchen.subscribe_reports();
    let mut h = hall.subscribe_reports();

    hall.connect(Some(&target(&kitchen)), true, false).unwrap();
    reports_until(&mut h, is_connected).await;
    reports_until(&mut k, is_connected).await;

    let mut stray = TcpStream::connect(("127.0.0.1", hall.listen_addr().port()))
        .await
        .unwrap();
    stray.write_all(b"not json\n").await.unwrap();
    drop(stray);

    let quiet = tokio::time::timeout(Duration::from_millis(300), h.recv()).await;
    assert!(quiet.is_err(), "hall reported {quiet:?}");

    hall.hang_up().unwrap();
    reports_until(&mut h, |r| *r == SessionReport::Closed).await;
    reports_until(&mut k, |r| *r == SessionReport::Closed).await;
    hall.shutdown().await;
    kitchen.shutdown().await;
}

#[tokio::test]
async fn busy_discovery_port_is_reported_as_registration_failure() {
    init_tracing();
    let busy = std::net::UdpSocket::bind("0.0.0.0:0").unwrap();
    let config = Config {
        advertise: true,
        discovery_port: busy.local_addr().unwrap().port(),
        ..test_config("hall")
    };

    let hall = Node::start_simulated(config).await.unwrap();
    assert!(matches!(*hall.registration().borrow(), Registration::Failed(_)));
    assert!(hall.registered_name().is_none());
    hall.shutdown().await;
}

#[tokio::test]
async fn unreachable_target_fails_with_transport_error() {
    init_tracing();
    let unused = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = unused.local_addr().unwrap().port();
    drop(unused);

    let hall = Node::start_simulated(test_config("hall")).await.unwrap();
    let mut h = hall.subscribe_reports();
    hall.connect(Some(&format!("127.0.0.1:{port}")), true, false).unwrap();
    let seen = reports_until(&mut h, |r| matches!(r, SessionReport::Failed(_))).await;
    assert!(matches!(
        seen.last(),
        Some(SessionReport::Failed(SessionError::Transport(_)))
    ));
    hall.shutdown().await;
}

#[tokio::test]
async fn offer_without_sdp_is_protocol_error() {
    init_tracing();
    let kitchen = Node::start_simulated(test_config("kitchen")).await.unwrap();
    let mut k = kitchen.subscribe_reports();

    let mut raw = TcpStream::connect(("127.0.0.1", kitchen.listen_addr().port()))
        .await
        .unwrap();
    raw.write_all(b"{\"type\":\"offer\"}\n").await.unwrap();

    let seen = reports_until(&mut k, |r| matches!(r, SessionReport::Failed(_))).await;
    assert!(matches!(
        seen.last(),
        Some(SessionReport::Failed(SessionError::Protocol(_)))
    ));
    assert!(!seen.iter().any(|r| matches!(
        r,
        SessionReport::StateChanged(SessionState::Negotiating(_))
    )));
    kitchen.shutdown().await;
}

#[tokio::test]
async fn unknown_peer_is_rejected() {
    let hall = Node::start_simulated(test_config("hall")).await.unwrap();
    assert!(matches!(
        hall.connect_to_peer("kitchen"),
        Err(NodeError::UnknownPeer(_))
    ));
    assert!(hall.registered_name().is_none());
    hall.shutdown().await;
}

//! Session task: the single serialized context that owns the coordinator.
//! Commands, channel events and engine events are funnelled in over mpsc.

use std::collections::VecDeque;

use duet_core::{
    Action, CallEngineFactory, EngineEvent, RoomConnectionParameters, SessionCoordinator,
    SessionError, SessionState,
};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::signaling::{format_target, ChannelEvent, SignalingChannel};

#[derive(Debug)]
pub enum SessionCommand {
    Connect {
        params: RoomConnectionParameters,
        as_initiator: bool,
    },
    HangUp,
}

/// What the session loop tells observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionReport {
    StateChanged(SessionState),
    Failed(SessionError),
    Closed,
}

/// Drive `coordinator` until the command channel closes, then hang up.
pub async fn run_session<F>(
    mut coordinator: SessionCoordinator<F, SignalingChannel>,
    channel: SignalingChannel,
    mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    mut channel_events: mpsc::UnboundedReceiver<ChannelEvent>,
    mut engine_events: mpsc::UnboundedReceiver<EngineEvent>,
    reports: broadcast::Sender<SessionReport>,
) where
    F: CallEngineFactory + 'static,
{
    loop {
        let actions = tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(SessionCommand::Connect { params, as_initiator }) => {
                    if coordinator.state().is_terminal() {
                        coordinator.reset();
                    }
                    info!(room = %params.room_id(), target = ?params.room_uri(), as_initiator, "connect requested");
                    coordinator.connect(params, as_initiator)
                }
                Some(SessionCommand::HangUp) => coordinator.hang_up(),
                None => {
                    let actions = coordinator.hang_up();
                    apply(&mut coordinator, &channel, &reports, actions);
                    return;
                }
            },
            Some(event) = channel_events.recv() => on_channel_event(&mut coordinator, event),
            Some(event) = engine_events.recv() => {
                debug!(?event, "engine event");
                coordinator.on_engine_event(event)
            }
        };
        apply(&mut coordinator, &channel, &reports, actions);
    }
}

fn on_channel_event<F: CallEngineFactory>(
    coordinator: &mut SessionCoordinator<F, SignalingChannel>,
    event: ChannelEvent,
) -> Vec<Action> {
    match event {
        ChannelEvent::Open { outbound, peer } => {
            debug!(%peer, outbound, "transport open");
            coordinator.on_transport_open(outbound)
        }
        ChannelEvent::Message { outbound, msg } => {
            if !coordinator.accepts_from(outbound) {
                debug!(kind = msg.type_name(), "ignoring message from unrelated inbound peer");
                return Vec::new();
            }
            debug!(kind = msg.type_name(), from = msg.from_room(), "signaling message");
            coordinator.on_message(msg)
        }
        ChannelEvent::Malformed { outbound, error } => coordinator.on_malformed(outbound, &error),
        ChannelEvent::Closed {
            outbound,
            code,
            reason,
            remote,
        } => {
            if !coordinator.accepts_from(outbound) {
                debug!(code, %reason, "unrelated inbound connection closed");
            }
            coordinator.on_transport_closed(outbound, code, &reason, remote)
        }
        ChannelEvent::Error { outbound, reason } => coordinator.on_transport_error(outbound, &reason),
    }
}

/// Perform coordinator actions. Terminal actions release the transport and re-arm the coordinator.
fn apply<F: CallEngineFactory>(
    coordinator: &mut SessionCoordinator<F, SignalingChannel>,
    channel: &SignalingChannel,
    reports: &broadcast::Sender<SessionReport>,
    actions: Vec<Action>,
) {
    let mut queue: VecDeque<Action> = actions.into();
    while let Some(action) = queue.pop_front() {
        match action {
            Action::Dial { host, port } => {
                let target = format_target(&host, port);
                if let Err(e) = channel.dial(&target) {
                    queue.extend(coordinator.on_transport_error(true, &e.to_string()));
                }
            }
            Action::StateChanged(state) => {
                info!(?state, "session state");
                let _ = reports.send(SessionReport::StateChanged(state));
            }
            Action::Failed(e) => {
                error!(error = %e, "session failed");
                release(channel, coordinator.rides_outbound());
                let _ = reports.send(SessionReport::Failed(e));
                coordinator.reset();
            }
            Action::Closed => {
                info!("session closed");
                release(channel, coordinator.rides_outbound());
                let _ = reports.send(SessionReport::Closed);
                coordinator.reset();
            }
        }
    }
}

/// Close the connection the session ran over. Inbound peers stay up while the session was outbound.
fn release(channel: &SignalingChannel, outbound: bool) {
    channel.close_outbound();
    if !outbound && channel.inbound_count() > 0 {
        warn!(count = channel.inbound_count(), "closing inbound signaling connections");
        channel.close_inbound();
    }
}

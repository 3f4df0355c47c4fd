//! Signaling transport: TCP listener (any number of inbound peers) plus one
//! outbound connection, carrying newline-delimited JSON messages.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use duet_core::{
    decode_line, encode_line, parse_target, DecodeError, EncodeError, SendError,
    SignalSink, SignalingMessage, TargetError,
};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Orderly close (EOF or local close).
pub const CLOSE_NORMAL: u16 = 1000;
/// Connection dropped without an orderly close.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Join host and port into a dial target, bracketing IPv6 literals.
pub fn format_target(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

const MAX_LINE_LEN: u64 = 1024 * 1024;
const SHUTDOWN_GRACE: Duration = Duration::from_millis(250);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Transport events, surfaced uninterpreted. `outbound` tells which side of the channel it came from.
#[derive(Debug)]
pub enum ChannelEvent {
    Open { outbound: bool, peer: SocketAddr },
    Message { outbound: bool, msg: SignalingMessage },
    /// Line dropped; the connection stays open.
    Malformed { outbound: bool, error: DecodeError },
    Closed {
        outbound: bool,
        code: u16,
        reason: String,
        remote: bool,
    },
    Error { outbound: bool, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("sending message in non connected state")]
    NotConnected,
    #[error("invalid target: {0}")]
    InvalidTarget(#[from] TargetError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

enum Outgoing {
    Line(String),
    Close,
}

struct Conn {
    id: u64,
    tx: mpsc::UnboundedSender<Outgoing>,
    task: JoinHandle<()>,
    open: bool,
}

impl Conn {
    /// Graceful for open connections (queued lines are flushed first); dials are aborted.
    fn close(self) -> JoinHandle<()> {
        if self.open {
            let _ = self.tx.send(Outgoing::Close);
        } else {
            self.task.abort();
        }
        self.task
    }
}

#[derive(Default)]
struct State {
    outbound: Option<Conn>,
    inbound: Vec<Conn>,
    listener: Option<(SocketAddr, JoinHandle<()>)>,
}

struct Inner {
    events: mpsc::UnboundedSender<ChannelEvent>,
    connect_timeout: Duration,
    next_id: AtomicU64,
    state: Mutex<State>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: ChannelEvent) {
        let _ = self.events.send(event);
    }

    /// Mark a finished dial as open. False when it was closed meanwhile.
    fn mark_open(&self, id: u64) -> bool {
        match self.state().outbound.as_mut() {
            Some(conn) if conn.id == id => {
                conn.open = true;
                true
            }
            _ => false,
        }
    }

    /// Forget a connection. True when it was still registered (not closed locally).
    fn forget(&self, id: u64) -> bool {
        let mut state = self.state();
        if state.outbound.as_ref().is_some_and(|c| c.id == id) {
            state.outbound = None;
            return true;
        }
        let before = state.inbound.len();
        state.inbound.retain(|c| c.id != id);
        state.inbound.len() != before
    }
}

/// Dual-role signaling channel. Clones share the same connections.
#[derive(Clone)]
pub struct SignalingChannel {
    inner: Arc<Inner>,
}

impl SignalingChannel {
    pub fn new(connect_timeout: Duration) -> (Self, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            events,
            connect_timeout,
            next_id: AtomicU64::new(1),
            state: Mutex::new(State::default()),
        });
        (Self { inner }, rx)
    }

    /// Bind the signaling port and accept inbound peers. Returns the bound address.
    pub async fn listen(&self, port: u16) -> std::io::Result<SocketAddr> {
        if let Some(addr) = self.listen_addr() {
            return Ok(addr);
        }
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let addr = listener.local_addr()?;
        let task = tokio::spawn(accept_loop(listener, self.inner.clone()));
        info!(%addr, "signaling listening");
        let mut state = self.inner.state();
        if let Some((old, _)) = &state.listener {
            task.abort();
            return Ok(*old);
        }
        state.listener = Some((addr, task));
        Ok(addr)
    }

    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.inner.state().listener.as_ref().map(|(addr, _)| *addr)
    }

    /// Open the outbound connection to `target`, replacing any previous one.
    /// Returns immediately; the result arrives as `Open` or `Error`.
    pub fn dial(&self, target: &str) -> Result<(), TransportError> {
        let (host, port) = parse_target(target)?;
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.inner.state();
        if let Some(old) = state.outbound.take() {
            old.close();
        }
        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            debug!(%host, port, "dialing");
            let connect = TcpStream::connect((host.as_str(), port));
            let stream = match tokio::time::timeout(inner.connect_timeout, connect).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    inner.forget(id);
                    warn!(%host, port, error = %e, "dial failed");
                    inner.emit(ChannelEvent::Error {
                        outbound: true,
                        reason: format!("connect to {host}:{port}: {e}"),
                    });
                    return;
                }
                Err(_) => {
                    inner.forget(id);
                    warn!(%host, port, "dial timed out");
                    inner.emit(ChannelEvent::Error {
                        outbound: true,
                        reason: format!("connect to {host}:{port} timed out"),
                    });
                    return;
                }
            };
            if !inner.mark_open(id) {
                return;
            }
            run_connection(stream, id, true, rx, inner).await;
        });
        state.outbound = Some(Conn {
            id,
            tx,
            task,
            open: false,
        });
        Ok(())
    }

    /// Send one message. Prefers the outbound connection, else broadcasts to every inbound one.
    /// Never blocks or queues while unconnected.
    pub fn send(&self, msg: &SignalingMessage) -> Result<(), TransportError> {
        let line = encode_line(msg)?;
        let state = self.inner.state();
        if let Some(conn) = state.outbound.as_ref().filter(|c| c.open) {
            return conn
                .tx
                .send(Outgoing::Line(line))
                .map_err(|_| TransportError::NotConnected);
        }
        let mut delivered = false;
        for conn in state.inbound.iter().filter(|c| c.open) {
            delivered |= conn.tx.send(Outgoing::Line(line.clone())).is_ok();
        }
        if delivered {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }

    pub fn is_connected(&self) -> bool {
        let state = self.inner.state();
        state.outbound.as_ref().is_some_and(|c| c.open) || state.inbound.iter().any(|c| c.open)
    }

    pub fn inbound_count(&self) -> usize {
        self.inner.state().inbound.len()
    }

    /// Close the outbound connection, or abort a dial in progress.
    pub fn close_outbound(&self) {
        if let Some(conn) = self.inner.state().outbound.take() {
            conn.close();
        }
    }

    pub fn close_inbound(&self) {
        let conns = std::mem::take(&mut self.inner.state().inbound);
        for conn in conns {
            conn.close();
        }
    }

    /// Release the listening socket. Open inbound connections are unaffected.
    pub fn stop_listening(&self) {
        if let Some((addr, task)) = self.inner.state().listener.take() {
            task.abort();
            info!(%addr, "signaling listener closed");
        }
    }

    /// Close everything: outbound, then inbound, then the listener. Waits briefly for queued lines to flush.
    pub async fn shutdown(&self) {
        let mut tasks = Vec::new();
        {
            let mut state = self.inner.state();
            if let Some(conn) = state.outbound.take() {
                tasks.push(conn.close());
            }
            for conn in std::mem::take(&mut state.inbound) {
                tasks.push(conn.close());
            }
        }
        self.stop_listening();
        for task in tasks {
            let abort = task.abort_handle();
            if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
                abort.abort();
            }
        }
    }
}

impl SignalSink for SignalingChannel {
    fn send(&mut self, msg: SignalingMessage) -> Result<(), SendError> {
        SignalingChannel::send(self, &msg).map_err(|e| match e {
            TransportError::Encode(e) => SendError::Encode(e),
            _ => SendError::NotConnected,
        })
    }
}

/// Delay before the next accept after `failures` consecutive errors: 10ms doubling, capped.
fn accept_backoff(failures: u32) -> Duration {
    Duration::from_millis(10)
        .saturating_mul(1 << failures.min(16))
        .min(ACCEPT_BACKOFF_MAX)
}

/// Accept until the listener is released. Errors (fd exhaustion, aborted handshakes) are
/// retried after a backoff; they concern no session.
async fn accept_loop(listener: TcpListener, inner: Arc<Inner>) {
    let mut failures = 0;
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => {
                failures = 0;
                accepted
            }
            Err(e) => {
                let delay = accept_backoff(failures);
                failures = failures.saturating_add(1);
                warn!(error = %e, retry_in = ?delay, "accept failed");
                tokio::time::sleep(delay).await;
                continue;
            }
        };
        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        debug!(%peer, id, "accepted");
        let mut state = inner.state();
        let task = tokio::spawn(run_connection(stream, id, false, rx, inner.clone()));
        state.inbound.push(Conn {
            id,
            tx,
            task,
            open: true,
        });
        drop(state);
    }
}

/// Read lines and write queued messages until either side closes.
async fn run_connection(
    stream: TcpStream,
    id: u64,
    outbound: bool,
    mut rx: mpsc::UnboundedReceiver<Outgoing>,
    inner: Arc<Inner>,
) {
    let peer = match stream.peer_addr() {
        Ok(peer) => peer,
        Err(e) => {
            inner.forget(id);
            inner.emit(ChannelEvent::Error {
                outbound,
                reason: e.to_string(),
            });
            return;
        }
    };
    info!(%peer, outbound, "signaling connection open");
    inner.emit(ChannelEvent::Open { outbound, peer });

    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let closed = loop {
        let mut limited = (&mut reader).take(MAX_LINE_LEN + 1 - buf.len() as u64);
        tokio::select! {
            out = rx.recv() => match out {
                Some(Outgoing::Line(line)) => {
                    if let Err(e) = writer.write_all(line.as_bytes()).await {
                        break Err(e.to_string());
                    }
                }
                Some(Outgoing::Close) | None => {
                    let _ = writer.shutdown().await;
                    break Ok((CLOSE_NORMAL, "closed locally".to_owned(), false));
                }
            },
            read = limited.read_until(b'\n', &mut buf) => match read {
                Ok(n) => {
                    if buf.last() == Some(&b'\n') {
                        deliver_line(&inner, &buf, peer, outbound);
                        buf.clear();
                    } else if buf.len() as u64 > MAX_LINE_LEN {
                        break Err(format!("line exceeds {MAX_LINE_LEN} bytes"));
                    } else if n == 0 {
                        break Ok((CLOSE_NORMAL, "closed by peer".to_owned(), true));
                    }
                }
                Err(e) => break Err(e.to_string()),
            },
        }
    };

    let registered = inner.forget(id);
    match closed {
        Ok((code, reason, remote)) => {
            info!(%peer, outbound, code, %reason, "signaling connection closed");
            inner.emit(ChannelEvent::Closed {
                outbound,
                code,
                reason,
                remote: remote && registered,
            });
        }
        Err(reason) => {
            warn!(%peer, outbound, %reason, "signaling connection failed");
            inner.emit(ChannelEvent::Error {
                outbound,
                reason: reason.clone(),
            });
            inner.emit(ChannelEvent::Closed {
                outbound,
                code: CLOSE_ABNORMAL,
                reason,
                remote: true,
            });
        }
    }
}

fn deliver_line(inner: &Inner, line: &[u8], peer: SocketAddr, outbound: bool) {
    if line.iter().all(u8::is_ascii_whitespace) {
        return;
    }
    match decode_line(line) {
        Ok(msg) => {
            debug!(%peer, kind = msg.type_name(), "message received");
            inner.emit(ChannelEvent::Message { outbound, msg });
        }
        Err(error) => {
            warn!(%peer, %error, "malformed signaling line");
            inner.emit(ChannelEvent::Malformed { outbound, error });
        }
    }
}

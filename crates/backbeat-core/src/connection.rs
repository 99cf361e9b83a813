//! Connection lifecycle and socket pumps.
//!
//! Every accepted socket splits into two tasks that never share state
//! beyond the connection handle:
//!
//! ```text
//!   socket reads --> read_pump --> rate limit --> decode --> dispatch
//!   hub, handlers --> send() --> bounded queue --> write_pump --> socket writes
//! ```
//!
//! The pumps are the only tasks touching the socket halves. Everyone
//! else goes through [`Connection::send`], which enqueues without
//! blocking so a slow consumer shows up as a full queue instead of a
//! stalled hub.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use backbeat_protocol::payload::{error_code, AuthPayload, PingPayload, PongPayload};
use backbeat_protocol::{codec, kind, Envelope, Timestamp};
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::hub::Hub;
use crate::limiter::TokenBucket;
use crate::socket::{CloseReason, Inbound, SocketReader, SocketWriter};

/// Budget for a single socket write before the peer counts as stuck.
pub const WRITE_DEADLINE: Duration = Duration::from_secs(10);
/// How long the read pump waits for any traffic before declaring the
/// peer dead.
pub const READ_WINDOW: Duration = Duration::from_secs(60);
/// Interval between transport pings. Kept under [`READ_WINDOW`] so a
/// healthy peer always produces a pong in time.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(54);
/// Outbound queue capacity per connection.
pub const SEND_QUEUE_SIZE: usize = 256;

/// Per-connection timing and queue knobs.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub write_deadline: Duration,
    pub read_window: Duration,
    pub heartbeat_interval: Duration,
    pub send_queue_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            write_deadline: WRITE_DEADLINE,
            read_window: READ_WINDOW,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            send_queue_size: SEND_QUEUE_SIZE,
        }
    }
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Transport-level facts about the peer, captured at accept time.
#[derive(Debug, Clone, Default)]
pub struct PeerInfo {
    pub remote_addr: Option<String>,
    pub user_agent: Option<String>,
}

/// Why an enqueue failed.
#[derive(Debug, Error)]
pub enum SendError {
    /// The outbound queue is at capacity. Hub policy treats the peer as
    /// too slow and evicts it.
    #[error("outbound queue full")]
    BufferFull,

    /// The connection is closing or closed.
    #[error("connection closed")]
    Closed,

    /// The envelope could not be encoded.
    #[error(transparent)]
    Protocol(#[from] backbeat_protocol::ProtocolError),
}

/// One authenticated socket.
///
/// Shared as `Arc<Connection>` between the hub, the pumps, and any
/// registered handlers. All mutation goes through atomics or the
/// outbound queue, so every method takes `&self`.
pub struct Connection {
    id: ConnectionId,
    user_id: String,
    username: String,
    outbound: Mutex<Option<mpsc::Sender<Bytes>>>,
    connected_at: Timestamp,
    last_ping_ms: AtomicI64,
    peer: PeerInfo,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl Connection {
    /// Create a connection and the receiving end of its outbound queue.
    ///
    /// The receiver feeds [`write_pump`]; everything else holds the
    /// `Arc` and enqueues through [`Connection::send`].
    #[must_use]
    pub fn new(
        user_id: impl Into<String>,
        username: impl Into<String>,
        peer: PeerInfo,
        cancel: CancellationToken,
        config: &ConnectionConfig,
    ) -> (Arc<Self>, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(config.send_queue_size);
        let conn = Arc::new(Self {
            id: ConnectionId::next(),
            user_id: user_id.into(),
            username: username.into(),
            outbound: Mutex::new(Some(tx)),
            connected_at: Timestamp::now(),
            last_ping_ms: AtomicI64::new(0),
            peer,
            closed: AtomicBool::new(false),
            cancel,
        });
        (conn, rx)
    }

    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    #[must_use]
    pub fn peer(&self) -> &PeerInfo {
        &self.peer
    }

    #[must_use]
    pub fn connected_at(&self) -> Timestamp {
        self.connected_at
    }

    /// Last time the peer proved liveness, if it ever has.
    #[must_use]
    pub fn last_ping(&self) -> Option<Timestamp> {
        match self.last_ping_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Timestamp::from_unix_ms(ms),
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Token cancelled when this connection begins teardown.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Queue an envelope for delivery without blocking.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::BufferFull`] when the queue is at capacity
    /// and [`SendError::Closed`] once teardown has begun.
    pub fn send(&self, envelope: &Envelope) -> Result<(), SendError> {
        let frame = codec::encode(envelope)?;
        self.send_raw(frame)
    }

    /// Queue an already-encoded frame for delivery without blocking.
    ///
    /// The hub fan-out path uses this to encode once per broadcast
    /// instead of once per recipient.
    ///
    /// # Errors
    ///
    /// Same contract as [`Connection::send`].
    pub fn send_raw(&self, frame: Bytes) -> Result<(), SendError> {
        let guard = self
            .outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = guard.as_ref() else {
            return Err(SendError::Closed);
        };
        match tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(SendError::BufferFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SendError::Closed),
        }
    }

    /// Best-effort error reply. Failures are logged and swallowed so
    /// the read pump keeps serving the connection.
    pub fn send_error(&self, code: &str, message: impl Into<String>) {
        let envelope = Envelope::error(code, message);
        if let Err(err) = self.send(&envelope) {
            debug!(connection = %self.id, code, error = %err, "Failed to queue error reply");
        }
    }

    /// Begin teardown. Idempotent and safe from any task: the first
    /// call cancels the pumps and detaches the outbound queue, later
    /// calls return immediately.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        self.close_queue();
    }

    /// Detach the outbound sender. The write pump drains what is
    /// already queued, performs the close handshake, and exits.
    pub(crate) fn close_queue(&self) {
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    fn touch_ping(&self) {
        self.last_ping_ms
            .store(Timestamp::now().unix_ms(), Ordering::Relaxed);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("username", &self.username)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Drive the socket write half until the connection ends.
///
/// `biased` ordering matters: queued frames are flushed before the
/// cancellation arm is even polled, so a shutdown notice enqueued just
/// ahead of queue closure still reaches the peer.
pub async fn write_pump<W>(
    conn: Arc<Connection>,
    mut writer: W,
    mut outbound: mpsc::Receiver<Bytes>,
    config: ConnectionConfig,
) where
    W: SocketWriter,
{
    let cancel = conn.cancellation().clone();
    let mut heartbeat = tokio::time::interval_at(
        tokio::time::Instant::now() + config.heartbeat_interval,
        config.heartbeat_interval,
    );

    loop {
        tokio::select! {
            biased;

            maybe = outbound.recv() => match maybe {
                Some(frame) => match timeout(config.write_deadline, writer.send(frame)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        debug!(connection = %conn.id, error = %err, "Write failed");
                        break;
                    }
                    Err(_) => {
                        warn!(
                            connection = %conn.id,
                            deadline = ?config.write_deadline,
                            "Write stalled past deadline"
                        );
                        break;
                    }
                },
                None => {
                    // Queue closed and fully drained.
                    if let Err(err) = writer.close(CloseReason::Normal).await {
                        debug!(connection = %conn.id, error = %err, "Close handshake failed");
                    }
                    break;
                }
            },

            _ = heartbeat.tick() => {
                match timeout(config.write_deadline, writer.ping()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        debug!(connection = %conn.id, error = %err, "Ping failed");
                        break;
                    }
                    Err(_) => {
                        warn!(connection = %conn.id, "Ping stalled past deadline");
                        break;
                    }
                }
            }

            _ = cancel.cancelled() => {
                if let Err(err) = writer.close(CloseReason::GoingAway).await {
                    debug!(connection = %conn.id, error = %err, "Close handshake failed");
                }
                break;
            }
        }
    }

    conn.close();
}

/// Drive the socket read half until the connection ends, then
/// unregister from the hub.
///
/// Protocol failures (rate limit, bad JSON, unknown kind, handler
/// errors) answer with an `error` envelope and keep reading. Transport
/// failures and an elapsed read window terminate the pump.
pub async fn read_pump<R>(
    conn: Arc<Connection>,
    hub: Arc<Hub>,
    mut reader: R,
    mut limiter: TokenBucket,
    config: ConnectionConfig,
) where
    R: SocketReader,
{
    let cancel = conn.cancellation().clone();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            result = timeout(config.read_window, reader.recv()) => match result {
                Err(_) => {
                    warn!(
                        connection = %conn.id,
                        user = %conn.user_id,
                        window = ?config.read_window,
                        "No traffic inside read window"
                    );
                    break;
                }
                Ok(Ok(Some(Inbound::Pong))) => conn.touch_ping(),
                Ok(Ok(Some(Inbound::Frame(frame)))) => {
                    if !limiter.allow() {
                        debug!(connection = %conn.id, user = %conn.user_id, "Rate limit exceeded");
                        conn.send_error(error_code::RATE_LIMITED, "Too many messages, slow down");
                        hub.metrics().incr_errors();
                        continue;
                    }
                    hub.metrics().incr_received();

                    let envelope = match codec::decode(&frame) {
                        Ok(envelope) => envelope,
                        Err(err) => {
                            debug!(connection = %conn.id, error = %err, "Rejected inbound frame");
                            conn.send_error(error_code::INVALID_JSON, "Failed to parse message");
                            hub.metrics().incr_errors();
                            continue;
                        }
                    };
                    dispatch(&conn, &hub, envelope).await;
                }
                Ok(Ok(None)) => {
                    debug!(connection = %conn.id, user = %conn.user_id, "Peer closed connection");
                    break;
                }
                Ok(Err(err)) => {
                    if !conn.is_closed() {
                        error!(connection = %conn.id, error = %err, "Transport error");
                    }
                    break;
                }
            },
        }
    }

    hub.unregister(Arc::clone(&conn)).await;
    conn.close();
}

/// Route one decoded envelope.
async fn dispatch(conn: &Arc<Connection>, hub: &Arc<Hub>, envelope: Envelope) {
    match envelope.kind.as_str() {
        kind::PING | kind::HEARTBEAT => handle_ping(conn, &envelope),
        kind::AUTH => handle_auth(conn),
        other => {
            if let Some(handler) = hub.handler(other) {
                if let Err(err) = handler(Arc::clone(conn), envelope.clone()).await {
                    warn!(
                        connection = %conn.id,
                        kind = %envelope.kind,
                        error = %err,
                        "Handler failed"
                    );
                    conn.send_error(error_code::HANDLER_ERROR, "Failed to process message");
                    hub.metrics().incr_errors();
                }
            } else {
                debug!(connection = %conn.id, kind = %envelope.kind, "No handler for kind");
                conn.send_error(
                    error_code::UNKNOWN_TYPE,
                    format!("Unknown message type: {}", envelope.kind),
                );
                hub.metrics().incr_errors();
            }
        }
    }
}

/// Answer an application-level ping with a latency-annotated pong.
fn handle_ping(conn: &Arc<Connection>, envelope: &Envelope) {
    let ping: PingPayload = envelope.parse_payload().unwrap_or_default();
    conn.touch_ping();

    let server_time = Timestamp::now().unix_ms();
    let latency_ms = if ping.client_time > 0 {
        (server_time - ping.client_time).max(0)
    } else {
        0
    };
    let payload = PongPayload {
        client_time: ping.client_time,
        server_time,
        latency_ms,
    };

    let pong = match envelope.id.as_deref() {
        Some(id) => Envelope::reply(kind::PONG, payload, id),
        None => Envelope::new(kind::PONG, payload),
    };
    if let Err(err) = conn.send(&pong) {
        debug!(connection = %conn.id, error = %err, "Failed to queue pong");
    }
}

/// Confirm the identity established at the handshake. Re-auth over an
/// open connection is acknowledged but never changes the identity.
fn handle_auth(conn: &Arc<Connection>) {
    let ack = Envelope::new(
        kind::AUTH,
        AuthPayload {
            user_id: conn.user_id.clone(),
            status: "authenticated".to_string(),
        },
    );
    if let Err(err) = conn.send(&ack) {
        debug!(connection = %conn.id, error = %err, "Failed to queue auth ack");
    }
}

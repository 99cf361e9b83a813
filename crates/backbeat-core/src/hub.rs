//! The hub: a single-writer event loop over the connection registry.
//!
//! All registry mutation happens on one spawned task fed by bounded
//! command channels:
//!
//! ```text
//!   register ----\
//!   unregister ---\
//!   broadcast -----> event loop --> registry --> per-connection queues
//!   send_to_user -/
//! ```
//!
//! Readers (presence, HTTP surfaces) go through an `RwLock` around the
//! registry, which the loop holds only for the duration of one command.
//! Lifecycle events are emitted after the mutation lands, so anything
//! reacting to [`HubEvent::Connected`] already sees the connection in
//! the query surface.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use backbeat_protocol::payload::SystemPayload;
use backbeat_protocol::{codec, kind, Envelope, Timestamp};
use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::{Connection, ConnectionConfig, ConnectionId, SendError};
use crate::limiter::RateLimitConfig;
use crate::metrics::HubMetrics;

/// Capacity of each command channel feeding the event loop.
pub const COMMAND_QUEUE_SIZE: usize = 256;

/// Async callback invoked for envelopes of a registered kind.
pub type MessageHandler =
    Arc<dyn Fn(Arc<Connection>, Envelope) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Registry lifecycle notifications, emitted post-mutation.
#[derive(Debug, Clone)]
pub enum HubEvent {
    Connected(Arc<Connection>),
    Disconnected(Arc<Connection>),
}

/// Hub-wide configuration handed to every new connection.
#[derive(Debug, Clone, Default)]
pub struct HubConfig {
    pub connection: ConnectionConfig,
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Error)]
pub enum ShutdownError {
    /// Teardown did not finish inside the deadline. Connection tokens
    /// are cancelled anyway, so pumps still exit on their own.
    #[error("shutdown deadline of {0:?} expired")]
    DeadlineExpired(Duration),
}

struct Unicast {
    user_id: String,
    envelope: Envelope,
}

/// Connection indexes. Both views mutate under one write lock, so a
/// user key exists exactly when that user has at least one live
/// connection.
#[derive(Default)]
struct Registry {
    by_user: HashMap<String, HashMap<ConnectionId, Arc<Connection>>>,
    all: HashMap<ConnectionId, Arc<Connection>>,
}

impl Registry {
    fn insert(&mut self, conn: Arc<Connection>) {
        self.by_user
            .entry(conn.user_id().to_string())
            .or_default()
            .insert(conn.id(), Arc::clone(&conn));
        self.all.insert(conn.id(), conn);
    }

    /// Remove a connection, pruning the user bucket when it empties.
    /// Returns whether the connection was present at all.
    fn remove(&mut self, conn: &Connection) -> bool {
        let removed = self.all.remove(&conn.id()).is_some();
        if let Some(bucket) = self.by_user.get_mut(conn.user_id()) {
            bucket.remove(&conn.id());
            if bucket.is_empty() {
                self.by_user.remove(conn.user_id());
            }
        }
        removed
    }
}

/// Shared hub handle. Cheap to clone via `Arc`.
pub struct Hub {
    registry: RwLock<Registry>,
    handlers: RwLock<HashMap<String, MessageHandler>>,
    metrics: HubMetrics,
    rate_limit: RwLock<RateLimitConfig>,
    config: HubConfig,
    register_tx: mpsc::Sender<Arc<Connection>>,
    unregister_tx: mpsc::Sender<Arc<Connection>>,
    broadcast_tx: mpsc::Sender<Envelope>,
    unicast_tx: mpsc::Sender<Unicast>,
    events_tx: mpsc::UnboundedSender<HubEvent>,
    shutdown: CancellationToken,
    conn_root: CancellationToken,
    loop_task: Mutex<Option<JoinHandle<()>>>,
}

impl Hub {
    /// Spawn the event loop and return the shared handle plus the
    /// lifecycle event stream.
    #[must_use]
    pub fn start(config: HubConfig) -> (Arc<Self>, mpsc::UnboundedReceiver<HubEvent>) {
        let (register_tx, register_rx) = mpsc::channel(COMMAND_QUEUE_SIZE);
        let (unregister_tx, unregister_rx) = mpsc::channel(COMMAND_QUEUE_SIZE);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(COMMAND_QUEUE_SIZE);
        let (unicast_tx, unicast_rx) = mpsc::channel(COMMAND_QUEUE_SIZE);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let rate_limit = config.rate_limit;
        let hub = Arc::new(Self {
            registry: RwLock::new(Registry::default()),
            handlers: RwLock::new(HashMap::new()),
            metrics: HubMetrics::default(),
            rate_limit: RwLock::new(rate_limit),
            config,
            register_tx,
            unregister_tx,
            broadcast_tx,
            unicast_tx,
            events_tx,
            shutdown: CancellationToken::new(),
            conn_root: CancellationToken::new(),
            loop_task: Mutex::new(None),
        });

        let task = tokio::spawn(Arc::clone(&hub).run_event_loop(
            register_rx,
            unregister_rx,
            broadcast_rx,
            unicast_rx,
        ));
        *hub.loop_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);

        (hub, events_rx)
    }

    async fn run_event_loop(
        self: Arc<Self>,
        mut register_rx: mpsc::Receiver<Arc<Connection>>,
        mut unregister_rx: mpsc::Receiver<Arc<Connection>>,
        mut broadcast_rx: mpsc::Receiver<Envelope>,
        mut unicast_rx: mpsc::Receiver<Unicast>,
    ) {
        info!("Hub event loop started");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                Some(conn) = register_rx.recv() => self.apply_register(conn),
                Some(conn) = unregister_rx.recv() => self.apply_unregister(&conn),
                Some(envelope) = broadcast_rx.recv() => self.apply_broadcast(&envelope),
                Some(unicast) = unicast_rx.recv() => self.apply_unicast(&unicast),
            }
        }
        self.teardown();
        info!("Hub event loop stopped");
    }

    fn apply_register(&self, conn: Arc<Connection>) {
        self.write_registry().insert(Arc::clone(&conn));
        self.metrics.connection_opened();
        info!(
            connection = %conn.id(),
            user = %conn.user_id(),
            username = %conn.username(),
            remote_addr = conn.peer().remote_addr.as_deref().unwrap_or("unknown"),
            "Client connected"
        );
        self.emit(HubEvent::Connected(conn));
    }

    fn apply_unregister(&self, conn: &Arc<Connection>) {
        let removed = self.write_registry().remove(conn);
        if !removed {
            return;
        }
        conn.close_queue();
        self.metrics.connection_closed();

        let uptime_ms = Timestamp::now().unix_ms() - conn.connected_at().unix_ms();
        info!(
            connection = %conn.id(),
            user = %conn.user_id(),
            uptime_ms,
            "Client disconnected"
        );
        self.emit(HubEvent::Disconnected(Arc::clone(conn)));
    }

    fn apply_broadcast(&self, envelope: &Envelope) {
        let Some(frame) = self.encode_for_fanout(envelope) else {
            return;
        };

        let mut evicted = Vec::new();
        {
            let registry = self.read_registry();
            for conn in registry.all.values() {
                match conn.send_raw(frame.clone()) {
                    Ok(()) => self.metrics.incr_sent(),
                    Err(err) => evicted.push((Arc::clone(conn), matches!(err, SendError::BufferFull))),
                }
            }
        }
        self.evict(evicted);
    }

    fn apply_unicast(&self, unicast: &Unicast) {
        let Some(frame) = self.encode_for_fanout(&unicast.envelope) else {
            return;
        };

        let mut evicted = Vec::new();
        {
            let registry = self.read_registry();
            let Some(bucket) = registry.by_user.get(&unicast.user_id) else {
                // Target offline. Dropping silently is the contract.
                return;
            };
            for conn in bucket.values() {
                match conn.send_raw(frame.clone()) {
                    Ok(()) => self.metrics.incr_sent(),
                    Err(err) => evicted.push((Arc::clone(conn), matches!(err, SendError::BufferFull))),
                }
            }
        }
        self.evict(evicted);
    }

    /// Encode once per fan-out; recipients share the buffer.
    fn encode_for_fanout(&self, envelope: &Envelope) -> Option<bytes::Bytes> {
        match codec::encode(envelope) {
            Ok(frame) => Some(frame),
            Err(err) => {
                warn!(kind = %envelope.kind, error = %err, "Dropping unencodable envelope");
                self.metrics.incr_errors();
                None
            }
        }
    }

    fn evict(&self, evicted: Vec<(Arc<Connection>, bool)>) {
        for (conn, was_full) in evicted {
            if was_full {
                warn!(
                    connection = %conn.id(),
                    user = %conn.user_id(),
                    "Evicting slow consumer with full queue"
                );
                self.metrics.incr_dropped();
            } else {
                debug!(connection = %conn.id(), "Dropping already-closed connection");
            }
            self.apply_unregister(&conn);
        }
    }

    /// Notify every connection, detach every queue, clear the registry.
    fn teardown(&self) {
        let notice = Envelope::new(
            kind::SYSTEM,
            SystemPayload {
                event: "server_shutdown".to_string(),
                message: Some("Server is shutting down".to_string()),
                data: None,
            },
        );
        let frame = codec::encode(&notice).ok();

        let mut registry = self.write_registry();
        let connections: Vec<_> = registry.all.values().cloned().collect();
        for conn in &connections {
            if let Some(frame) = &frame {
                if let Err(err) = conn.send_raw(frame.clone()) {
                    debug!(connection = %conn.id(), error = %err, "Shutdown notice not delivered");
                }
            }
            conn.close_queue();
        }
        registry.all.clear();
        registry.by_user.clear();
        drop(registry);

        self.metrics.reset_active();
        // Backstop for read pumps. Write pumps exit by draining their
        // detached queues, close notice included.
        self.conn_root.cancel();
        info!(connections = connections.len(), "Hub teardown complete");
    }

    fn emit(&self, event: HubEvent) {
        // Nobody consuming lifecycle events is a valid deployment.
        let _ = self.events_tx.send(event);
    }

    /// Ask the event loop to admit a connection.
    ///
    /// Resolves once the command is queued, not once it is applied; the
    /// event stream signals when the registry change lands.
    pub async fn register(&self, conn: Arc<Connection>) {
        self.submit(&self.register_tx, conn, "register").await;
    }

    /// Ask the event loop to drop a connection. Unknown connections are
    /// ignored, so racing exits are harmless.
    pub async fn unregister(&self, conn: Arc<Connection>) {
        self.submit(&self.unregister_tx, conn, "unregister").await;
    }

    /// Fan an envelope out to every connection.
    pub async fn broadcast(&self, envelope: Envelope) {
        self.submit(&self.broadcast_tx, envelope, "broadcast").await;
    }

    /// Fan an envelope out to every connection of one user. A user with
    /// no connections receives nothing and no error.
    pub async fn send_to_user(&self, user_id: impl Into<String>, envelope: Envelope) {
        let unicast = Unicast {
            user_id: user_id.into(),
            envelope,
        };
        self.submit(&self.unicast_tx, unicast, "send_to_user").await;
    }

    async fn submit<T: Send>(&self, tx: &mpsc::Sender<T>, command: T, name: &'static str) {
        tokio::select! {
            result = tx.send(command) => {
                if result.is_err() {
                    debug!(command = name, "Hub event loop gone; command dropped");
                }
            }
            _ = self.shutdown.cancelled() => {
                debug!(command = name, "Hub shutting down; command dropped");
            }
        }
    }

    #[must_use]
    pub fn is_user_online(&self, user_id: &str) -> bool {
        self.read_registry().by_user.contains_key(user_id)
    }

    #[must_use]
    pub fn user_connection_count(&self, user_id: &str) -> usize {
        self.read_registry()
            .by_user
            .get(user_id)
            .map_or(0, HashMap::len)
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.read_registry().all.len()
    }

    #[must_use]
    pub fn online_users(&self) -> Vec<String> {
        self.read_registry().by_user.keys().cloned().collect()
    }

    /// Register the handler invoked for envelopes of `kind`, replacing
    /// any previous one.
    pub fn register_handler<F, Fut>(&self, kind: impl Into<String>, handler: F)
    where
        F: Fn(Arc<Connection>, Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler: MessageHandler = Arc::new(
            move |conn, envelope| -> BoxFuture<'static, anyhow::Result<()>> {
                Box::pin(handler(conn, envelope))
            },
        );
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind.into(), handler);
    }

    #[must_use]
    pub fn handler(&self, kind: &str) -> Option<MessageHandler> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(kind)
            .cloned()
    }

    #[must_use]
    pub fn metrics(&self) -> &HubMetrics {
        &self.metrics
    }

    /// Cancellation token for a new connection, cancelled wholesale
    /// when the hub tears down.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.conn_root.child_token()
    }

    #[must_use]
    pub fn connection_config(&self) -> ConnectionConfig {
        self.config.connection.clone()
    }

    #[must_use]
    pub fn rate_limit_config(&self) -> RateLimitConfig {
        *self
            .rate_limit
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies to connections accepted after the call; live connections
    /// keep the bucket they were born with.
    pub fn set_rate_limit_config(&self, config: RateLimitConfig) {
        *self
            .rate_limit
            .write()
            .unwrap_or_else(PoisonError::into_inner) = config;
    }

    /// Stop the event loop, notify every connection, and wait for
    /// teardown to finish.
    ///
    /// # Errors
    ///
    /// Returns [`ShutdownError::DeadlineExpired`] when teardown does
    /// not finish inside `deadline`.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), ShutdownError> {
        info!(deadline = ?deadline, "Hub shutdown requested");
        self.shutdown.cancel();

        let task = self
            .loop_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(task) = task else {
            // Shutdown already ran to completion once.
            return Ok(());
        };

        match tokio::time::timeout(deadline, task).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                warn!(error = %err, "Hub event loop failed during shutdown");
                Ok(())
            }
            Err(_) => {
                self.conn_root.cancel();
                Err(ShutdownError::DeadlineExpired(deadline))
            }
        }
    }

    fn read_registry(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_registry(&self) -> RwLockWriteGuard<'_, Registry> {
        self.registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

//! HTTP surface and WebSocket lifecycle.
//!
//! Routes:
//! - `GET /ws` upgrades to the realtime protocol (token required)
//! - `GET /health` liveness probe
//! - `GET /stats` hub counters and online population
//! - `POST /status/online` bulk online lookup
//! - `POST /status/presence` bulk presence lookup

use std::collections::HashMap;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use backbeat_core::{
    read_pump, write_pump, Connection, FollowerDirectory, Hub, PeerInfo, PresenceTracker,
    TokenBucket,
};
use backbeat_protocol::{kind, Envelope, SystemPayload, Timestamp, TypingPayload, PROTOCOL_VERSION};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::auth::{bearer_token, AuthError, Authenticator, Identity};
use crate::config::Config;
use crate::metrics;
use crate::ws;

/// How long a draining hub may hold the process open.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

/// Shared server state.
pub struct AppState {
    pub hub: Arc<Hub>,
    pub presence: Arc<PresenceTracker>,
    pub auth: Arc<dyn Authenticator>,
    pub config: Config,
}

impl AppState {
    /// Wire up the hub, the presence tracker, and the typing handlers.
    #[must_use]
    pub fn new(
        config: Config,
        auth: Arc<dyn Authenticator>,
        directory: Arc<dyn FollowerDirectory>,
    ) -> Self {
        let (hub, events) = Hub::start(config.hub_config());
        let presence = PresenceTracker::start(
            Arc::clone(&hub),
            events,
            Arc::clone(&directory),
            config.presence_config(),
        );
        register_typing_handlers(
            &hub,
            &presence,
            &directory,
            config.presence.follower_fanout_limit,
        );

        Self {
            hub,
            presence,
            auth,
            config,
        }
    }
}

/// Build the router over shared state.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/status/online", post(online_status_handler))
        .route("/status/presence", post(presence_status_handler))
        .with_state(state)
}

/// Run the server until a shutdown signal, then drain the hub.
///
/// # Errors
///
/// Returns an error if the listener cannot bind or the accept loop
/// fails.
pub async fn run_server(
    config: Config,
    auth: Arc<dyn Authenticator>,
    directory: Arc<dyn FollowerDirectory>,
) -> Result<()> {
    if config.metrics.enabled {
        if let Err(err) = metrics::start_metrics_server(config.metrics.port) {
            error!(error = %err, "Failed to start metrics exporter");
        }
    }

    let addr = config.bind_addr();
    let state = Arc::new(AppState::new(config, auth, directory));
    let hub = Arc::clone(&state.hub);
    let presence = Arc::clone(&state.presence);

    let listener = TcpListener::bind(addr).await?;
    info!("Backbeat server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}/ws", addr);

    let server = axum::serve(
        listener,
        app(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .into_future();
    tokio::select! {
        result = server => result?,
        () = shutdown_signal() => {
            info!("Shutdown signal received");
        }
    }

    presence.shutdown();
    match hub.shutdown(SHUTDOWN_DEADLINE).await {
        Ok(()) => info!("Hub drained"),
        Err(err) => warn!(error = %err, "Hub teardown incomplete"),
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

/// Authenticate and upgrade a WebSocket request.
///
/// Credentials are checked before the upgrade so a refusal is an
/// ordinary 401 response, never an open-then-closed socket.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let Some(token) = bearer_token(&query, &headers) else {
        metrics::record_handshake("missing_credentials");
        return unauthorized(&AuthError::MissingCredentials);
    };

    let identity = match state.auth.authenticate(&token).await {
        Ok(identity) => identity,
        Err(err) => {
            warn!(error = %err, "Handshake refused");
            metrics::record_handshake("refused");
            return unauthorized(&err);
        }
    };
    metrics::record_handshake("ok");

    let peer = peer_info(&headers, addr);
    ws.max_message_size(state.config.limits.max_frame_bytes)
        .on_upgrade(move |socket| handle_socket(socket, state, identity, peer))
}

fn unauthorized(err: &AuthError) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({
            "error": "authentication_failed",
            "message": err.to_string(),
        })),
    )
        .into_response()
}

/// Best available peer address: proxy headers win over the socket.
fn peer_info(headers: &HeaderMap, addr: SocketAddr) -> PeerInfo {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());
    let real_ip = headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    PeerInfo {
        remote_addr: Some(forwarded.or(real_ip).unwrap_or_else(|| addr.to_string())),
        user_agent: headers
            .get(header::USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string),
    }
}

/// Drive one socket from upgrade to teardown.
async fn handle_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    identity: Identity,
    peer: PeerInfo,
) {
    let (reader, writer) = ws::split(socket);

    let connection_config = state.hub.connection_config();
    let (conn, outbound) = Connection::new(
        identity.user_id,
        identity.username,
        peer,
        state.hub.child_token(),
        &connection_config,
    );

    state.hub.register(Arc::clone(&conn)).await;
    send_welcome(&conn);

    let limiter = TokenBucket::from_config(&state.hub.rate_limit_config());
    let writer_task = tokio::spawn(write_pump(
        Arc::clone(&conn),
        writer,
        outbound,
        connection_config.clone(),
    ));

    read_pump(
        Arc::clone(&conn),
        Arc::clone(&state.hub),
        reader,
        limiter,
        connection_config,
    )
    .await;

    if let Err(err) = writer_task.await {
        debug!(connection = %conn.id(), error = %err, "Write pump task aborted");
    }
    debug!(connection = %conn.id(), "Socket task finished");
}

fn send_welcome(conn: &Arc<Connection>) {
    let welcome = Envelope::new(
        kind::SYSTEM,
        SystemPayload {
            event: "connected".to_string(),
            message: Some("Connected to Backbeat".to_string()),
            data: Some(serde_json::json!({
                "user_id": conn.user_id(),
                "username": conn.username(),
                "session_id": conn.id().to_string(),
                "server_time": Timestamp::now(),
                "protocol": PROTOCOL_VERSION,
            })),
        },
    );
    if let Err(err) = conn.send(&welcome) {
        warn!(connection = %conn.id(), error = %err, "Failed to queue welcome");
    }
}

/// Optional fields a client may attach to a typing indicator.
#[derive(Debug, Default, Deserialize)]
struct TypingReport {
    #[serde(default)]
    context: Option<String>,
}

/// Typing indicators fan out to followers the same way presence does,
/// stamped with the sender's authenticated identity rather than
/// anything client-supplied.
fn register_typing_handlers(
    hub: &Arc<Hub>,
    presence: &Arc<PresenceTracker>,
    directory: &Arc<dyn FollowerDirectory>,
    fanout_limit: usize,
) {
    for typing_kind in [kind::TYPING_START, kind::TYPING_STOP] {
        let hub_handle = Arc::clone(hub);
        let presence_handle = Arc::clone(presence);
        let directory_handle = Arc::clone(directory);
        hub.register_handler(typing_kind, move |conn, envelope| {
            let hub = Arc::clone(&hub_handle);
            let presence = Arc::clone(&presence_handle);
            let directory = Arc::clone(&directory_handle);
            async move {
                let report: TypingReport = envelope.parse_payload().unwrap_or_default();
                // Typing is activity; keep the sweeper off this user.
                presence.heartbeat(conn.user_id());

                let followers = directory.followers_of(conn.user_id(), fanout_limit).await?;
                if followers.is_empty() {
                    return Ok(());
                }

                let notice = Envelope::new(
                    typing_kind,
                    TypingPayload {
                        user_id: conn.user_id().to_string(),
                        username: conn.username().to_string(),
                        context: report.context,
                    },
                );
                for follower in followers {
                    if hub.is_user_online(&follower) {
                        hub.send_to_user(follower, notice.clone()).await;
                    }
                }
                Ok(())
            }
        });
    }
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "connections": state.hub.connection_count(),
        "online_users": state.hub.online_users().len(),
        "metrics": state.hub.metrics().snapshot(),
    }))
}

#[derive(Debug, Deserialize)]
struct StatusRequest {
    user_ids: Vec<String>,
}

async fn online_status_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<StatusRequest>,
) -> impl IntoResponse {
    let online: HashMap<String, bool> = request
        .user_ids
        .into_iter()
        .map(|user_id| {
            let is_online = state.hub.is_user_online(&user_id);
            (user_id, is_online)
        })
        .collect();
    Json(serde_json::json!({ "online": online }))
}

async fn presence_status_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<StatusRequest>,
) -> impl IntoResponse {
    Json(serde_json::json!({
        "presence": state.presence.presence_of(&request.user_ids),
    }))
}

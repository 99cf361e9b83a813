//! End-to-end tests over a real listener and a real WebSocket client.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use backbeat_core::{RateLimitConfig, StaticDirectory};
use backbeat_protocol::{
    decode, error_code, kind, Envelope, ErrorPayload, PongPayload, SystemPayload, TypingPayload,
};
use backbeat_server::auth::{Claims, JwtAuthenticator};
use backbeat_server::config::Config;
use backbeat_server::handlers::{app, AppState};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

const SECRET: &str = "integration-secret";

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn mint_token(user_id: &str, username: &str, ttl_secs: i64) -> String {
    let claims = Claims {
        user_id: user_id.to_string(),
        username: Some(username.to_string()),
        exp: chrono::Utc::now().timestamp() + ttl_secs,
    };
    jsonwebtoken::encode(
        &jsonwebtoken::Header::default(),
        &claims,
        &jsonwebtoken::EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap()
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.auth.jwt_secret = SECRET.to_string();
    config.metrics.enabled = false;
    config
}

async fn start_server(config: Config, directory: StaticDirectory) -> (SocketAddr, Arc<AppState>) {
    let auth = Arc::new(JwtAuthenticator::new(&config.auth.jwt_secret));
    let state = Arc::new(AppState::new(config, auth, Arc::new(directory)));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let served = Arc::clone(&state);
    tokio::spawn(async move {
        axum::serve(
            listener,
            app(served).into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    (addr, state)
}

async fn connect(addr: SocketAddr, token: &str) -> WsClient {
    let (client, _response) = connect_async(format!("ws://{addr}/ws?token={token}"))
        .await
        .expect("handshake failed");
    client
}

async fn recv_envelope(client: &mut WsClient) -> Envelope {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(2), client.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("transport error");
        match message {
            Message::Text(text) => return decode(text.as_bytes()).expect("undecodable frame"),
            Message::Ping(_) | Message::Pong(_) => {}
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Skip frames until one of the wanted kind arrives.
async fn recv_until(client: &mut WsClient, wanted: &str) -> Envelope {
    for _ in 0..16 {
        let envelope = recv_envelope(client).await;
        if envelope.kind == wanted {
            return envelope;
        }
    }
    panic!("no {wanted} envelope within 16 frames");
}

async fn wait_until(mut probe: impl FnMut() -> bool) {
    for _ in 0..200 {
        if probe() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_handshake_requires_token() {
    let (addr, _state) = start_server(test_config(), StaticDirectory::new()).await;

    let err = connect_async(format!("ws://{addr}/ws")).await.unwrap_err();
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status().as_u16(), 401);
        }
        other => panic!("expected an HTTP refusal, got {other:?}"),
    }
}

#[tokio::test]
async fn test_handshake_rejects_expired_token() {
    let (addr, _state) = start_server(test_config(), StaticDirectory::new()).await;
    let expired = mint_token("user-1", "ada", -3600);

    let err = connect_async(format!("ws://{addr}/ws?token={expired}"))
        .await
        .unwrap_err();
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status().as_u16(), 401);
        }
        other => panic!("expected an HTTP refusal, got {other:?}"),
    }
}

#[tokio::test]
async fn test_welcome_after_handshake() {
    let (addr, state) = start_server(test_config(), StaticDirectory::new()).await;
    let mut client = connect(addr, &mint_token("user-1", "ada", 3600)).await;

    let envelope = recv_envelope(&mut client).await;
    assert_eq!(envelope.kind, kind::SYSTEM);

    let system: SystemPayload = envelope.parse_payload().unwrap();
    assert_eq!(system.event, "connected");
    let data = system.data.unwrap();
    assert_eq!(data["user_id"], "user-1");
    assert_eq!(data["username"], "ada");
    assert_eq!(data["protocol"], backbeat_protocol::PROTOCOL_VERSION);

    wait_until(|| state.hub.is_user_online("user-1")).await;
}

#[tokio::test]
async fn test_ping_pong_roundtrip() {
    let (addr, _state) = start_server(test_config(), StaticDirectory::new()).await;
    let mut client = connect(addr, &mint_token("user-1", "ada", 3600)).await;
    let _welcome = recv_envelope(&mut client).await;

    let ping = serde_json::json!({
        "type": "ping",
        "id": "ping-1",
        "payload": { "client_time": chrono::Utc::now().timestamp_millis() },
    });
    client.send(Message::Text(ping.to_string())).await.unwrap();

    let envelope = recv_envelope(&mut client).await;
    assert_eq!(envelope.kind, kind::PONG);
    assert_eq!(envelope.reply_to.as_deref(), Some("ping-1"));

    let pong: PongPayload = envelope.parse_payload().unwrap();
    assert!(pong.server_time > 0);
    assert!(pong.latency_ms >= 0);
}

#[tokio::test]
async fn test_unknown_kind_keeps_connection_usable() {
    let (addr, _state) = start_server(test_config(), StaticDirectory::new()).await;
    let mut client = connect(addr, &mint_token("user-1", "ada", 3600)).await;
    let _welcome = recv_envelope(&mut client).await;

    client
        .send(Message::Text(
            r#"{"type":"definitely_not_a_thing"}"#.to_string(),
        ))
        .await
        .unwrap();

    let envelope = recv_envelope(&mut client).await;
    assert_eq!(envelope.kind, kind::ERROR);
    let error: ErrorPayload = envelope.parse_payload().unwrap();
    assert_eq!(error.code, error_code::UNKNOWN_TYPE);

    // The refusal is a reply, not a hangup.
    let ping = serde_json::json!({ "type": "ping" });
    client.send(Message::Text(ping.to_string())).await.unwrap();
    let envelope = recv_envelope(&mut client).await;
    assert_eq!(envelope.kind, kind::PONG);
}

#[tokio::test]
async fn test_malformed_frame_keeps_connection_usable() {
    let (addr, _state) = start_server(test_config(), StaticDirectory::new()).await;
    let mut client = connect(addr, &mint_token("user-1", "ada", 3600)).await;
    let _welcome = recv_envelope(&mut client).await;

    client
        .send(Message::Text("{not json".to_string()))
        .await
        .unwrap();

    let envelope = recv_envelope(&mut client).await;
    assert_eq!(envelope.kind, kind::ERROR);
    let error: ErrorPayload = envelope.parse_payload().unwrap();
    assert_eq!(error.code, error_code::INVALID_JSON);

    let ping = serde_json::json!({ "type": "ping" });
    client.send(Message::Text(ping.to_string())).await.unwrap();
    let envelope = recv_envelope(&mut client).await;
    assert_eq!(envelope.kind, kind::PONG);
}

#[tokio::test]
async fn test_rate_limit_produces_error_reply() {
    let mut config = test_config();
    config.limits.rate = RateLimitConfig {
        max_per_second: 1,
        burst: 2,
    };
    let (addr, _state) = start_server(config, StaticDirectory::new()).await;
    let mut client = connect(addr, &mint_token("spammer", "spam", 3600)).await;
    let _welcome = recv_envelope(&mut client).await;

    let ping = serde_json::json!({ "type": "ping" }).to_string();
    for _ in 0..5 {
        client.send(Message::Text(ping.clone())).await.unwrap();
    }

    let mut pongs = 0;
    let mut rejections = 0;
    for _ in 0..5 {
        let envelope = recv_envelope(&mut client).await;
        match envelope.kind.as_str() {
            k if k == kind::PONG => pongs += 1,
            k if k == kind::ERROR => {
                let error: ErrorPayload = envelope.parse_payload().unwrap();
                assert_eq!(error.code, error_code::RATE_LIMITED);
                rejections += 1;
            }
            other => panic!("unexpected kind {other}"),
        }
    }
    assert!(pongs >= 2, "burst should admit at least two pings");
    assert!(rejections >= 1, "overflow should be refused");
}

#[tokio::test]
async fn test_typing_indicator_reaches_follower() {
    let directory = StaticDirectory::new().with_follower("alice", "bob");
    let (addr, state) = start_server(test_config(), directory).await;

    let mut bob = connect(addr, &mint_token("bob", "Bob", 3600)).await;
    let _welcome = recv_envelope(&mut bob).await;
    wait_until(|| state.hub.is_user_online("bob")).await;

    let mut alice = connect(addr, &mint_token("alice", "Alice", 3600)).await;
    let _welcome = recv_envelope(&mut alice).await;

    let typing = serde_json::json!({
        "type": "typing_start",
        "payload": { "context": "studio-7" },
    });
    alice.send(Message::Text(typing.to_string())).await.unwrap();

    let envelope = recv_until(&mut bob, kind::TYPING_START).await;
    let payload: TypingPayload = envelope.parse_payload().unwrap();
    assert_eq!(payload.user_id, "alice");
    assert_eq!(payload.username, "Alice");
    assert_eq!(payload.context.as_deref(), Some("studio-7"));
}

#[tokio::test]
async fn test_follower_sees_presence_transitions() {
    let directory = StaticDirectory::new().with_follower("alice", "bob");
    let (addr, state) = start_server(test_config(), directory).await;

    let mut bob = connect(addr, &mint_token("bob", "Bob", 3600)).await;
    let _welcome = recv_envelope(&mut bob).await;
    wait_until(|| state.hub.is_user_online("bob")).await;

    let mut alice = connect(addr, &mint_token("alice", "Alice", 3600)).await;
    let _welcome = recv_envelope(&mut alice).await;

    let online = recv_until(&mut bob, kind::USER_ONLINE).await;
    assert_eq!(online.payload["user_id"], "alice");

    alice.close(None).await.unwrap();

    let offline = recv_until(&mut bob, kind::USER_OFFLINE).await;
    assert_eq!(offline.payload["user_id"], "alice");
    wait_until(|| !state.hub.is_user_online("alice")).await;
}

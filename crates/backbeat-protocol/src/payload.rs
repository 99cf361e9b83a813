//! Typed payload shapes for well-known envelope kinds.
//!
//! Payloads travel opaquely inside [`crate::Envelope`] and are reshaped
//! on demand, so producers of new event kinds never touch this module.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::timestamp::Timestamp;

/// Stable machine-readable codes carried in [`ErrorPayload::code`].
pub mod error_code {
    /// Frame was not valid JSON or not a valid envelope.
    pub const INVALID_JSON: &str = "invalid_json";
    /// Sender exhausted its token bucket.
    pub const RATE_LIMITED: &str = "rate_limited";
    /// No handler registered for the envelope kind.
    pub const UNKNOWN_TYPE: &str = "unknown_type";
    /// A registered handler failed.
    pub const HANDLER_ERROR: &str = "handler_error";
}

/// User presence states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Offline,
    /// Active inside a studio session; carries the app context label.
    InStudio,
}

impl PresenceStatus {
    /// The wire form of this status.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceStatus::Online => "online",
            PresenceStatus::Offline => "offline",
            PresenceStatus::InStudio => "in_studio",
        }
    }
}

impl fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of `error` envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Machine-readable code (`rate_limited`, `invalid_json`, ...).
    pub code: String,
    pub message: String,
}

/// Payload of client `ping` envelopes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingPayload {
    /// Sender's clock in Unix milliseconds; 0 when the client omits it.
    #[serde(default)]
    pub client_time: i64,
}

/// Payload of server `pong` replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PongPayload {
    pub client_time: i64,
    pub server_time: i64,
    /// Server-observed one-way latency; 0 when the ping carried no clock.
    pub latency_ms: i64,
}

/// Payload of `auth` acknowledgements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthPayload {
    pub user_id: String,
    pub status: String,
}

/// Payload of presence envelopes (`presence`, `user_online`,
/// `user_offline`, `user_in_studio`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresencePayload {
    pub user_id: String,
    pub status: PresenceStatus,
    /// App or DAW label shown alongside studio presence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    pub timestamp: Timestamp,
}

/// Payload of `system` envelopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemPayload {
    /// What happened (`connected`, `server_shutdown`).
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Payload of typing indicator envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingPayload {
    pub user_id: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presence_status_wire_form() {
        assert_eq!(
            serde_json::to_string(&PresenceStatus::InStudio).unwrap(),
            "\"in_studio\""
        );
        assert_eq!(
            serde_json::from_str::<PresenceStatus>("\"online\"").unwrap(),
            PresenceStatus::Online
        );
        assert_eq!(PresenceStatus::Offline.to_string(), "offline");
    }

    #[test]
    fn test_ping_payload_defaults_client_time() {
        let payload: PingPayload = serde_json::from_str("{}").unwrap();
        assert_eq!(payload.client_time, 0);
    }

    #[test]
    fn test_presence_payload_omits_empty_context() {
        let payload = PresencePayload {
            user_id: "u1".into(),
            status: PresenceStatus::Online,
            context: None,
            timestamp: Timestamp::from_unix_ms(1_700_000_000_000).unwrap(),
        };
        let encoded = serde_json::to_string(&payload).unwrap();
        assert!(!encoded.contains("context"));

        let decoded: PresencePayload = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_system_payload_shapes() {
        let bare: SystemPayload = serde_json::from_str(r#"{"event":"connected"}"#).unwrap();
        assert_eq!(bare.event, "connected");
        assert!(bare.message.is_none());
        assert!(bare.data.is_none());
    }
}

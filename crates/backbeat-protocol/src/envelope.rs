//! Wire envelope for hub traffic.
//!
//! Every WebSocket text frame carries exactly one JSON envelope. The
//! `type` vocabulary is open: unknown values decode fine and are
//! rejected at dispatch time, never at the codec.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::ProtocolError;
use crate::payload::ErrorPayload;
use crate::timestamp::Timestamp;

/// Well-known envelope `type` values.
///
/// The hub produces or consumes these directly. Everything else is
/// routed through the handler registry, so the namespace stays open
/// for new event kinds.
pub mod kind {
    /// Server lifecycle notices (welcome, shutdown).
    pub const SYSTEM: &str = "system";
    pub const PING: &str = "ping";
    /// Alias for `ping` still sent by older clients.
    pub const HEARTBEAT: &str = "heartbeat";
    pub const PONG: &str = "pong";
    pub const ERROR: &str = "error";
    /// Re-authentication over an established connection.
    pub const AUTH: &str = "auth";

    /// Explicit presence report from a client.
    pub const PRESENCE: &str = "presence";
    pub const USER_ONLINE: &str = "user_online";
    pub const USER_OFFLINE: &str = "user_offline";
    pub const USER_IN_STUDIO: &str = "user_in_studio";

    pub const NEW_POST: &str = "new_post";
    pub const POST_LIKED: &str = "post_liked";
    pub const NEW_COMMENT: &str = "new_comment";
    pub const NEW_FOLLOWER: &str = "new_follower";
    pub const NOTIFICATION: &str = "notification";

    pub const TYPING_START: &str = "typing_start";
    pub const TYPING_STOP: &str = "typing_stop";
}

/// A wire message.
///
/// `payload` stays opaque until a consumer reshapes it with
/// [`Envelope::parse_payload`]; the hub routes on `kind` alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message type. Open vocabulary.
    #[serde(rename = "type")]
    pub kind: String,

    /// Arbitrary JSON payload. Omitted on the wire when null.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,

    /// Sender-assigned correlation id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Id of the envelope this one answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,

    /// Materialized to the decode instant when the sender omits it,
    /// so every dispatched envelope carries one.
    #[serde(default)]
    pub timestamp: Timestamp,
}

impl Envelope {
    /// Create an envelope of the given kind.
    ///
    /// A payload that fails to serialize degrades to `null`; every
    /// payload type in this crate serializes infallibly.
    #[must_use]
    pub fn new(kind: impl Into<String>, payload: impl Serialize) -> Self {
        Self {
            kind: kind.into(),
            payload: serde_json::to_value(payload).unwrap_or(Value::Null),
            id: None,
            reply_to: None,
            timestamp: Timestamp::now(),
        }
    }

    /// Create an envelope carrying a correlation id.
    #[must_use]
    pub fn with_id(
        kind: impl Into<String>,
        payload: impl Serialize,
        id: impl Into<String>,
    ) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::new(kind, payload)
        }
    }

    /// Create a reply to a previously received envelope.
    #[must_use]
    pub fn reply(
        kind: impl Into<String>,
        payload: impl Serialize,
        reply_to: impl Into<String>,
    ) -> Self {
        Self {
            reply_to: Some(reply_to.into()),
            ..Self::new(kind, payload)
        }
    }

    /// Create an `error` envelope with a machine-readable code.
    #[must_use]
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(
            kind::ERROR,
            ErrorPayload {
                code: code.into(),
                message: message.into(),
            },
        )
    }

    /// Reshape the opaque payload into a typed struct.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::BadPayload`] when the payload does not
    /// match the requested shape.
    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_value(self.payload.clone()).map_err(ProtocolError::BadPayload)
    }
}

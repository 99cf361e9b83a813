//! JSON codec for wire envelopes.
//!
//! One WebSocket text frame carries one JSON envelope, so the socket
//! layer already delimits messages and no length prefix is needed.

use bytes::Bytes;
use thiserror::Error;

use crate::envelope::Envelope;

/// Maximum wire frame size (512 KiB).
pub const MAX_FRAME_SIZE: usize = 512 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Malformed JSON or envelope shape.
    #[error("malformed envelope: {0}")]
    Malformed(#[source] serde_json::Error),

    /// Payload did not match the requested shape.
    #[error("payload mismatch: {0}")]
    BadPayload(#[source] serde_json::Error),
}

/// Encode an envelope to a JSON wire frame.
///
/// # Errors
///
/// Returns an error if the envelope is too large or encoding fails.
pub fn encode(envelope: &Envelope) -> Result<Bytes, ProtocolError> {
    let data = serde_json::to_vec(envelope).map_err(ProtocolError::Malformed)?;

    if data.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(data.len()));
    }

    Ok(Bytes::from(data))
}

/// Decode an envelope from a JSON wire frame.
///
/// Unknown `type` values decode successfully; a missing timestamp is
/// materialized to the decode instant.
///
/// # Errors
///
/// Returns an error if the frame is too large or not a valid envelope.
pub fn decode(data: &[u8]) -> Result<Envelope, ProtocolError> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(data.len()));
    }

    serde_json::from_slice(data).map_err(ProtocolError::Malformed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::kind;
    use crate::payload::{PingPayload, PongPayload};
    use crate::timestamp::Timestamp;
    use serde_json::{json, Value};

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut env = Envelope::with_id(
            kind::PING,
            PingPayload {
                client_time: 1_700_000_000_000,
            },
            "req-7",
        );
        env.timestamp = Timestamp::from_unix_ms(1_700_000_000_500).unwrap();

        let encoded = encode(&env).unwrap();
        let decoded = decode(&encoded).unwrap();
        assert_eq!(env, decoded);
    }

    #[test]
    fn test_reply_to_survives_roundtrip() {
        let mut env = Envelope::reply(
            kind::PONG,
            PongPayload {
                client_time: 1,
                server_time: 2,
                latency_ms: 1,
            },
            "req-7",
        );
        env.timestamp = Timestamp::from_unix_ms(1_700_000_000_000).unwrap();

        let decoded = decode(&encode(&env).unwrap()).unwrap();
        assert_eq!(decoded.reply_to.as_deref(), Some("req-7"));
        assert!(decoded.id.is_none());
    }

    #[test]
    fn test_unknown_kind_decodes() {
        let decoded = decode(br#"{"type":"jam_session_started","payload":{"room":"a"}}"#).unwrap();
        assert_eq!(decoded.kind, "jam_session_started");
        assert_eq!(decoded.payload["room"], "a");
    }

    #[test]
    fn test_missing_timestamp_is_materialized() {
        let before = Timestamp::now().unix_ms();
        let decoded = decode(br#"{"type":"ping"}"#).unwrap();
        assert!(decoded.timestamp.unix_ms() >= before);
    }

    #[test]
    fn test_integer_timestamp_accepted() {
        let decoded = decode(br#"{"type":"ping","timestamp":1700000000000}"#).unwrap();
        assert_eq!(decoded.timestamp.unix_ms(), 1_700_000_000_000);
    }

    #[test]
    fn test_encoded_timestamp_is_rfc3339() {
        let env = Envelope::new(kind::PING, Value::Null);
        let encoded = encode(&env).unwrap();

        let raw: Value = serde_json::from_slice(&encoded).unwrap();
        let ts = raw["timestamp"].as_str().expect("timestamp is a string");
        assert!(ts.ends_with('Z'), "expected RFC 3339 UTC form, got {ts}");
    }

    #[test]
    fn test_null_payload_omitted() {
        let env = Envelope::new(kind::PING, Value::Null);
        let encoded = encode(&env).unwrap();

        let raw: Value = serde_json::from_slice(&encoded).unwrap();
        assert!(raw.get("payload").is_none());
    }

    #[test]
    fn test_malformed_input() {
        match decode(b"not json at all") {
            Err(ProtocolError::Malformed(_)) => {}
            other => panic!("expected Malformed error, got {other:?}"),
        }
    }

    #[test]
    fn test_bad_timestamp_rejected() {
        assert!(decode(br#"{"type":"ping","timestamp":false}"#).is_err());
        assert!(decode(br#"{"type":"ping","timestamp":"yesterday"}"#).is_err());
    }

    #[test]
    fn test_frame_too_large() {
        let env = Envelope::new(
            "bulk",
            json!({ "blob": "x".repeat(MAX_FRAME_SIZE) }),
        );

        match encode(&env) {
            Err(ProtocolError::FrameTooLarge(_)) => {}
            other => panic!("expected FrameTooLarge error, got {other:?}"),
        }
    }
}

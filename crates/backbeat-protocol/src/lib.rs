//! # backbeat-protocol
//!
//! Wire protocol for the Backbeat realtime connection hub.
//!
//! Every message is one JSON envelope: an open `type` string, an opaque
//! payload, optional correlation ids, and a flexible timestamp that
//! decodes from Unix milliseconds or RFC 3339 but always encodes to
//! RFC 3339.
//!
//! ## Example
//!
//! ```rust
//! use backbeat_protocol::{codec, kind, Envelope};
//! use backbeat_protocol::payload::PingPayload;
//!
//! let ping = Envelope::with_id(kind::PING, PingPayload { client_time: 1_700_000_000_000 }, "req-1");
//!
//! let encoded = codec::encode(&ping).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(decoded.id.as_deref(), Some("req-1"));
//! ```

pub mod codec;
pub mod envelope;
pub mod payload;
pub mod timestamp;

pub use codec::{decode, encode, ProtocolError, MAX_FRAME_SIZE};
pub use envelope::{kind, Envelope};
pub use payload::{
    error_code, AuthPayload, ErrorPayload, PingPayload, PongPayload, PresencePayload,
    PresenceStatus, SystemPayload, TypingPayload,
};
pub use timestamp::Timestamp;

/// Protocol revision reported in the welcome payload so clients can
/// detect drift.
pub const PROTOCOL_VERSION: &str = "1.0";

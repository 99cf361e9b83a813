//! # backbeat-core
//!
//! Connection hub, socket pumps, and presence tracking for the
//! Backbeat realtime service.
//!
//! This crate provides the transport-agnostic building blocks:
//!
//! - **Connection** - One authenticated socket with a bounded outbound queue
//! - **Hub** - Single-writer event loop owning the connection registry
//! - **PresenceTracker** - Online/offline/in-studio state with follower fan-out
//! - **TokenBucket** - Per-connection inbound rate limiting
//!
//! ## Architecture
//!
//! ```text
//! ┌────────┐      ┌───────────┐      ┌───────────────┐
//! │ Socket │─────▶│ read_pump │─────▶│      Hub      │
//! └────────┘      └───────────┘      │  (event loop) │
//!     ▲                             └───────────────┘
//!     │           ┌────────────┐  queues   │      │
//!     └───────────│ write_pump │◀──────────┘      ▼
//!                 └────────────┘        ┌─────────────────┐
//!                                       │ PresenceTracker │
//!                                       └─────────────────┘
//! ```
//!
//! Transports implement [`SocketReader`] and [`SocketWriter`]; the
//! server crate adapts WebSockets onto them.

pub mod connection;
pub mod directory;
pub mod hub;
pub mod limiter;
pub mod metrics;
pub mod presence;
pub mod socket;

pub use connection::{
    read_pump, write_pump, Connection, ConnectionConfig, ConnectionId, PeerInfo, SendError,
};
pub use directory::{FollowerDirectory, NoFollowers, StaticDirectory};
pub use hub::{Hub, HubConfig, HubEvent, MessageHandler, ShutdownError};
pub use limiter::{RateLimitConfig, TokenBucket};
pub use metrics::{HubMetrics, MetricsSnapshot};
pub use presence::{PresenceConfig, PresenceTracker, UserPresence};
pub use socket::{CloseReason, Inbound, SocketError, SocketReader, SocketWriter};

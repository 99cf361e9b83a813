//! # backbeat-server
//!
//! Realtime connection hub for the Backbeat platform: the WebSocket
//! endpoint, handshake authentication, follower fan-out for typing
//! indicators, and the HTTP status surface.
//!
//! The binary in `main.rs` wires this together with the bundled JWT
//! authenticator; embedders can supply their own [`auth::Authenticator`]
//! and follower directory instead.

pub mod auth;
pub mod config;
pub mod handlers;
pub mod metrics;
pub mod ws;

//! Transport seam between the hub core and a concrete socket.
//!
//! The server adapts its WebSocket halves to these traits; tests plug
//! in in-memory fakes. Read and write halves are separate objects so
//! the two pumps can run as independent tasks.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Transport failures. Any of these terminates the connection; a clean
/// close from the peer is `Ok(None)` from [`SocketReader::recv`] instead.
#[derive(Debug, Error)]
pub enum SocketError {
    /// Read, write, or handshake failure from the transport.
    #[error("transport failure: {0}")]
    Transport(String),
}

/// Why the writer is closing the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Orderly teardown after the outbound queue drained.
    Normal,
    /// Server going away (shutdown or forced eviction).
    GoingAway,
}

/// One item surfaced by the read half.
///
/// Control traffic is surfaced rather than swallowed so the inbound
/// pump can re-arm its read deadline on any sign of life.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// One complete data frame.
    Frame(Bytes),
    /// Ping/pong control traffic; proves liveness, carries no data.
    Pong,
}

/// Read half of a connection's socket.
#[async_trait]
pub trait SocketReader: Send {
    /// Wait for the next inbound item. `Ok(None)` is a clean close by
    /// the peer.
    async fn recv(&mut self) -> Result<Option<Inbound>, SocketError>;
}

/// Write half of a connection's socket.
#[async_trait]
pub trait SocketWriter: Send {
    /// Write one data frame.
    async fn send(&mut self, frame: Bytes) -> Result<(), SocketError>;

    /// Probe peer liveness.
    async fn ping(&mut self) -> Result<(), SocketError>;

    /// Close the socket. Best effort; callers ignore the result.
    async fn close(&mut self, reason: CloseReason) -> Result<(), SocketError>;
}

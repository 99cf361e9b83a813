//! Metrics export for Backbeat.
//!
//! The hub owns the live counters (see `backbeat_core::metrics`); this
//! module registers their descriptions and runs the Prometheus exporter.

use std::net::SocketAddr;

use anyhow::Result;
use backbeat_core::metrics::names;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

/// Handshake attempts, labelled by `outcome`.
pub const HANDSHAKES_TOTAL: &str = "backbeat_handshakes_total";

/// Initialize the metrics system.
pub fn init_metrics() {
    // Describe metrics
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(
        names::MESSAGES_RECEIVED_TOTAL,
        "Total number of messages received from clients"
    );
    metrics::describe_counter!(
        names::MESSAGES_SENT_TOTAL,
        "Total number of messages delivered to clients"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");
    metrics::describe_counter!(
        names::CONNECTIONS_DROPPED_TOTAL,
        "Connections evicted for not draining their send queue"
    );
    metrics::describe_counter!(HANDSHAKES_TOTAL, "WebSocket handshake attempts by outcome");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the exporter cannot bind its listener.
pub fn start_metrics_server(port: u16) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new().with_http_listener(addr).install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a handshake attempt.
pub fn record_handshake(outcome: &'static str) {
    counter!(HANDSHAKES_TOTAL, "outcome" => outcome).increment(1);
}

//! Hub-side counters.
//!
//! The hub keeps its own atomic tallies so `/stats` can answer from a
//! cheap snapshot without scraping the exporter, and mirrors every
//! update into the `metrics` facade for Prometheus export.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use metrics::{counter, gauge};
use serde::Serialize;

/// Metric names registered with the exporter.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "backbeat_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "backbeat_connections_active";
    pub const MESSAGES_RECEIVED_TOTAL: &str = "backbeat_messages_received_total";
    pub const MESSAGES_SENT_TOTAL: &str = "backbeat_messages_sent_total";
    pub const ERRORS_TOTAL: &str = "backbeat_errors_total";
    pub const CONNECTIONS_DROPPED_TOTAL: &str = "backbeat_connections_dropped_total";
}

/// Live counters owned by the hub.
#[derive(Debug, Default)]
pub struct HubMetrics {
    connections_total: AtomicI64,
    connections_active: AtomicI64,
    messages_received: AtomicI64,
    messages_sent: AtomicI64,
    errors: AtomicI64,
    dropped: AtomicI64,
}

impl HubMetrics {
    pub(crate) fn connection_opened(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
        counter!(names::CONNECTIONS_TOTAL).increment(1);
        gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
    }

    pub(crate) fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
        gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
    }

    pub(crate) fn incr_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        counter!(names::MESSAGES_RECEIVED_TOTAL).increment(1);
    }

    pub(crate) fn incr_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        counter!(names::MESSAGES_SENT_TOTAL).increment(1);
    }

    pub(crate) fn incr_errors(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        counter!(names::ERRORS_TOTAL).increment(1);
    }

    pub(crate) fn incr_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        counter!(names::CONNECTIONS_DROPPED_TOTAL).increment(1);
    }

    /// Zero the active gauge after the hub tears every connection down.
    pub(crate) fn reset_active(&self) {
        self.connections_active.store(0, Ordering::Relaxed);
        gauge!(names::CONNECTIONS_ACTIVE).set(0.0);
    }

    /// Point-in-time copy of every counter.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            connections_dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Consistent-enough view of the hub counters for `/stats`.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct MetricsSnapshot {
    pub connections_total: i64,
    pub connections_active: i64,
    pub messages_received: i64,
    pub messages_sent: i64,
    pub errors: i64,
    pub connections_dropped: i64,
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "connections={}/{} (active/total), messages={}/{} (rx/tx), errors={}, dropped={}",
            self.connections_active,
            self.connections_total,
            self.messages_received,
            self.messages_sent,
            self.errors,
            self.connections_dropped,
        )
    }
}

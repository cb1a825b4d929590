//! Observability and Metrics
//!
//! Process-wide counters for connections, requests and object lifetimes.
//! Uses atomic counters for thread-safe metrics collection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Global metrics collector for protocol operations
#[derive(Debug)]
pub struct Metrics {
    /// Total connections established
    pub connections_total: AtomicU64,
    /// Currently open connections
    pub connections_active: AtomicU64,
    /// Failed handshakes
    pub handshakes_failed: AtomicU64,
    /// Requests issued to peers
    pub requests_sent: AtomicU64,
    /// Requests received and executed
    pub requests_handled: AtomicU64,
    /// Replies matched to a pending request
    pub replies_received: AtomicU64,
    /// Replies whose sequence id was unknown
    pub orphan_replies: AtomicU64,
    /// EXCEPTION messages sent back to callers
    pub exceptions_sent: AtomicU64,
    /// Requests refused by the exposure policy
    pub policy_denials: AtomicU64,
    /// Objects that entered an object table
    pub objects_exposed: AtomicU64,
    /// Objects released by their peer
    pub objects_released: AtomicU64,
    /// Total frames sent
    pub messages_sent: AtomicU64,
    /// Total frames received
    pub messages_received: AtomicU64,
    /// Total bytes sent
    pub bytes_sent: AtomicU64,
    /// Total bytes received
    pub bytes_received: AtomicU64,
    /// Protocol errors
    pub protocol_errors: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            handshakes_failed: AtomicU64::new(0),
            requests_sent: AtomicU64::new(0),
            requests_handled: AtomicU64::new(0),
            replies_received: AtomicU64::new(0),
            orphan_replies: AtomicU64::new(0),
            exceptions_sent: AtomicU64::new(0),
            policy_denials: AtomicU64::new(0),
            objects_exposed: AtomicU64::new(0),
            objects_released: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a new connection
    pub fn connection_established(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection closed
    pub fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn handshake_failed(&self) {
        self.handshakes_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_sent(&self) {
        self.requests_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_handled(&self) {
        self.requests_handled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reply_received(&self) {
        self.replies_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn orphan_reply(&self) {
        self.orphan_replies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn exception_sent(&self) {
        self.exceptions_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn policy_denied(&self) {
        self.policy_denials.fetch_add(1, Ordering::Relaxed);
    }

    pub fn object_exposed(&self) {
        self.objects_exposed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn object_released(&self) {
        self.objects_released.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a frame sent
    pub fn message_sent(&self, byte_count: u64) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Record a frame received
    pub fn message_received(&self, byte_count: u64) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Record a protocol error
    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            handshakes_failed: self.handshakes_failed.load(Ordering::Relaxed),
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            requests_handled: self.requests_handled.load(Ordering::Relaxed),
            replies_received: self.replies_received.load(Ordering::Relaxed),
            orphan_replies: self.orphan_replies.load(Ordering::Relaxed),
            exceptions_sent: self.exceptions_sent.load(Ordering::Relaxed),
            policy_denials: self.policy_denials.load(Ordering::Relaxed),
            objects_exposed: self.objects_exposed.load(Ordering::Relaxed),
            objects_released: self.objects_released.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            connections_total = snapshot.connections_total,
            connections_active = snapshot.connections_active,
            handshakes_failed = snapshot.handshakes_failed,
            requests_sent = snapshot.requests_sent,
            requests_handled = snapshot.requests_handled,
            replies_received = snapshot.replies_received,
            orphan_replies = snapshot.orphan_replies,
            exceptions_sent = snapshot.exceptions_sent,
            policy_denials = snapshot.policy_denials,
            objects_exposed = snapshot.objects_exposed,
            objects_released = snapshot.objects_released,
            messages_sent = snapshot.messages_sent,
            messages_received = snapshot.messages_received,
            bytes_sent = snapshot.bytes_sent,
            bytes_received = snapshot.bytes_received,
            protocol_errors = snapshot.protocol_errors,
            uptime_seconds = snapshot.uptime_seconds,
            "Protocol metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub handshakes_failed: u64,
    pub requests_sent: u64,
    pub requests_handled: u64,
    pub replies_received: u64,
    pub orphan_replies: u64,
    pub exceptions_sent: u64,
    pub policy_denials: u64,
    pub objects_exposed: u64,
    pub objects_released: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub protocol_errors: u64,
    pub uptime_seconds: u64,
}

static METRICS: once_cell::sync::Lazy<Metrics> = once_cell::sync::Lazy::new(Metrics::new);

/// Get the global metrics instance
pub fn global_metrics() -> &'static Metrics {
    &METRICS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = Metrics::new();
        metrics.connection_established();
        metrics.connection_established();
        metrics.connection_closed();
        metrics.message_sent(40);
        metrics.policy_denied();
        let snap = metrics.snapshot();
        assert_eq!(snap.connections_total, 2);
        assert_eq!(snap.connections_active, 1);
        assert_eq!(snap.bytes_sent, 40);
        assert_eq!(snap.policy_denials, 1);
    }
}

//! # Broker Metrics
//!
//! Lock-free counters for connection and request traffic. Handlers bump them
//! on the hot path with relaxed atomics; [`BrokerMetrics::snapshot`] produces a
//! serializable copy that the server logs as JSON on shutdown.
//!
//! Queue-level accounting (accepted, completed, erased, ...) lives in
//! [`crate::queue::QueueStats`], owned by the router.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[derive(Debug)]
pub struct BrokerMetrics {
    started_at: Instant,
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    connections_rejected: AtomicU64,
    handshake_failures: AtomicU64,
    requests_received: AtomicU64,
    errors_sent: AtomicU64,
    protocol_violations: AtomicU64,
}

impl Default for BrokerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerMetrics {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            connections_opened: AtomicU64::new(0),
            connections_closed: AtomicU64::new(0),
            connections_rejected: AtomicU64::new(0),
            handshake_failures: AtomicU64::new(0),
            requests_received: AtomicU64::new(0),
            errors_sent: AtomicU64::new(0),
            protocol_violations: AtomicU64::new(0),
        }
    }

    pub fn connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_rejected(&self) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handshake_failed(&self) {
        self.handshake_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_received(&self) {
        self.requests_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn error_sent(&self) {
        self.errors_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn protocol_violation(&self) {
        self.protocol_violations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let opened = self.connections_opened.load(Ordering::Relaxed);
        let closed = self.connections_closed.load(Ordering::Relaxed);
        MetricsSnapshot {
            uptime_ms: self.started_at.elapsed().as_millis() as u64,
            connections_opened: opened,
            connections_closed: closed,
            connections_active: opened.saturating_sub(closed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
            handshake_failures: self.handshake_failures.load(Ordering::Relaxed),
            requests_received: self.requests_received.load(Ordering::Relaxed),
            errors_sent: self.errors_sent.load(Ordering::Relaxed),
            protocol_violations: self.protocol_violations.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_ms: u64,
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub connections_active: u64,
    pub connections_rejected: u64,
    pub handshake_failures: u64,
    pub requests_received: u64,
    pub errors_sent: u64,
    pub protocol_violations: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_tracks_active_connections() {
        let metrics = BrokerMetrics::new();
        metrics.connection_opened();
        metrics.connection_opened();
        metrics.connection_closed();
        metrics.connection_rejected();
        metrics.request_received();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connections_active, 1);
        assert_eq!(snapshot.connections_rejected, 1);
        assert_eq!(snapshot.requests_received, 1);

        let json = serde_json::to_value(snapshot).unwrap();
        assert_eq!(json["connections_opened"], 2);
    }
}

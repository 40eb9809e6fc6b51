//! Counters kept by a connection manager

use std::sync::atomic::{AtomicU64, Ordering};

/// Per-manager metrics collector
#[derive(Debug, Default)]
pub struct ManagerMetrics {
    /// Datagrams read from the socket
    pub datagrams_received: AtomicU64,
    /// Datagrams handed to a connection
    pub datagrams_routed: AtomicU64,
    /// Datagrams too short, too long, or with an impossible flag set
    pub datagrams_malformed: AtomicU64,
    /// Well-formed datagrams with no matching session
    pub datagrams_unrouted: AtomicU64,
    /// Connection requests added to the queue
    pub requests_queued: AtomicU64,
    /// Retried SYNs matched to an existing request or connection
    pub requests_deduplicated: AtomicU64,
    /// Requests dropped because the queue was full or they expired
    pub requests_dropped: AtomicU64,
    /// Connections placed into a slot
    pub connections_created: AtomicU64,
    /// Slots freed because their connection ended or was dropped
    pub connections_evicted: AtomicU64,
}

impl ManagerMetrics {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            datagrams_received: self.datagrams_received.load(Ordering::Relaxed),
            datagrams_routed: self.datagrams_routed.load(Ordering::Relaxed),
            datagrams_malformed: self.datagrams_malformed.load(Ordering::Relaxed),
            datagrams_unrouted: self.datagrams_unrouted.load(Ordering::Relaxed),
            requests_queued: self.requests_queued.load(Ordering::Relaxed),
            requests_deduplicated: self.requests_deduplicated.load(Ordering::Relaxed),
            requests_dropped: self.requests_dropped.load(Ordering::Relaxed),
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connections_evicted: self.connections_evicted.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub datagrams_received: u64,
    pub datagrams_routed: u64,
    pub datagrams_malformed: u64,
    pub datagrams_unrouted: u64,
    pub requests_queued: u64,
    pub requests_deduplicated: u64,
    pub requests_dropped: u64,
    pub connections_created: u64,
    pub connections_evicted: u64,
}

impl MetricsSnapshot {
    /// Fraction of received datagrams that reached a connection
    pub fn routed_ratio(&self) -> f64 {
        if self.datagrams_received == 0 {
            0.0
        } else {
            self.datagrams_routed as f64 / self.datagrams_received as f64
        }
    }

    /// Slots currently counted as occupied
    pub fn live_connections(&self) -> u64 {
        self.connections_created
            .saturating_sub(self.connections_evicted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let metrics = ManagerMetrics::default();
        ManagerMetrics::incr(&metrics.datagrams_received);
        ManagerMetrics::incr(&metrics.datagrams_received);
        ManagerMetrics::incr(&metrics.datagrams_routed);
        ManagerMetrics::incr(&metrics.connections_created);

        let snap = metrics.snapshot();
        assert_eq!(snap.datagrams_received, 2);
        assert_eq!(snap.live_connections(), 1);
        assert!((snap.routed_ratio() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_ratio() {
        assert_eq!(MetricsSnapshot::default().routed_ratio(), 0.0);
    }
}

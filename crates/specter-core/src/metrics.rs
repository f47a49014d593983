use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::message::Protocol;

/// Pipeline counters, shared by every stage.
///
/// All counters are monotonic except `connections`, which is a gauge of
/// the current connection-table population across lanes. Cheap enough to
/// bump from the hot path (relaxed atomics, no locks).
#[derive(Debug, Clone, Default)]
pub struct AnalyzerMetrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    events_in: AtomicU64,
    events_dropped: AtomicU64,
    pairs_emitted: AtomicU64,
    parse_rejects: [AtomicU64; Protocol::COUNT],
    partial_overflows: AtomicU64,
    pending_drops: AtomicU64,
    orphan_responses: AtomicU64,
    timeouts: AtomicU64,
    evictions: AtomicU64,
    connections: AtomicU64,
}

impl AnalyzerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn event_in(&self) {
        self.inner.events_in.fetch_add(1, Ordering::Relaxed);
    }

    pub fn events_dropped(&self, n: u64) {
        self.inner.events_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn pair_emitted(&self) {
        self.inner.pairs_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn parse_reject(&self, protocol: Protocol) {
        self.inner.parse_rejects[protocol.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn partial_overflow(&self) {
        self.inner.partial_overflows.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pending_drop(&self) {
        self.inner.pending_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn orphan_response(&self) {
        self.inner.orphan_responses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn timeout(&self) {
        self.inner.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn eviction(&self) {
        self.inner.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_opened(&self) {
        self.inner.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.inner.connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let m = &*self.inner;
        let mut parse_rejects = HashMap::new();
        for protocol in Protocol::ALL {
            let count = m.parse_rejects[protocol.index()].load(Ordering::Relaxed);
            if count > 0 {
                parse_rejects.insert(protocol.name().to_string(), count);
            }
        }
        MetricsSnapshot {
            events_in: m.events_in.load(Ordering::Relaxed),
            events_dropped: m.events_dropped.load(Ordering::Relaxed),
            pairs_emitted: m.pairs_emitted.load(Ordering::Relaxed),
            parse_rejects,
            partial_overflows: m.partial_overflows.load(Ordering::Relaxed),
            pending_drops: m.pending_drops.load(Ordering::Relaxed),
            orphan_responses: m.orphan_responses.load(Ordering::Relaxed),
            timeouts: m.timeouts.load(Ordering::Relaxed),
            evictions: m.evictions.load(Ordering::Relaxed),
            connections: m.connections.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of every counter, serializable for logs.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub events_in: u64,
    pub events_dropped: u64,
    pub pairs_emitted: u64,
    /// Per-protocol definitive parse rejections; zero entries omitted.
    pub parse_rejects: HashMap<String, u64>,
    pub partial_overflows: u64,
    pub pending_drops: u64,
    pub orphan_responses: u64,
    pub timeouts: u64,
    pub evictions: u64,
    pub connections: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_roll_up_into_snapshot() {
        let metrics = AnalyzerMetrics::new();
        metrics.event_in();
        metrics.event_in();
        metrics.events_dropped(3);
        metrics.pair_emitted();
        metrics.parse_reject(Protocol::Mysql);
        metrics.parse_reject(Protocol::Mysql);
        metrics.timeout();
        metrics.connection_opened();
        metrics.connection_opened();
        metrics.connection_closed();

        let snap = metrics.snapshot();
        assert_eq!(snap.events_in, 2);
        assert_eq!(snap.events_dropped, 3);
        assert_eq!(snap.pairs_emitted, 1);
        assert_eq!(snap.parse_rejects["mysql"], 2);
        assert!(!snap.parse_rejects.contains_key("http"));
        assert_eq!(snap.timeouts, 1);
        assert_eq!(snap.connections, 1);
    }

    #[test]
    fn test_clones_share_counters() {
        let metrics = AnalyzerMetrics::new();
        let clone = metrics.clone();
        clone.pair_emitted();
        assert_eq!(metrics.snapshot().pairs_emitted, 1);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = AnalyzerMetrics::new();
        metrics.event_in();
        let json = serde_json::to_string(&metrics.snapshot()).unwrap();
        assert!(json.contains("\"events_in\":1"));
    }
}

// Transport and messaging counters.
//
// The library only counts; publication is the collaborator's job through the
// `MetricsSink` contract. Counters are plain atomics so the hot path never
// takes a lock.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Receives counter snapshots from the transport.
pub trait MetricsSink: Send + Sync {
    fn publish(&self, snapshot: &NetworkMetricsSnapshot);
}

/// Point-in-time rendering of the transport counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkMetricsSnapshot {
    pub connections: u64,
    pub messages_in: u64,
    pub messages_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub send_errors: u64,
}

/// Transport counter registry shared by servers and clients.
#[derive(Debug, Default)]
pub struct NetworkMetrics {
    connections: AtomicU64,
    messages_in: AtomicU64,
    messages_out: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    send_errors: AtomicU64,
}

impl NetworkMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connection_opened(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        // Saturating: a close without a matching open stays at zero.
        let _ = self
            .connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    pub fn message_received(&self, bytes: usize) {
        self.messages_in.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn message_sent(&self, bytes: usize) {
        self.messages_out.fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn send_error(&self) {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> NetworkMetricsSnapshot {
        NetworkMetricsSnapshot {
            connections: self.connections.load(Ordering::Relaxed),
            messages_in: self.messages_in.load(Ordering::Relaxed),
            messages_out: self.messages_out.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
        }
    }
}

/// Fans snapshots out to every registered sink.
#[derive(Default)]
pub struct MetricsRegistry {
    sinks: RwLock<Vec<Arc<dyn MetricsSink>>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, sink: Arc<dyn MetricsSink>) {
        self.sinks.write().push(sink);
    }

    pub fn publish(&self, metrics: &NetworkMetrics) {
        let snapshot = metrics.snapshot();
        for sink in self.sinks.read().iter() {
            sink.publish(&snapshot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct CapturingSink {
        seen: Mutex<Vec<NetworkMetricsSnapshot>>,
    }

    impl MetricsSink for CapturingSink {
        fn publish(&self, snapshot: &NetworkMetricsSnapshot) {
            self.seen.lock().push(snapshot.clone());
        }
    }

    #[test]
    fn test_counters() {
        let metrics = NetworkMetrics::new();
        metrics.connection_opened();
        metrics.message_sent(10);
        metrics.message_sent(5);
        metrics.message_received(7);
        metrics.send_error();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connections, 1);
        assert_eq!(snapshot.messages_out, 2);
        assert_eq!(snapshot.bytes_out, 15);
        assert_eq!(snapshot.messages_in, 1);
        assert_eq!(snapshot.bytes_in, 7);
        assert_eq!(snapshot.send_errors, 1);
    }

    #[test]
    fn test_connection_count_never_underflows() {
        let metrics = NetworkMetrics::new();
        metrics.connection_closed();
        assert_eq!(metrics.snapshot().connections, 0);
    }

    #[test]
    fn test_registry_publishes_to_sinks() {
        let metrics = NetworkMetrics::new();
        metrics.connection_opened();

        let sink = Arc::new(CapturingSink {
            seen: Mutex::new(Vec::new()),
        });
        let registry = MetricsRegistry::new();
        registry.register(sink.clone());
        registry.publish(&metrics);

        let seen = sink.seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].connections, 1);
    }
}

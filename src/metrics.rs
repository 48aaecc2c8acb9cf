use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide counters, surfaced through periodic structured logs. The
/// driver snapshots and restores the indexing counters around failed
/// transactions so aborted work is not reported as progress.
#[derive(Debug, Default)]
pub struct Metrics {
    pub rpc_requests: AtomicU64,
    pub rpc_retries: AtomicU64,
    pub rpc_failures: AtomicU64,
    pub rpc_rate_limited: AtomicU64,
    pub events_dispatched: AtomicU64,
    pub batches_committed: AtomicU64,
    pub reorgs_handled: AtomicU64,
    pub finalizations: AtomicU64,
}

/// Point-in-time copy of the indexing counters.
#[derive(Debug, Clone, Copy)]
pub struct IndexingSnapshot {
    events_dispatched: u64,
    batches_committed: u64,
}

impl Metrics {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn indexing_snapshot(&self) -> IndexingSnapshot {
        IndexingSnapshot {
            events_dispatched: self.events_dispatched.load(Ordering::Relaxed),
            batches_committed: self.batches_committed.load(Ordering::Relaxed),
        }
    }

    /// Roll the indexing counters back to a snapshot taken at transaction
    /// start.
    pub fn restore_indexing(&self, snapshot: IndexingSnapshot) {
        self.events_dispatched
            .store(snapshot.events_dispatched, Ordering::Relaxed);
        self.batches_committed
            .store(snapshot.batches_committed, Ordering::Relaxed);
    }

    pub fn log_summary(&self) {
        tracing::info!(
            rpc_requests = self.rpc_requests.load(Ordering::Relaxed),
            rpc_retries = self.rpc_retries.load(Ordering::Relaxed),
            rpc_failures = self.rpc_failures.load(Ordering::Relaxed),
            rpc_rate_limited = self.rpc_rate_limited.load(Ordering::Relaxed),
            events_dispatched = self.events_dispatched.load(Ordering::Relaxed),
            batches_committed = self.batches_committed.load(Ordering::Relaxed),
            reorgs_handled = self.reorgs_handled.load(Ordering::Relaxed),
            finalizations = self.finalizations.load(Ordering::Relaxed),
            "metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_restore_rolls_back_indexing_counters() {
        let metrics = Metrics::default();
        Metrics::add(&metrics.events_dispatched, 10);
        let snapshot = metrics.indexing_snapshot();

        Metrics::add(&metrics.events_dispatched, 5);
        Metrics::incr(&metrics.batches_committed);
        metrics.restore_indexing(snapshot);

        assert_eq!(metrics.events_dispatched.load(Ordering::Relaxed), 10);
        assert_eq!(metrics.batches_committed.load(Ordering::Relaxed), 0);
        // rpc counters are untouched by the rollback
        Metrics::incr(&metrics.rpc_requests);
        assert_eq!(metrics.rpc_requests.load(Ordering::Relaxed), 1);
    }
}

//! Operation counters.
//!
//! A pure sink: the tree increments counters as it works and never reads
//! them back. Counters are relaxed atomics so the single writer and any
//! number of reporting readers never contend.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for one tree (or one store).
#[derive(Debug, Default)]
pub struct Metrics {
    /// Successful put operations.
    pub puts: AtomicU64,
    /// Get operations, found or not.
    pub gets: AtomicU64,
    /// Destroy operations that tombstoned a value.
    pub deletes: AtomicU64,
    /// Range scans started.
    pub scans: AtomicU64,
    /// Node splits performed by inserts.
    pub splits: AtomicU64,
    /// Nodes allocated from the global heap.
    pub nodes_allocated: AtomicU64,
    /// Extra allocation attempts caused by transient heap failures.
    pub alloc_retries: AtomicU64,
}

/// Point-in-time copy of [`Metrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[allow(missing_docs)]
pub struct MetricsSnapshot {
    pub puts: u64,
    pub gets: u64,
    pub deletes: u64,
    pub scans: u64,
    pub splits: u64,
    pub nodes_allocated: u64,
    pub alloc_retries: u64,
}

impl Metrics {
    #[inline]
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Copy the current counter values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            puts: self.puts.load(Ordering::Relaxed),
            gets: self.gets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            scans: self.scans.load(Ordering::Relaxed),
            splits: self.splits.load(Ordering::Relaxed),
            nodes_allocated: self.nodes_allocated.load(Ordering::Relaxed),
            alloc_retries: self.alloc_retries.load(Ordering::Relaxed),
        }
    }

    /// Log the current counter values.
    pub fn report(&self) {
        let s = self.snapshot();
        tracing::info!(
            puts = s.puts,
            gets = s.gets,
            deletes = s.deletes,
            scans = s.scans,
            splits = s.splits,
            nodes_allocated = s.nodes_allocated,
            alloc_retries = s.alloc_retries,
            "tree metrics"
        );
    }
}

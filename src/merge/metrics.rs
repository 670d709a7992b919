//! Merge counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Aggregated counters across merge tasks sharing a runtime.
#[derive(Debug, Default)]
pub struct MergeMetrics {
    merges_completed: AtomicU64,
    merges_failed: AtomicU64,
    merges_cancelled: AtomicU64,
    rows_merged: AtomicU64,
    rows_dropped: AtomicU64,
    blocks_written: AtomicU64,
    objects_created: AtomicU64,
}

/// Snapshot of [`MergeMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeMetricsSnapshot {
    /// Tasks that committed their catalog changes to the transaction.
    pub merges_completed: u64,
    /// Tasks that failed.
    pub merges_failed: u64,
    /// Tasks stopped by cancellation.
    pub merges_cancelled: u64,
    /// Live rows written to new objects.
    pub rows_merged: u64,
    /// Tombstoned rows purged.
    pub rows_dropped: u64,
    /// Blocks written to new objects.
    pub blocks_written: u64,
    /// Objects created.
    pub objects_created: u64,
}

/// Per-task outcome folded into [`MergeMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeSummary {
    /// Live rows emitted.
    pub rows_merged: u64,
    /// Tombstoned rows skipped.
    pub rows_dropped: u64,
    /// Blocks written.
    pub blocks_written: u64,
    /// Objects created.
    pub objects_created: u64,
}

impl MergeMetrics {
    pub(crate) fn record_success(&self, summary: &MergeSummary) {
        self.merges_completed.fetch_add(1, Ordering::Relaxed);
        self.rows_merged
            .fetch_add(summary.rows_merged, Ordering::Relaxed);
        self.rows_dropped
            .fetch_add(summary.rows_dropped, Ordering::Relaxed);
        self.blocks_written
            .fetch_add(summary.blocks_written, Ordering::Relaxed);
        self.objects_created
            .fetch_add(summary.objects_created, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self, cancelled: bool) {
        if cancelled {
            self.merges_cancelled.fetch_add(1, Ordering::Relaxed);
        } else {
            self.merges_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Current counter values.
    pub fn snapshot(&self) -> MergeMetricsSnapshot {
        MergeMetricsSnapshot {
            merges_completed: self.merges_completed.load(Ordering::Relaxed),
            merges_failed: self.merges_failed.load(Ordering::Relaxed),
            merges_cancelled: self.merges_cancelled.load(Ordering::Relaxed),
            rows_merged: self.rows_merged.load(Ordering::Relaxed),
            rows_dropped: self.rows_dropped.load(Ordering::Relaxed),
            blocks_written: self.blocks_written.load(Ordering::Relaxed),
            objects_created: self.objects_created.load(Ordering::Relaxed),
        }
    }
}

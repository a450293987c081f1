//! Per-worker operation counters.
//!
//! Counters cover the failure paths of store-driven operations plus resync
//! rounds, labelled by operation name. They are cheap atomics behind a
//! concurrent map so followers can record without coordination; an exporter
//! can snapshot them on its own schedule.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters owned by one worker.
#[derive(Default)]
pub struct WorkerMetrics {
    op_errors: DashMap<String, u64>,
    resyncs: AtomicU64,
}

impl WorkerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a failed operation under its label.
    pub fn record_op_error(&self, op: &str) {
        *self.op_errors.entry(op.to_string()).or_insert(0) += 1;
    }

    /// Records one completed resynchronization round.
    pub fn record_resync(&self) {
        self.resyncs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn op_error_count(&self, op: &str) -> u64 {
        self.op_errors.get(op).map(|e| *e.value()).unwrap_or(0)
    }

    pub fn resync_count(&self) -> u64 {
        self.resyncs.load(Ordering::Relaxed)
    }

    /// Snapshot of every error counter.
    pub fn op_errors(&self) -> HashMap<String, u64> {
        self.op_errors
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_per_label() {
        let metrics = WorkerMetrics::new();
        metrics.record_op_error("pause");
        metrics.record_op_error("pause");
        metrics.record_op_error("stop");

        assert_eq!(metrics.op_error_count("pause"), 2);
        assert_eq!(metrics.op_error_count("stop"), 1);
        assert_eq!(metrics.op_error_count("resume"), 0);

        let snapshot = metrics.op_errors();
        assert_eq!(snapshot.len(), 2);
    }

    #[test]
    fn resyncs_count_independently() {
        let metrics = WorkerMetrics::new();
        assert_eq!(metrics.resync_count(), 0);
        metrics.record_resync();
        metrics.record_resync();
        assert_eq!(metrics.resync_count(), 2);
    }
}

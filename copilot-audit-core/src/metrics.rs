//! Pipeline counters.
//!
//! One `PipelineMetrics` is created per pipeline and shared by `Arc` with the
//! queue, the workers and the sweeper. Nothing here is global.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonically increasing counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_by(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct PipelineMetrics {
    // Entry queue
    pub submitted: Counter,
    pub dropped: Counter,

    // Worker pool / writer
    pub records_persisted: Counter,
    pub records_discarded: Counter,
    pub batches_committed: Counter,
    pub batches_failed: Counter,

    // Retention sweeper
    pub sweeps_completed: Counter,
    pub sweeps_failed: Counter,
    pub interactions_swept: Counter,
}

/// A snapshot of the counters at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub submitted: u64,
    pub dropped: u64,
    pub records_persisted: u64,
    pub records_discarded: u64,
    pub batches_committed: u64,
    pub batches_failed: u64,
    pub sweeps_completed: u64,
    pub sweeps_failed: u64,
    pub interactions_swept: u64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp: Utc::now(),
            submitted: self.submitted.get(),
            dropped: self.dropped.get(),
            records_persisted: self.records_persisted.get(),
            records_discarded: self.records_discarded.get(),
            batches_committed: self.batches_committed.get(),
            batches_failed: self.batches_failed.get(),
            sweeps_completed: self.sweeps_completed.get(),
            sweeps_failed: self.sweeps_failed.get(),
            interactions_swept: self.interactions_swept.get(),
        }
    }
}

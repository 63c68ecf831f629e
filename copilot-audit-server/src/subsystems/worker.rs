//! Audit workers: drain the entry queue into batch transactions
//!
//! Each worker owns a private batch. It flushes when the batch reaches
//! `batch_size`, when its own `batch_interval` ticker fires with a non-empty
//! batch, and once more on shutdown before exiting. Workers share nothing but
//! the queue and the sink.

use copilot_audit_core::{InteractionRecord, PipelineMetrics};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::queue::EntryQueue;
use super::writer::BatchSink;

pub struct AuditWorker {
    id: usize,
    queue: EntryQueue,
    sink: Arc<dyn BatchSink>,
    metrics: Arc<PipelineMetrics>,
    batch_size: usize,
    batch_interval: Duration,
}

impl AuditWorker {
    pub fn new(
        id: usize,
        queue: EntryQueue,
        sink: Arc<dyn BatchSink>,
        metrics: Arc<PipelineMetrics>,
        batch_size: usize,
        batch_interval: Duration,
    ) -> Self {
        Self {
            id,
            queue,
            sink,
            metrics,
            batch_size: batch_size.max(1),
            batch_interval,
        }
    }

    /// Run until `shutdown` fires or the queue is closed, then flush what is
    /// left and return.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = interval_at(Instant::now() + self.batch_interval, self.batch_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut batch: Vec<InteractionRecord> = Vec::with_capacity(self.batch_size);

        tracing::info!(
            worker_id = self.id,
            batch_size = self.batch_size,
            batch_interval_ms = self.batch_interval.as_millis() as u64,
            "Audit worker started"
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    flush_batch(self.sink.as_ref(), &self.metrics, &mut batch).await;
                    break;
                }
                _ = ticker.tick() => {
                    if !batch.is_empty() {
                        flush_batch(self.sink.as_ref(), &self.metrics, &mut batch).await;
                    }
                }
                next = self.queue.recv() => match next {
                    Some(record) => {
                        batch.push(record);
                        if batch.len() >= self.batch_size {
                            flush_batch(self.sink.as_ref(), &self.metrics, &mut batch).await;
                        }
                    }
                    None => {
                        flush_batch(self.sink.as_ref(), &self.metrics, &mut batch).await;
                        break;
                    }
                },
            }
        }

        tracing::info!(worker_id = self.id, "Audit worker exited");
    }
}

/// Write `batch` as one transaction and clear it whatever the outcome.
///
/// A failed batch is logged and counted, never retried or requeued. Callers
/// identify themselves through the enclosing span.
pub async fn flush_batch(
    sink: &dyn BatchSink,
    metrics: &PipelineMetrics,
    batch: &mut Vec<InteractionRecord>,
) {
    if batch.is_empty() {
        return;
    }
    let count = batch.len() as u64;
    let started = std::time::Instant::now();

    match sink.write_batch(batch).await {
        Ok(()) => {
            metrics.batches_committed.inc();
            metrics.records_persisted.inc_by(count);
            tracing::debug!(
                batch_size = count,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Audit batch flushed"
            );
        }
        Err(e) => {
            metrics.batches_failed.inc();
            metrics.records_discarded.inc_by(count);
            let offending = e
                .offending_interaction()
                .map(|id| id.to_string())
                .unwrap_or_default();
            tracing::error!(
                batch_size = count,
                offending_interaction = %offending,
                error = %e,
                "Audit batch rolled back, all records in it discarded"
            );
        }
    }

    batch.clear();
}

// ============================================================================
// TESTS
// ============================================================================

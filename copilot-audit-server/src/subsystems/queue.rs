//! Entry queue: bounded, FIFO, many producers and many consumers.
//!
//! Producers go through `submit`, which never waits. A full (or closed) queue
//! drops the record and counts it. Workers share the single receiver behind
//! an async mutex, so each record is claimed by exactly one worker.

use copilot_audit_core::{InteractionRecord, PipelineMetrics};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};
use tokio::sync::Mutex;

/// What happened to a submitted record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Queued,
    /// Queue full or already closed; the record is gone.
    Dropped,
    /// Auditing is switched off.
    Disabled,
}

#[derive(Clone)]
pub struct EntryQueue {
    sender: mpsc::Sender<InteractionRecord>,
    receiver: Arc<Mutex<mpsc::Receiver<InteractionRecord>>>,
    capacity: usize,
    metrics: Arc<PipelineMetrics>,
}

impl EntryQueue {
    /// `capacity` must be at least 1 (enforced by `AuditConfig::validate`).
    pub fn new(capacity: usize, metrics: Arc<PipelineMetrics>) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
            capacity: capacity.max(1),
            metrics,
        }
    }

    pub fn submit(&self, record: InteractionRecord) -> SubmitOutcome {
        let interaction_id = record.interaction_id;
        match self.sender.try_send(record) {
            Ok(()) => {
                self.metrics.submitted.inc();
                tracing::debug!(interaction_id = %interaction_id, "Audit record queued");
                SubmitOutcome::Queued
            }
            Err(TrySendError::Full(record)) => {
                self.metrics.dropped.inc();
                tracing::warn!(
                    interaction_id = %record.interaction_id,
                    session_id = %record.session_id,
                    capacity = self.capacity,
                    dropped_total = self.metrics.dropped.get(),
                    "Audit queue full, dropping record"
                );
                SubmitOutcome::Dropped
            }
            Err(TrySendError::Closed(record)) => {
                self.metrics.dropped.inc();
                tracing::warn!(
                    interaction_id = %record.interaction_id,
                    "Audit queue closed, dropping record"
                );
                SubmitOutcome::Dropped
            }
        }
    }

    /// Wait for the next record. `None` once the queue is closed and empty.
    pub async fn recv(&self) -> Option<InteractionRecord> {
        self.receiver.lock().await.recv().await
    }

    /// Refuse further submissions and hand back everything still buffered.
    pub async fn close_and_drain(&self) -> Vec<InteractionRecord> {
        let mut receiver = self.receiver.lock().await;
        receiver.close();

        let mut remaining = Vec::new();
        loop {
            match receiver.try_recv() {
                Ok(record) => remaining.push(record),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        remaining
    }

    /// Records currently buffered.
    pub fn depth(&self) -> usize {
        self.capacity - self.sender.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn record(question: &str) -> InteractionRecord {
        InteractionRecord::new(Uuid::new_v4(), Uuid::new_v4(), question)
    }

    #[tokio::test]
    async fn test_full_queue_drops_newest() {
        let metrics = Arc::new(PipelineMetrics::new());
        let queue = EntryQueue::new(1, metrics.clone());

        let first = record("first");
        let first_id = first.interaction_id;
        assert_eq!(queue.submit(first), SubmitOutcome::Queued);
        assert_eq!(queue.submit(record("second")), SubmitOutcome::Dropped);

        assert_eq!(metrics.submitted.get(), 1);
        assert_eq!(metrics.dropped.get(), 1);
        assert_eq!(queue.depth(), 1);

        let drained = queue.close_and_drain().await;
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].interaction_id, first_id);
    }

    #[tokio::test]
    async fn test_fifo_order_preserved() {
        let queue = EntryQueue::new(8, Arc::new(PipelineMetrics::new()));
        let ids: Vec<Uuid> = (0..5)
            .map(|i| {
                let r = record(&format!("q{}", i));
                let id = r.interaction_id;
                queue.submit(r);
                id
            })
            .collect();

        let mut received = Vec::new();
        for _ in 0..5 {
            received.push(queue.recv().await.expect("record").interaction_id);
        }
        assert_eq!(received, ids);
    }

    #[tokio::test]
    async fn test_submit_after_close_is_dropped() {
        let metrics = Arc::new(PipelineMetrics::new());
        let queue = EntryQueue::new(4, metrics.clone());
        assert!(queue.close_and_drain().await.is_empty());

        assert_eq!(queue.submit(record("late")), SubmitOutcome::Dropped);
        assert_eq!(metrics.dropped.get(), 1);
        assert!(queue.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_saturated_submit_returns_immediately() {
        let queue = EntryQueue::new(2, Arc::new(PipelineMetrics::new()));
        queue.submit(record("a"));
        queue.submit(record("b"));

        let start = std::time::Instant::now();
        for _ in 0..1000 {
            assert_eq!(queue.submit(record("overflow")), SubmitOutcome::Dropped);
        }
        assert!(start.elapsed() < std::time::Duration::from_secs(1));
        assert_eq!(queue.depth(), 2);
    }
}

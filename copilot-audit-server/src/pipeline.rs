//! Audit pipeline lifecycle
//!
//! `AuditHandle` is what the request path holds. It is either a running
//! `AuditPipeline` or `Disabled`, in which case every call is a no-op. Start-up
//! never fails outward: an unreachable store, a missing schema or a bad
//! configuration all produce `Disabled` and an error log.
//!
//! Shutdown order: signal workers and sweeper, wait for the workers' final
//! flushes, close the queue, flush whatever no worker claimed, close the pool.

use copilot_audit_core::{
    db, schema, AuditConfig, AuditError, InteractionRecord, MetricsSnapshot, PipelineMetrics,
};
use futures::future::join_all;
use sqlx::PgPool;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::subsystems::queue::{EntryQueue, SubmitOutcome};
use crate::subsystems::retention::RetentionSweeper;
use crate::subsystems::worker::{flush_batch, AuditWorker};
use crate::subsystems::writer::{BatchSink, PgBatchWriter};

// ============================================================================
// NULL-OBJECT HANDLE
// ============================================================================

pub enum AuditHandle {
    Enabled(AuditPipeline),
    Disabled,
}

impl AuditHandle {
    /// Connect, validate and start the pipeline, or fall back to `Disabled`.
    pub async fn start(config: &AuditConfig) -> Self {
        if !config.enabled {
            tracing::info!("Audit logging disabled by configuration");
            return AuditHandle::Disabled;
        }
        if let Err(e) = config.validate() {
            tracing::error!(error = %e, "Audit configuration rejected, auditing disabled");
            return AuditHandle::Disabled;
        }

        let pool = match db::create_pool(&config.database).await {
            Ok(pool) => pool,
            Err(e) => {
                let e = AuditError::StartupUnavailable(format!(
                    "{}: {}",
                    config.database.describe(),
                    e
                ));
                tracing::error!(error = %e, "Audit store unreachable, auditing disabled");
                return AuditHandle::Disabled;
            }
        };

        Self::from_pool(pool, config).await
    }

    /// Start on an existing pool. The pool is closed again if start-up fails.
    pub async fn from_pool(pool: PgPool, config: &AuditConfig) -> Self {
        match AuditPipeline::start(pool.clone(), config).await {
            Ok(pipeline) => AuditHandle::Enabled(pipeline),
            Err(e) => {
                tracing::error!(error = %e, "Audit pipeline failed to start, auditing disabled");
                pool.close().await;
                AuditHandle::Disabled
            }
        }
    }

    /// Hand a finished interaction to the pipeline. Never blocks, never fails.
    pub fn submit(&self, record: InteractionRecord) -> SubmitOutcome {
        match self {
            AuditHandle::Enabled(pipeline) => pipeline.submit(record),
            AuditHandle::Disabled => SubmitOutcome::Disabled,
        }
    }

    /// Stop and drain. Safe to call more than once.
    pub async fn shutdown(&self) {
        if let AuditHandle::Enabled(pipeline) = self {
            pipeline.shutdown().await;
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, AuditHandle::Enabled(_))
    }

    pub fn metrics(&self) -> Option<MetricsSnapshot> {
        match self {
            AuditHandle::Enabled(pipeline) => Some(pipeline.metrics().snapshot()),
            AuditHandle::Disabled => None,
        }
    }
}

// ============================================================================
// PIPELINE
// ============================================================================

pub struct AuditPipeline {
    queue: EntryQueue,
    sink: Arc<dyn BatchSink>,
    metrics: Arc<PipelineMetrics>,
    batch_size: usize,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Option<RunningTasks>>,
}

struct RunningTasks {
    workers: Vec<JoinHandle<()>>,
    sweeper: Option<JoinHandle<()>>,
    pool: Option<PgPool>,
}

impl AuditPipeline {
    /// Verify the store and schema behind `pool`, then spawn the workers and,
    /// when retention is on, the sweeper.
    pub async fn start(pool: PgPool, config: &AuditConfig) -> Result<Self, AuditError> {
        config.validate()?;

        let version = db::health_check(&pool)
            .await
            .map_err(|e| AuditError::StartupUnavailable(e.to_string()))?;
        let tables = schema::verify_schema(&pool).await?;
        tracing::info!(
            target_db = %config.database.describe(),
            postgres = %version,
            tables = tables.len(),
            "Audit store verified"
        );

        let metrics = Arc::new(PipelineMetrics::new());
        let sweeper = if config.retention.sweeper_enabled() {
            Some(RetentionSweeper::new(
                pool.clone(),
                &config.retention,
                metrics.clone(),
            ))
        } else {
            tracing::info!(
                retention_days = config.retention.days,
                auto_cleanup = config.retention.auto_cleanup,
                "Retention sweeper not started"
            );
            None
        };

        let sink: Arc<dyn BatchSink> = Arc::new(PgBatchWriter::new(pool.clone()));
        Ok(Self::spawn(config, sink, metrics, sweeper, Some(pool)))
    }

    /// Run the queue and workers against any sink, with no store of its own
    /// and no retention.
    #[cfg(test)]
    pub(crate) fn with_sink(config: &AuditConfig, sink: Arc<dyn BatchSink>) -> Self {
        Self::spawn(config, sink, Arc::new(PipelineMetrics::new()), None, None)
    }

    fn spawn(
        config: &AuditConfig,
        sink: Arc<dyn BatchSink>,
        metrics: Arc<PipelineMetrics>,
        sweeper: Option<RetentionSweeper>,
        pool: Option<PgPool>,
    ) -> Self {
        let queue = EntryQueue::new(config.queue_size, metrics.clone());
        let (shutdown_tx, _) = broadcast::channel(1);
        let batch_size = config.batch_size.max(1);

        let workers = (0..config.workers.max(1))
            .map(|id| {
                let worker = AuditWorker::new(
                    id,
                    queue.clone(),
                    sink.clone(),
                    metrics.clone(),
                    batch_size,
                    config.batch_interval(),
                );
                tokio::spawn(
                    worker
                        .run(shutdown_tx.subscribe())
                        .instrument(tracing::info_span!("audit_worker", worker_id = id)),
                )
            })
            .collect::<Vec<_>>();

        let sweeper = sweeper.map(|s| {
            tokio::spawn(
                s.run(shutdown_tx.subscribe())
                    .instrument(tracing::info_span!("audit_retention")),
            )
        });

        tracing::info!(
            workers = workers.len(),
            queue_size = queue.capacity(),
            batch_size,
            batch_interval_ms = config.batch_interval_ms,
            retention = sweeper.is_some(),
            "Audit pipeline started"
        );

        Self {
            queue,
            sink,
            metrics,
            batch_size,
            shutdown_tx,
            tasks: Mutex::new(Some(RunningTasks {
                workers,
                sweeper,
                pool,
            })),
        }
    }

    pub fn submit(&self, record: InteractionRecord) -> SubmitOutcome {
        self.queue.submit(record)
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.depth()
    }

    pub async fn shutdown(&self) {
        let Some(tasks) = self.tasks.lock().await.take() else {
            return;
        };
        tracing::info!(queued = self.queue.depth(), "Shutting down audit pipeline");

        let _ = self.shutdown_tx.send(());

        for result in join_all(tasks.workers).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Audit worker ended abnormally");
            }
        }
        if let Some(sweeper) = tasks.sweeper {
            if let Err(e) = sweeper.await {
                tracing::error!(error = %e, "Retention sweeper ended abnormally");
            }
        }

        let mut remaining = self.queue.close_and_drain().await;
        if !remaining.is_empty() {
            tracing::info!(records = remaining.len(), "Flushing unclaimed audit records");
            let span = tracing::info_span!("audit_drain");
            while !remaining.is_empty() {
                let take = remaining.len().min(self.batch_size);
                let mut batch: Vec<InteractionRecord> = remaining.drain(..take).collect();
                flush_batch(self.sink.as_ref(), &self.metrics, &mut batch)
                    .instrument(span.clone())
                    .await;
            }
        }

        if let Some(pool) = tasks.pool {
            pool.close().await;
        }

        let snapshot = self.metrics.snapshot();
        tracing::info!(
            submitted = snapshot.submitted,
            dropped = snapshot.dropped,
            persisted = snapshot.records_persisted,
            discarded = snapshot.records_discarded,
            batches_failed = snapshot.batches_failed,
            "Audit pipeline stopped"
        );
    }
}

// ============================================================================
// TESTS
// ============================================================================

//! Retention sweeper: deletes interactions older than `retention.days`
//!
//! Runs once a day at `retention.cleanup_time` (local time). Each run is a
//! single transaction: children (performance_metrics, tool_calls, thoughts)
//! are deleted before their interactions. Session rows are kept.
//!
//! A failed run is logged and the sweeper waits for the next day's slot. On
//! shutdown an in-flight run is abandoned; its transaction rolls back.

use chrono::{DateTime, Duration as ChronoDuration, Local, NaiveTime, TimeZone, Utc};
use copilot_audit_core::{AuditError, PipelineMetrics, RetentionConfig};
use sqlx::PgPool;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Child tables first, parent last.
const SWEEP_TABLES: [&str; 4] = ["performance_metrics", "tool_calls", "thoughts", "interactions"];

/// Rows removed by one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub cutoff: Option<DateTime<Utc>>,
    pub interactions: u64,
    pub thoughts: u64,
    pub tool_calls: u64,
    pub performance_metrics: u64,
}

pub struct RetentionSweeper {
    pool: PgPool,
    days: u32,
    cleanup_time: NaiveTime,
    metrics: Arc<PipelineMetrics>,
}

impl RetentionSweeper {
    /// An unparsable `cleanup_time` is logged and replaced with 03:00.
    pub fn new(pool: PgPool, config: &RetentionConfig, metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            pool,
            days: config.days,
            cleanup_time: config.effective_cleanup_time(),
            metrics,
        }
    }

    pub fn cleanup_time(&self) -> NaiveTime {
        self.cleanup_time
    }

    /// Wait for each daily slot and sweep, until `shutdown` fires.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(
            retention_days = self.days,
            cleanup_time = %self.cleanup_time,
            "Retention sweeper started"
        );

        loop {
            let now = Local::now();
            let next = next_occurrence(&now, self.cleanup_time);
            let wait = (next - now).to_std().unwrap_or_default();
            tracing::debug!(next_run = %next, "Retention sweep scheduled");

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.recv() => {
                    tracing::info!("Retention sweeper shutting down");
                    return;
                }
            }

            tokio::select! {
                result = self.sweep(Utc::now()) => match result {
                    Ok(report) => {
                        self.metrics.sweeps_completed.inc();
                        self.metrics.interactions_swept.inc_by(report.interactions);
                    }
                    Err(e) => {
                        self.metrics.sweeps_failed.inc();
                        tracing::error!(error = %e, "Retention sweep failed, retrying at next scheduled time");
                    }
                },
                _ = shutdown.recv() => {
                    tracing::info!("Retention sweeper shutting down mid-sweep, run abandoned");
                    return;
                }
            }
        }
    }

    /// Delete every interaction created before `now - days`, with its children.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, AuditError> {
        if self.days == 0 {
            tracing::info!("Retention is unlimited (days = 0), nothing to sweep");
            return Ok(SweepReport::default());
        }
        let cutoff = retention_cutoff(now, self.days);
        tracing::info!(cutoff = %cutoff, retention_days = self.days, "Retention sweep starting");

        let mut tx = self.pool.begin().await.map_err(AuditError::SweepFailed)?;

        let expired: Vec<Uuid> =
            sqlx::query_scalar("SELECT interaction_id FROM interactions WHERE created_at < $1")
                .bind(cutoff)
                .fetch_all(&mut *tx)
                .await
                .map_err(AuditError::SweepFailed)?;

        let mut report = SweepReport {
            cutoff: Some(cutoff),
            ..SweepReport::default()
        };

        if expired.is_empty() {
            tracing::info!("No expired audit interactions to remove");
            return Ok(report);
        }

        for table in SWEEP_TABLES {
            let sql = format!("DELETE FROM {} WHERE interaction_id = ANY($1)", table);
            let deleted = sqlx::query(&sql)
                .bind(&expired)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    tracing::error!(table, error = %e, "Failed to delete expired audit rows");
                    AuditError::SweepFailed(e)
                })?
                .rows_affected();

            match table {
                "performance_metrics" => report.performance_metrics = deleted,
                "tool_calls" => report.tool_calls = deleted,
                "thoughts" => report.thoughts = deleted,
                _ => report.interactions = deleted,
            }
        }

        tx.commit().await.map_err(AuditError::SweepFailed)?;

        tracing::info!(
            interactions = report.interactions,
            thoughts = report.thoughts,
            tool_calls = report.tool_calls,
            performance_metrics = report.performance_metrics,
            "Retention sweep complete"
        );
        Ok(report)
    }
}

/// Oldest creation time that survives a sweep at `now`.
pub fn retention_cutoff(now: DateTime<Utc>, days: u32) -> DateTime<Utc> {
    now - ChronoDuration::days(i64::from(days))
}

/// Next time `at` falls on the wall clock strictly after `now`: today if
/// still ahead, otherwise tomorrow.
pub fn next_occurrence<Tz: TimeZone>(now: &DateTime<Tz>, at: NaiveTime) -> DateTime<Tz> {
    let tz = now.timezone();
    let today = now.date_naive().and_time(at);
    let mut candidate = if today > now.naive_local() {
        today
    } else {
        today + ChronoDuration::days(1)
    };

    // A DST gap can make the wall-clock time not exist on a given day.
    for _ in 0..3 {
        if let Some(resolved) = tz.from_local_datetime(&candidate).earliest() {
            if resolved > *now {
                return resolved;
            }
        }
        candidate += ChronoDuration::days(1);
    }
    now.clone() + ChronoDuration::days(1)
}

// ============================================================================
// TESTS
// ============================================================================

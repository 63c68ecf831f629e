//! Transactional writer: persists a batch of interaction records
//!
//! One batch is one Postgres transaction spanning all five audit tables:
//! 1. sessions (first sight only; identity never rewritten)
//! 2. interactions
//! 3. thoughts (only when the reasoning trace is non-empty)
//! 4. tool_calls, one row per call, sequence numbers as recorded
//! 5. performance_metrics, one row per metric
//!
//! Any failed insert rolls back the whole batch, including records that would
//! have succeeded on their own. Callers get a `BatchCommitFailed` naming the
//! record and table that broke it.

use async_trait::async_trait;
use copilot_audit_core::models::duration_ms;
use copilot_audit_core::{AuditError, FlushStage, InteractionRecord};
use sqlx::{PgConnection, PgPool};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Destination for flushed batches.
///
/// `PgBatchWriter` is the production implementation; tests swap in
/// in-memory sinks to drive the worker pool without a database.
#[async_trait]
pub trait BatchSink: Send + Sync {
    /// Persist every record or none of them.
    async fn write_batch(&self, batch: &[InteractionRecord]) -> Result<(), AuditError>;
}

pub struct PgBatchWriter {
    pool: PgPool,
}

impl PgBatchWriter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BatchSink for PgBatchWriter {
    async fn write_batch(&self, batch: &[InteractionRecord]) -> Result<(), AuditError> {
        if batch.is_empty() {
            return Ok(());
        }
        let batch_size = batch.len();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|source| AuditError::BatchCommitFailed {
                batch_size,
                stage: FlushStage::Begin,
                source,
            })?;

        // Sessions go first, in id order, so concurrent batches lock them
        // in the same order. First sighting within the batch wins.
        let mut sessions: BTreeMap<Uuid, &InteractionRecord> = BTreeMap::new();
        for record in batch {
            sessions.entry(record.session_id).or_insert(record);
        }
        for record in sessions.values() {
            insert_session(&mut tx, record)
                .await
                .map_err(|source| record_failure(batch_size, record, "sessions", source))?;
        }

        for record in batch {
            insert_interaction_rows(&mut tx, record)
                .await
                .map_err(|(table, source)| record_failure(batch_size, record, table, source))?;
        }

        // Dropping `tx` on any early return above rolls it back.
        tx.commit()
            .await
            .map_err(|source| AuditError::BatchCommitFailed {
                batch_size,
                stage: FlushStage::Commit,
                source,
            })?;

        tracing::debug!(
            batch_size,
            sessions = sessions.len(),
            "Audit batch committed"
        );
        Ok(())
    }
}

fn record_failure(
    batch_size: usize,
    record: &InteractionRecord,
    table: &'static str,
    source: sqlx::Error,
) -> AuditError {
    AuditError::BatchCommitFailed {
        batch_size,
        stage: FlushStage::Record {
            interaction_id: record.interaction_id,
            session_id: record.session_id,
            table,
        },
        source,
    }
}

/// Insert-if-absent. A concurrent insert of the same session blocks until the
/// other transaction finishes, then becomes a no-op.
async fn insert_session(conn: &mut PgConnection, record: &InteractionRecord) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO sessions (session_id, user_id, client_ip, user_agent)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (session_id) DO NOTHING
        "#,
    )
    .bind(record.session_id)
    .bind(&record.user_id)
    .bind(&record.client_ip)
    .bind(&record.user_agent)
    .execute(conn)
    .await?;
    Ok(())
}

/// Interaction row plus its children. On failure, reports which table.
async fn insert_interaction_rows(
    conn: &mut PgConnection,
    record: &InteractionRecord,
) -> Result<(), (&'static str, sqlx::Error)> {
    sqlx::query(
        r#"
        INSERT INTO interactions
            (interaction_id, session_id, question, model_name, provider, base_url, cluster,
             final_answer, status, total_duration_ms, assistant_duration_ms, parse_duration_ms)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        "#,
    )
    .bind(record.interaction_id)
    .bind(record.session_id)
    .bind(&record.question)
    .bind(&record.model_name)
    .bind(&record.provider)
    .bind(&record.base_url)
    .bind(&record.cluster)
    .bind(&record.final_answer)
    .bind(&record.status)
    .bind(duration_ms(record.total_duration))
    .bind(duration_ms(record.assistant_duration))
    .bind(duration_ms(record.parse_duration))
    .execute(&mut *conn)
    .await
    .map_err(|e| ("interactions", e))?;

    if record.has_thought() {
        sqlx::query("INSERT INTO thoughts (interaction_id, thought) VALUES ($1, $2)")
            .bind(record.interaction_id)
            .bind(&record.thought)
            .execute(&mut *conn)
            .await
            .map_err(|e| ("thoughts", e))?;
    }

    for call in &record.tool_calls {
        sqlx::query(
            r#"
            INSERT INTO tool_calls
                (interaction_id, tool_name, tool_input, tool_observation, sequence_number, duration_ms)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(record.interaction_id)
        .bind(&call.tool_name)
        .bind(&call.input)
        .bind(&call.observation)
        .bind(i32::try_from(call.sequence_number).unwrap_or(i32::MAX))
        .bind(duration_ms(call.duration))
        .execute(&mut *conn)
        .await
        .map_err(|e| ("tool_calls", e))?;
    }

    for (name, duration) in &record.perf_metrics {
        sqlx::query(
            "INSERT INTO performance_metrics (interaction_id, metric_name, duration_ms) VALUES ($1, $2, $3)",
        )
        .bind(record.interaction_id)
        .bind(name)
        .bind(duration_ms(*duration))
        .execute(&mut *conn)
        .await
        .map_err(|e| ("performance_metrics", e))?;
    }

    Ok(())
}

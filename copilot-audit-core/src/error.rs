use std::fmt;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum AuditError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid audit configuration: {0}")]
    InvalidConfig(String),

    #[error("Audit store unavailable: {0}")]
    StartupUnavailable(String),

    #[error("Audit schema incomplete: {0}")]
    SchemaMissing(String),

    #[error("Batch of {batch_size} records rolled back at {stage}: {source}")]
    BatchCommitFailed {
        batch_size: usize,
        stage: FlushStage,
        #[source]
        source: sqlx::Error,
    },

    #[error("Retention sweep failed: {0}")]
    SweepFailed(#[source] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AuditError {
    /// Interaction that caused a batch rollback, when one record is to blame.
    pub fn offending_interaction(&self) -> Option<Uuid> {
        match self {
            AuditError::BatchCommitFailed {
                stage: FlushStage::Record { interaction_id, .. },
                ..
            } => Some(*interaction_id),
            _ => None,
        }
    }
}

/// Where inside a batch transaction a write failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushStage {
    Begin,
    Record {
        interaction_id: Uuid,
        session_id: Uuid,
        table: &'static str,
    },
    Commit,
}

impl fmt::Display for FlushStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlushStage::Begin => f.write_str("transaction begin"),
            FlushStage::Record {
                interaction_id,
                session_id,
                table,
            } => write!(
                f,
                "interaction {} (session {}) writing {}",
                interaction_id, session_id, table
            ),
            FlushStage::Commit => f.write_str("transaction commit"),
        }
    }
}

pub mod config;
pub mod db;
pub mod error;
pub mod metrics;
pub mod models;
pub mod schema;

pub use config::{AuditConfig, DatabaseConfig, LoggingConfig, RetentionConfig};
pub use error::{AuditError, FlushStage};
pub use metrics::{Counter, MetricsSnapshot, PipelineMetrics};
pub use models::{InteractionRecord, ToolCallRecord};

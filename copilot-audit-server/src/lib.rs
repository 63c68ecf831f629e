pub mod pipeline;
pub mod subsystems;
pub mod telemetry;

pub use pipeline::{AuditHandle, AuditPipeline};
pub use subsystems::queue::{EntryQueue, SubmitOutcome};
pub use subsystems::writer::{BatchSink, PgBatchWriter};

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One tool invocation made while answering an interaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub tool_name: String,
    #[serde(default)]
    pub input: String,
    #[serde(default)]
    pub observation: String,
    /// Zero-based position in the order the calls happened.
    pub sequence_number: u32,
    #[serde(default, rename = "duration_ms", with = "super::millis")]
    pub duration: Duration,
}

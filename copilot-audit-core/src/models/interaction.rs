use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

use super::tool_call::ToolCallRecord;

/// The complete audit payload for one question/answer exchange.
///
/// Built once by the request path after the exchange finishes and handed to
/// the pipeline exactly once. Both identifiers are generated by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractionRecord {
    pub session_id: Uuid,
    pub interaction_id: Uuid,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub client_ip: String,
    #[serde(default)]
    pub user_agent: String,
    pub question: String,
    #[serde(default)]
    pub model_name: String,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub cluster: String,
    /// Reasoning trace; an empty string means no `thoughts` row.
    #[serde(default)]
    pub thought: String,
    #[serde(default)]
    pub final_answer: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallRecord>,
    #[serde(default, rename = "perf_metrics_ms", with = "super::millis::map")]
    pub perf_metrics: BTreeMap<String, Duration>,
    #[serde(default, rename = "total_duration_ms", with = "super::millis")]
    pub total_duration: Duration,
    #[serde(default, rename = "assistant_duration_ms", with = "super::millis")]
    pub assistant_duration: Duration,
    #[serde(default, rename = "parse_duration_ms", with = "super::millis")]
    pub parse_duration: Duration,
}

impl InteractionRecord {
    pub fn new(session_id: Uuid, interaction_id: Uuid, question: impl Into<String>) -> Self {
        Self {
            session_id,
            interaction_id,
            user_id: String::new(),
            client_ip: String::new(),
            user_agent: String::new(),
            question: question.into(),
            model_name: String::new(),
            provider: String::new(),
            base_url: String::new(),
            cluster: String::new(),
            thought: String::new(),
            final_answer: String::new(),
            status: String::new(),
            tool_calls: Vec::new(),
            perf_metrics: BTreeMap::new(),
            total_duration: Duration::ZERO,
            assistant_duration: Duration::ZERO,
            parse_duration: Duration::ZERO,
        }
    }

    /// Append a tool call, numbering it after the ones already recorded.
    pub fn push_tool_call(
        &mut self,
        tool_name: impl Into<String>,
        input: impl Into<String>,
        observation: impl Into<String>,
        duration: Duration,
    ) -> &mut Self {
        let sequence_number = self.tool_calls.len() as u32;
        self.tool_calls.push(ToolCallRecord {
            tool_name: tool_name.into(),
            input: input.into(),
            observation: observation.into(),
            sequence_number,
            duration,
        });
        self
    }

    pub fn record_metric(&mut self, name: impl Into<String>, duration: Duration) -> &mut Self {
        self.perf_metrics.insert(name.into(), duration);
        self
    }

    pub fn has_thought(&self) -> bool {
        !self.thought.is_empty()
    }
}

//! Guardrails wrapping run I/O.
//!
//! The input guard classifies bulk intent before the supervisor loop starts;
//! the output guard inspects every assistant turn of an active bulk
//! operation for the announce-and-stop anti-pattern. Both classifiers sit
//! behind the [`GuardModel`] port; the rule-based implementation keeps the
//! whole guardrail path deterministic when no model is wired in, and serves
//! as the fallback when the model classifier fails.

mod input;
mod llm;
mod output;
mod rule;

pub use input::InputGuard;
pub use llm::LlmGuard;
pub use output::{GuardDecision, OutputGuard};
pub use rule::RuleBasedGuard;

use serde::{Deserialize, Serialize};

use crate::types::BulkOperationState;

/// Input classification: does this request declare a bulk operation?
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkVerdict {
    pub is_bulk_operation: bool,
    #[serde(default)]
    pub expected_items: usize,
    #[serde(default)]
    pub operation_type: Option<String>,
    #[serde(default)]
    pub reasoning: String,
}

impl BulkVerdict {
    pub fn not_bulk(reasoning: impl Into<String>) -> Self {
        Self {
            is_bulk_operation: false,
            expected_items: 0,
            operation_type: None,
            reasoning: reasoning.into(),
        }
    }
}

/// Output classification for one assistant turn of an active bulk run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopVerdict {
    pub is_announce_and_stop: bool,
    pub has_actual_work: bool,
    pub is_complete: bool,
    #[serde(default)]
    pub progress_count: usize,
    #[serde(default)]
    pub reasoning: String,
}

#[async_trait::async_trait]
pub trait GuardModel: Send + Sync {
    async fn classify_bulk(&self, request: &str) -> anyhow::Result<BulkVerdict>;

    async fn classify_stop(
        &self,
        output: &str,
        state: &BulkOperationState,
    ) -> anyhow::Result<StopVerdict>;
}

//! Model-backed guard classifier. Prompts are fixed, responses must be a
//! single JSON object; anything else is an error and the caller falls back
//! to the rule-based guard.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::{BulkVerdict, GuardModel, StopVerdict};
use crate::llm::{ChatModel, ModelRequest, ModelTurn, PromptMessage};
use crate::types::BulkOperationState;

const BULK_SYSTEM_PROMPT: &str = "You classify e-commerce operator requests. Reply with one JSON object: {\"is_bulk_operation\": bool, \"expected_items\": int, \"operation_type\": string|null, \"reasoning\": string}. A bulk operation processes many items (lists of products, URLs, SKUs, or an explicit count).";

const STOP_SYSTEM_PROMPT: &str = "You review an assistant turn from an in-flight bulk operation. Reply with one JSON object: {\"is_announce_and_stop\": bool, \"has_actual_work\": bool, \"is_complete\": bool, \"progress_count\": int, \"reasoning\": string}. Announce-and-stop means the assistant promises further work then hands control back without doing it.";

pub struct LlmGuard {
    model: Arc<dyn ChatModel>,
}

impl LlmGuard {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self { model }
    }

    async fn classify<T: serde::de::DeserializeOwned>(
        &self,
        system: &str,
        user: String,
    ) -> anyhow::Result<T> {
        let request = ModelRequest::new(vec![
            PromptMessage::System(system.to_string()),
            PromptMessage::User(user),
        ]);
        let cancel = CancellationToken::new();
        let turn = self
            .model
            .complete(request, &cancel)
            .await
            .map_err(|e| anyhow::anyhow!("guard classifier call failed: {e}"))?;
        let text = match turn {
            ModelTurn::Text(text) => text,
            ModelTurn::ToolCalls { .. } => {
                anyhow::bail!("guard classifier returned tool calls instead of JSON")
            }
        };
        parse_json_object(&text)
    }
}

/// Extracts the first JSON object from classifier output; models wrap JSON
/// in prose or fences often enough that strict parsing alone is not viable.
fn parse_json_object<T: serde::de::DeserializeOwned>(text: &str) -> anyhow::Result<T> {
    if let Ok(parsed) = serde_json::from_str(text.trim()) {
        return Ok(parsed);
    }
    let start = text
        .find('{')
        .ok_or_else(|| anyhow::anyhow!("no JSON object in classifier output"))?;
    let end = text
        .rfind('}')
        .ok_or_else(|| anyhow::anyhow!("unterminated JSON object in classifier output"))?;
    Ok(serde_json::from_str(&text[start..=end])?)
}

#[async_trait::async_trait]
impl GuardModel for LlmGuard {
    async fn classify_bulk(&self, request: &str) -> anyhow::Result<BulkVerdict> {
        self.classify(BULK_SYSTEM_PROMPT, format!("Operator request:\n{request}"))
            .await
    }

    async fn classify_stop(
        &self,
        output: &str,
        state: &BulkOperationState,
    ) -> anyhow::Result<StopVerdict> {
        let user = format!(
            "Operation type: {}\nExpected items: {}\nCompleted so far: {}\n\nAssistant turn:\n{output}",
            state.operation_type.as_deref().unwrap_or("unknown"),
            state.expected_items,
            state.completed_items.len(),
        );
        self.classify(STOP_SYSTEM_PROMPT, user).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OrchestratorError;

    struct CannedModel(String);

    #[async_trait::async_trait]
    impl ChatModel for CannedModel {
        async fn complete(
            &self,
            _request: ModelRequest,
            _cancel: &CancellationToken,
        ) -> Result<ModelTurn, OrchestratorError> {
            Ok(ModelTurn::Text(self.0.clone()))
        }
    }

    #[tokio::test]
    async fn parses_fenced_json() {
        let guard = LlmGuard::new(Arc::new(CannedModel(
            "Here is my verdict:\n```json\n{\"is_bulk_operation\": true, \"expected_items\": 25, \"operation_type\": \"discount_removal\", \"reasoning\": \"25 urls\"}\n```".to_string(),
        )));
        let verdict = guard.classify_bulk("remove discounts").await.unwrap();
        assert!(verdict.is_bulk_operation);
        assert_eq!(verdict.expected_items, 25);
    }

    #[tokio::test]
    async fn non_json_output_is_an_error() {
        let guard = LlmGuard::new(Arc::new(CannedModel("definitely bulk".to_string())));
        assert!(guard.classify_bulk("whatever").await.is_err());
    }
}

use std::sync::Arc;
use std::time::Duration;

use async_openai::types::ChatCompletionTool;
use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::OrchestratorError;

pub const MODEL_MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, PartialEq)]
pub enum PromptMessage {
    System(String),
    User(String),
    Assistant {
        content: String,
        tool_calls: Vec<ToolInvocation>,
    },
    /// Result of a tool invocation, fed back to the model.
    ToolResult {
        tool_call_id: String,
        tool_name: String,
        content: String,
    },
}

impl PromptMessage {
    pub fn assistant(content: impl Into<String>) -> Self {
        PromptMessage::Assistant {
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }
}

/// A tool call requested by the model. Arguments are the raw JSON string as
/// emitted by the function-call surface.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub messages: Vec<PromptMessage>,
    pub tools: Vec<ChatCompletionTool>,
    pub temperature: f32,
}

impl ModelRequest {
    pub fn new(messages: Vec<PromptMessage>) -> Self {
        Self {
            messages,
            tools: Vec::new(),
            temperature: 0.2,
        }
    }

    pub fn with_tools(mut self, tools: Vec<ChatCompletionTool>) -> Self {
        self.tools = tools;
        self
    }
}

/// What one model turn resolved to.
#[derive(Debug, Clone)]
pub enum ModelTurn {
    /// Final assistant text for this turn.
    Text(String),
    /// The model asked for one or more tool invocations.
    ToolCalls {
        content: String,
        calls: Vec<ToolInvocation>,
    },
}

/// Port over the underlying chat provider. Adapters live outside the core.
#[async_trait::async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(
        &self,
        request: ModelRequest,
        cancel: &CancellationToken,
    ) -> Result<ModelTurn, OrchestratorError>;

    /// Streaming variant: assistant text is delivered through `delta_tx` as it
    /// arrives; the resolved turn is returned once the stream ends. The
    /// default forwards the non-streaming result as a single delta.
    async fn complete_stream(
        &self,
        request: ModelRequest,
        delta_tx: mpsc::Sender<String>,
        cancel: &CancellationToken,
    ) -> Result<ModelTurn, OrchestratorError> {
        let turn = self.complete(request, cancel).await?;
        let text = match &turn {
            ModelTurn::Text(text) => text.clone(),
            ModelTurn::ToolCalls { content, .. } => content.clone(),
        };
        if !text.is_empty() {
            let _ = delta_tx.send(text).await;
        }
        Ok(turn)
    }
}

/// Runs a completion with bounded retry and jitter for transient failures.
/// Aborts immediately when the run's cancellation token fires.
pub async fn complete_with_retry(
    model: &Arc<dyn ChatModel>,
    request: ModelRequest,
    cancel: &CancellationToken,
) -> Result<ModelTurn, OrchestratorError> {
    let mut last_err = None;
    for attempt in 0..MODEL_MAX_RETRIES {
        if cancel.is_cancelled() {
            return Err(OrchestratorError::Interrupted);
        }
        match model.complete(request.clone(), cancel).await {
            Ok(turn) => return Ok(turn),
            Err(OrchestratorError::Interrupted) => return Err(OrchestratorError::Interrupted),
            Err(e) if e.is_transient() && attempt + 1 < MODEL_MAX_RETRIES => {
                let jitter_ms = rand::thread_rng().gen_range(100..500);
                let backoff = Duration::from_millis(2u64.pow(attempt) * 500 + jitter_ms);
                tracing::warn!(
                    attempt = attempt + 1,
                    "model call failed, retrying in {:?}: {e}",
                    backoff
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(OrchestratorError::Interrupted),
                    _ = tokio::time::sleep(backoff) => {}
                }
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| OrchestratorError::Model("model retries exhausted".into())))
}

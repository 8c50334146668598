//! Sub-agents: LLM-driven workers bound to an instruction template, a tool
//! set, and a context bundle. All agents are constructed per-invocation;
//! there is no cross-task reuse.

pub mod bash;
pub mod builtin;
mod factory;
pub mod instructions;
mod parallel;
pub mod swe;

pub use bash::BashCapability;
pub use factory::AgentFactory;
pub use parallel::{BatchPolicy, ItemResult, ItemStatus, ParallelExecutorAgent};

use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::bus::{events, EventBus};
use crate::error::OrchestratorError;
use crate::llm::{complete_with_retry, ChatModel, ModelRequest, ModelTurn, PromptMessage};
use crate::tools::ToolRegistry;
use crate::types::ConversationId;

pub const AGENT_MAX_ITERATIONS: usize = 20;

pub const INTERRUPTED_MESSAGE: &str = "Execution was interrupted by user";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Bash,
    SoftwareEngineering,
    ParallelExecutor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Completed,
    Failed,
    Interrupted,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentOutcome {
    pub status: AgentStatus,
    pub output: String,
}

impl AgentOutcome {
    pub fn interrupted() -> Self {
        Self {
            status: AgentStatus::Interrupted,
            output: INTERRUPTED_MESSAGE.to_string(),
        }
    }
}

/// The shared tool-loop body of the bash and engineering agents.
pub struct LoopAgent {
    name: String,
    kind: AgentKind,
    instructions: String,
    tools: ToolRegistry,
    model: Arc<dyn ChatModel>,
    conversation_id: ConversationId,
    bus: Arc<EventBus>,
    max_iterations: usize,
}

impl LoopAgent {
    pub fn new(
        name: impl Into<String>,
        kind: AgentKind,
        instructions: String,
        tools: ToolRegistry,
        model: Arc<dyn ChatModel>,
        conversation_id: ConversationId,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            instructions,
            tools,
            model,
            conversation_id,
            bus,
            max_iterations: AGENT_MAX_ITERATIONS,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> AgentKind {
        self.kind
    }

    /// Drives the tool loop to completion. Abort yields an `interrupted`
    /// outcome, never a failure.
    pub async fn run(&self, task: &str, cancel: &CancellationToken) -> AgentOutcome {
        let mut messages = vec![
            PromptMessage::System(self.instructions.clone()),
            PromptMessage::User(task.to_string()),
        ];
        let definitions = self.tools.definitions();

        for iteration in 0..self.max_iterations {
            if cancel.is_cancelled() {
                return AgentOutcome::interrupted();
            }
            let request = ModelRequest::new(messages.clone()).with_tools(definitions.clone());
            let turn = match complete_with_retry(&self.model, request, cancel).await {
                Ok(turn) => turn,
                Err(OrchestratorError::Interrupted) => return AgentOutcome::interrupted(),
                Err(e) => {
                    tracing::error!(agent = %self.name, "agent model call failed: {e}");
                    return AgentOutcome {
                        status: AgentStatus::Failed,
                        output: format!("Agent failed: {e}"),
                    };
                }
            };

            match turn {
                ModelTurn::Text(text) => {
                    tracing::debug!(agent = %self.name, iteration, "agent finished");
                    return AgentOutcome {
                        status: AgentStatus::Completed,
                        output: text,
                    };
                }
                ModelTurn::ToolCalls { content, calls } => {
                    messages.push(PromptMessage::Assistant {
                        content,
                        tool_calls: calls.clone(),
                    });

                    // Calls in one turn run concurrently; responses are
                    // appended in request order.
                    let results = join_all(calls.iter().map(|call| {
                        let tools = &self.tools;
                        let conv = self.conversation_id;
                        let cancel = cancel.clone();
                        async move {
                            let args = serde_json::from_str(&call.arguments)
                                .unwrap_or(serde_json::Value::Null);
                            tools.invoke(conv, &call.name, args, &cancel).await
                        }
                    }))
                    .await;

                    let mut saw_interrupt = false;
                    for (call, result) in calls.iter().zip(results) {
                        let content = match result {
                            Ok(value) => value.to_string(),
                            Err(OrchestratorError::Interrupted) => {
                                saw_interrupt = true;
                                INTERRUPTED_MESSAGE.to_string()
                            }
                            Err(e) => format!("Error: {e}"),
                        };
                        self.bus.emit(
                            self.conversation_id,
                            events::AGENT_TOOL_CALL,
                            json!({
                                "agent": self.name,
                                "tool": call.name,
                                "args": call.arguments,
                            }),
                        );
                        messages.push(PromptMessage::ToolResult {
                            tool_call_id: call.id.clone(),
                            tool_name: call.name.clone(),
                            content,
                        });
                    }
                    if saw_interrupt || cancel.is_cancelled() {
                        return AgentOutcome::interrupted();
                    }
                }
            }
        }

        AgentOutcome {
            status: AgentStatus::Failed,
            output: format!("Agent stopped: max iterations ({}) reached", self.max_iterations),
        }
    }
}

//! Built-in tools handed to every sub-agent: task status updates and
//! conversation topic updates. Both are bound to the conversation the agent
//! was constructed for.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::conversation::{ConversationStore, TaskManager};
use crate::error::OrchestratorError;
use crate::tools::Tool;
use crate::types::{ConversationId, TaskStatus};

pub struct UpdateTaskStatusTool {
    manager: Arc<TaskManager>,
    conv: ConversationId,
}

impl UpdateTaskStatusTool {
    pub fn new(manager: Arc<TaskManager>, conv: ConversationId) -> Self {
        Self { manager, conv }
    }
}

#[async_trait::async_trait]
impl Tool for UpdateTaskStatusTool {
    fn name(&self) -> &str {
        "update_task_status"
    }

    fn description(&self) -> &str {
        "Marks a plan task as in_progress or completed by index."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "index": {
                    "type": "integer",
                    "description": "0-based task index in the current plan."
                },
                "status": {
                    "type": "string",
                    "enum": ["pending", "in_progress", "completed"],
                    "description": "New task status."
                }
            },
            "required": ["index", "status"]
        })
    }

    async fn invoke(&self, args: Value) -> Result<Value, OrchestratorError> {
        let index = args
            .get("index")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| OrchestratorError::Validation("update_task_status: missing index".into()))?
            as usize;
        let status: TaskStatus = serde_json::from_value(
            args.get("status")
                .cloned()
                .ok_or_else(|| OrchestratorError::Validation("update_task_status: missing status".into()))?,
        )
        .map_err(|e| OrchestratorError::Validation(format!("update_task_status: {e}")))?;

        self.manager.update_status(self.conv, index, status).await?;
        Ok(json!({"ok": true, "index": index, "status": status}))
    }
}

pub struct UpdateTopicTool {
    store: Arc<dyn ConversationStore>,
    conv: ConversationId,
}

impl UpdateTopicTool {
    pub fn new(store: Arc<dyn ConversationStore>, conv: ConversationId) -> Self {
        Self { store, conv }
    }
}

#[async_trait::async_trait]
impl Tool for UpdateTopicTool {
    fn name(&self) -> &str {
        "update_conversation_topic"
    }

    fn description(&self) -> &str {
        "Sets the conversation topic title and optional details."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "title": {
                    "type": "string",
                    "description": "Short topic title."
                },
                "details": {
                    "type": "string",
                    "description": "Optional topic details."
                }
            },
            "required": ["title"]
        })
    }

    async fn invoke(&self, args: Value) -> Result<Value, OrchestratorError> {
        let title = args
            .get("title")
            .and_then(|v| v.as_str())
            .ok_or_else(|| OrchestratorError::Validation("update_conversation_topic: missing title".into()))?;
        let details = args
            .get("details")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        self.store
            .set_topic(self.conv, Some(title.to_string()), details)
            .await
            .map_err(|e| OrchestratorError::Store(e.to_string()))?;
        Ok(json!({"ok": true}))
    }
}

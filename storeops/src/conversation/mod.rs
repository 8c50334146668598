//! Conversation persistence port and the task manager.
//!
//! The database behind conversations and messages is external; the runtime
//! sees this trait. `MemoryConversationStore` backs tests and single-node
//! development.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::sync::RwLock;

use crate::bus::{events, EventBus};
use crate::checkpoint::CheckpointStore;
use crate::error::OrchestratorError;
use crate::types::{
    AutonomyLevel, ChatMessage, ChatRole, Conversation, ConversationId, TaskItem, TaskStatus,
};

#[async_trait::async_trait]
pub trait ConversationStore: Send + Sync {
    async fn create(&self, user_id: &str, title: &str) -> anyhow::Result<Conversation>;

    async fn get(&self, id: ConversationId) -> anyhow::Result<Option<Conversation>>;

    async fn append_message(
        &self,
        id: ConversationId,
        role: ChatRole,
        content: &str,
    ) -> anyhow::Result<ChatMessage>;

    /// Most recent `limit` messages in chronological order.
    async fn messages(&self, id: ConversationId, limit: usize) -> anyhow::Result<Vec<ChatMessage>>;

    async fn set_topic(
        &self,
        id: ConversationId,
        title: Option<String>,
        details: Option<String>,
    ) -> anyhow::Result<()>;

    async fn autonomy_preference(&self, id: ConversationId)
        -> anyhow::Result<Option<AutonomyLevel>>;

    async fn set_autonomy_preference(
        &self,
        id: ConversationId,
        level: AutonomyLevel,
    ) -> anyhow::Result<()>;
}

struct ConversationRecord {
    conversation: Conversation,
    messages: Vec<ChatMessage>,
    autonomy: Option<AutonomyLevel>,
}

pub struct MemoryConversationStore {
    records: RwLock<HashMap<ConversationId, ConversationRecord>>,
    next_id: RwLock<ConversationId>,
}

impl Default for MemoryConversationStore {
    fn default() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            next_id: RwLock::new(1),
        }
    }
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn create(&self, user_id: &str, title: &str) -> anyhow::Result<Conversation> {
        let mut next_id = self.next_id.write().await;
        let id = *next_id;
        *next_id += 1;
        drop(next_id);

        let now = Utc::now();
        let conversation = Conversation {
            id,
            user_id: user_id.to_string(),
            title: title.chars().take(50).collect::<String>().trim().to_string(),
            topic_title: None,
            topic_details: None,
            created_at: now,
            updated_at: now,
        };
        self.records.write().await.insert(
            id,
            ConversationRecord {
                conversation: conversation.clone(),
                messages: Vec::new(),
                autonomy: None,
            },
        );
        Ok(conversation)
    }

    async fn get(&self, id: ConversationId) -> anyhow::Result<Option<Conversation>> {
        Ok(self
            .records
            .read()
            .await
            .get(&id)
            .map(|r| r.conversation.clone()))
    }

    async fn append_message(
        &self,
        id: ConversationId,
        role: ChatRole,
        content: &str,
    ) -> anyhow::Result<ChatMessage> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(&id)
            .ok_or_else(|| anyhow::anyhow!("conversation {id} not found"))?;
        let message = ChatMessage {
            id: record.messages.len() as i64 + 1,
            role,
            content: content.to_string(),
            created_at: Utc::now(),
        };
        record.messages.push(message.clone());
        record.conversation.updated_at = message.created_at;
        Ok(message)
    }

    async fn messages(&self, id: ConversationId, limit: usize) -> anyhow::Result<Vec<ChatMessage>> {
        let records = self.records.read().await;
        let Some(record) = records.get(&id) else {
            return Ok(Vec::new());
        };
        let start = record.messages.len().saturating_sub(limit);
        Ok(record.messages[start..].to_vec())
    }

    async fn set_topic(
        &self,
        id: ConversationId,
        title: Option<String>,
        details: Option<String>,
    ) -> anyhow::Result<()> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(&id)
            .ok_or_else(|| anyhow::anyhow!("conversation {id} not found"))?;
        record.conversation.topic_title = title;
        record.conversation.topic_details = details;
        record.conversation.updated_at = Utc::now();
        Ok(())
    }

    async fn autonomy_preference(
        &self,
        id: ConversationId,
    ) -> anyhow::Result<Option<AutonomyLevel>> {
        Ok(self.records.read().await.get(&id).and_then(|r| r.autonomy))
    }

    async fn set_autonomy_preference(
        &self,
        id: ConversationId,
        level: AutonomyLevel,
    ) -> anyhow::Result<()> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(&id)
            .ok_or_else(|| anyhow::anyhow!("conversation {id} not found"))?;
        record.autonomy = Some(level);
        Ok(())
    }
}

const CORRECTION_MARKERS: &[&str] = &[
    "slower",
    "too fast",
    "stop doing",
    "that was wrong",
    "don't do that",
    "undo that",
    "ask me first",
    "check with me",
    "👎",
];

/// Recommends an autonomy level from recent operator corrections: repeated
/// pushback steps the level down.
pub fn recommend_autonomy(recent_messages: &[ChatMessage]) -> AutonomyLevel {
    let corrections = recent_messages
        .iter()
        .filter(|m| m.role == ChatRole::User)
        .filter(|m| {
            let lowered = m.content.to_lowercase();
            CORRECTION_MARKERS.iter().any(|marker| lowered.contains(marker))
        })
        .count();
    match corrections {
        0 => AutonomyLevel::High,
        1 => AutonomyLevel::Medium,
        _ => AutonomyLevel::Low,
    }
}

/// Task CRUD over the checkpoint store, with `task_summary` projection on
/// every mutation.
pub struct TaskManager {
    checkpoints: Arc<CheckpointStore>,
    bus: Arc<EventBus>,
}

impl TaskManager {
    pub fn new(checkpoints: Arc<CheckpointStore>, bus: Arc<EventBus>) -> Self {
        Self { checkpoints, bus }
    }

    pub async fn replace_plan(
        &self,
        conv: ConversationId,
        tasks: Vec<TaskItem>,
    ) -> Result<(), OrchestratorError> {
        self.checkpoints.write_plan(conv, &tasks).await?;
        self.bus.emit(
            conv,
            events::TASK_PLAN_CREATED,
            json!({ "count": tasks.len() }),
        );
        self.project_summary(conv).await
    }

    pub async fn update_status(
        &self,
        conv: ConversationId,
        index: usize,
        status: TaskStatus,
    ) -> Result<(), OrchestratorError> {
        self.checkpoints.update_status(conv, index, status).await?;
        self.project_summary(conv).await
    }

    pub async fn tasks(&self, conv: ConversationId) -> Result<Vec<TaskItem>, OrchestratorError> {
        self.checkpoints.read_plan(conv).await
    }

    async fn project_summary(&self, conv: ConversationId) -> Result<(), OrchestratorError> {
        let tasks = self.checkpoints.read_plan(conv).await?;
        let completed = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .count();
        self.bus.emit(
            conv,
            events::TASK_SUMMARY,
            json!({
                "tasks": tasks,
                "completed": completed,
                "total": tasks.len(),
            }),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_message(content: &str) -> ChatMessage {
        ChatMessage {
            id: 1,
            role: ChatRole::User,
            content: content.to_string(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn messages_are_totally_ordered_and_capped() {
        let store = MemoryConversationStore::new();
        let conv = store.create("u1", "pricing work").await.unwrap();
        for i in 0..5 {
            store
                .append_message(conv.id, ChatRole::User, &format!("m{i}"))
                .await
                .unwrap();
        }
        let recent = store.messages(conv.id, 3).await.unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].content, "m2");
        assert!(recent.windows(2).all(|w| w[0].id < w[1].id));
    }

    #[test]
    fn corrections_step_autonomy_down() {
        assert_eq!(
            recommend_autonomy(&[user_message("update the prices")]),
            AutonomyLevel::High
        );
        assert_eq!(
            recommend_autonomy(&[user_message("slower please")]),
            AutonomyLevel::Medium
        );
        assert_eq!(
            recommend_autonomy(&[
                user_message("slower please"),
                user_message("that was wrong, undo that"),
            ]),
            AutonomyLevel::Low
        );
    }

    #[tokio::test]
    async fn task_mutations_project_summaries() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoints = Arc::new(CheckpointStore::new(dir.path()).unwrap());
        let bus = Arc::new(EventBus::new());
        let mut sub = bus.subscribe("u1");
        bus.bind(1, "u1");

        let manager = TaskManager::new(checkpoints, bus);
        manager
            .replace_plan(1, vec![TaskItem::pending(0, "update item")])
            .await
            .unwrap();
        manager
            .update_status(1, 0, TaskStatus::Completed)
            .await
            .unwrap();

        let mut names = Vec::new();
        while let Ok(frame) = sub.frames.try_recv() {
            names.push(frame.event);
        }
        assert_eq!(
            names,
            vec!["task_plan_created", "task_summary", "task_summary"]
        );
    }
}

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type ConversationId = i64;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Conversation {
    pub id: ConversationId,
    pub user_id: String,
    pub title: String,
    #[serde(default)]
    pub topic_title: Option<String>,
    #[serde(default)]
    pub topic_details: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

/// One append-only entry in a conversation's message log.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ChatMessage {
    pub id: i64,
    pub role: ChatRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
}

impl TaskStatus {
    /// Status transitions are forward-only: pending -> in_progress -> completed.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress) | (Pending, Completed) | (InProgress, Completed)
        ) || self == next
    }
}

/// One entry in a conversation's plan. `index` is dense and 0-based.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TaskItem {
    pub index: usize,
    pub description: String,
    pub status: TaskStatus,
    /// Structured sidecar data for bulk items (identifiers, prices, flags).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl TaskItem {
    pub fn pending(index: usize, description: impl Into<String>) -> Self {
        Self {
            index,
            description: description.into(),
            status: TaskStatus::Pending,
            data: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct CheckpointStats {
    pub completed: usize,
    pub failed: usize,
    pub remaining: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AdaptiveContextInfo {
    pub token_count: usize,
    pub has_extracted_data: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BulkCheckpointInfo {
    #[serde(rename = "type")]
    pub operation_type: String,
    pub total_expected: usize,
    pub adaptive_context: AdaptiveContextInfo,
}

/// Append-only progress record making bulk work resumable under retries.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Checkpoint {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    pub stats: CheckpointStats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_item: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bulk_operation: Option<BulkCheckpointInfo>,
}

/// Entities and intended action pulled out of a bulk request by the extractor.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ExtractedData {
    pub entities: Vec<String>,
    #[serde(default)]
    pub action: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct AdaptiveContext {
    pub extracted: ExtractedData,
    /// Item payloads already fetched and classified for this operation.
    #[serde(default)]
    pub fetched_context: Option<Value>,
}

/// Per-conversation state for an in-flight bulk operation.
///
/// Reset whenever the conversation changes or the output guard signals
/// completion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulkOperationState {
    pub active: bool,
    pub conversation_id: Option<ConversationId>,
    pub operation_type: Option<String>,
    pub expected_items: usize,
    pub completed_items: BTreeSet<String>,
    pub item_list: Vec<String>,
    pub last_checkpoint_index: Option<u64>,
    pub adaptive_context: Option<AdaptiveContext>,
    pub retry_count: u32,
}

impl BulkOperationState {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Items still to process: item_list minus completed_items, input order.
    pub fn remaining_items(&self) -> Vec<String> {
        self.item_list
            .iter()
            .filter(|item| !self.completed_items.contains(*item))
            .cloned()
            .collect()
    }

    pub fn record_completed<I: IntoIterator<Item = String>>(&mut self, items: I) {
        self.completed_items.extend(items);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum AutonomyLevel {
    High,
    Medium,
    Low,
}

impl AutonomyLevel {
    pub fn step_down(self) -> Self {
        match self {
            AutonomyLevel::High => AutonomyLevel::Medium,
            AutonomyLevel::Medium | AutonomyLevel::Low => AutonomyLevel::Low,
        }
    }
}

/// Priority tiers for prompt fragments; lower value sorts first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum FragmentPriority {
    Critical,
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RankedMemory {
    pub content: String,
    pub score: f32,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RankedFragment {
    pub content: String,
    pub category: String,
    pub priority: FragmentPriority,
    pub score: f32,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub agent_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum DetectedPattern {
    DiscountRemoval,
    MapPricing,
    BulkOperation,
    PriceUpdate,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct BusinessLogic {
    pub patterns: Vec<DetectedPattern>,
    pub warnings: Vec<String>,
}

/// Everything a sub-agent gets to see for one task. Built by the tiered
/// context builder; serialized size never exceeds the configured ceiling.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ContextBundle {
    pub task: String,
    pub conversation_id: ConversationId,
    pub user_id: String,
    pub autonomy: AutonomyLevel,
    #[serde(default)]
    pub user_profile: Option<String>,
    pub memories: Vec<RankedMemory>,
    pub fragments: Vec<RankedFragment>,
    pub rules: Vec<String>,
    pub history: Vec<ChatMessage>,
    pub current_tasks: Vec<TaskItem>,
    pub business_logic: BusinessLogic,
    #[serde(default)]
    pub additional_context: Option<String>,
    #[serde(default)]
    pub adaptive: Option<AdaptiveContext>,
    /// Stripped product payloads for SKUs referenced by the task (full slice).
    #[serde(default)]
    pub product_context: Vec<Value>,
    pub full_slice: bool,
}

impl ContextBundle {
    pub fn serialized_len(&self) -> usize {
        serde_json::to_string(self).map(|s| s.len()).unwrap_or(0)
    }
}

/// Inbound image attachment, either inline base64 or by URL.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ImageAttachment {
    DataUrl { data: String },
    Url { url: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum FileEncoding {
    Text,
    Binary,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct FileAttachment {
    pub name: String,
    #[serde(rename = "type")]
    pub mime_type: String,
    pub encoding: FileEncoding,
    /// Text payload when encoding is `text`.
    #[serde(default)]
    pub content: Option<String>,
    /// Base64 payload when encoding is `binary`.
    #[serde(default)]
    pub data: Option<String>,
}

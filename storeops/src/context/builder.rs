use std::sync::Arc;

use serde_json::json;

use super::patterns::{detect_patterns, extract_skus, filter_rules, needs_full_slice};
use super::product::strip_product_keys;
use crate::config::RuntimeConfig;
use crate::error::OrchestratorError;
use crate::memory::{VectorStore, FRAGMENT_MIN_SCORE, MEMORY_MIN_SCORE};
use crate::tools::Tool;
use crate::types::{
    AdaptiveContext, AutonomyLevel, BusinessLogic, ChatMessage, ContextBundle, ConversationId,
    RankedFragment, RankedMemory, TaskItem,
};

pub const FRAGMENTS_TRUNCATED_MARKER: &str =
    "[Additional prompt fragments truncated to prevent context explosion]";
pub const MEMORIES_TRUNCATED_MARKER: &str = "[Additional memories truncated]";
pub const RULES_TRUNCATED_MARKER: &str = "[Additional business rules truncated]";
pub const HISTORY_TRUNCATED_MARKER: &str = "[Earlier conversation turns truncated]";
pub const CONTEXT_TRUNCATED_MARKER: &str = "[Additional context truncated]";

const CORE_MEMORIES: usize = 5;
const CORE_FRAGMENTS: usize = 3;
const CORE_RULES_CAP: usize = 10;
const CORE_HISTORY: usize = 3;
const FULL_MEMORIES: usize = 15;
const FULL_FRAGMENTS: usize = 10;
const FULL_PRODUCT_BLOBS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextMode {
    Core,
    Full,
}

/// Inputs to one context build.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub task: String,
    pub conversation_id: ConversationId,
    pub user_id: String,
    pub autonomy: AutonomyLevel,
    pub force_full: bool,
    pub user_profile: Option<String>,
    /// Conversation snapshot, newest last. The builder takes the tail.
    pub history: Vec<ChatMessage>,
    pub current_tasks: Vec<TaskItem>,
    pub additional_context: Option<String>,
    /// Present when an active bulk operation carries extracted data.
    pub adaptive: Option<AdaptiveContext>,
}

impl BuildRequest {
    pub fn new(
        task: impl Into<String>,
        conversation_id: ConversationId,
        user_id: impl Into<String>,
        autonomy: AutonomyLevel,
    ) -> Self {
        Self {
            task: task.into(),
            conversation_id,
            user_id: user_id.into(),
            autonomy,
            force_full: false,
            user_profile: None,
            history: Vec::new(),
            current_tasks: Vec::new(),
            additional_context: None,
            adaptive: None,
        }
    }
}

/// Builds core or full context slices under the configured byte budget.
pub struct ContextBuilder {
    vector: Arc<dyn VectorStore>,
    business_rules: Vec<String>,
    product_reader: Option<Arc<dyn Tool>>,
    config: RuntimeConfig,
}

impl ContextBuilder {
    pub fn new(vector: Arc<dyn VectorStore>, config: RuntimeConfig) -> Self {
        Self {
            vector,
            business_rules: Vec::new(),
            product_reader: None,
            config,
        }
    }

    pub fn with_rules(mut self, rules: Vec<String>) -> Self {
        self.business_rules = rules;
        self
    }

    pub fn with_product_reader(mut self, reader: Arc<dyn Tool>) -> Self {
        self.product_reader = Some(reader);
        self
    }

    pub fn classify(&self, task: &str, force_full: bool) -> ContextMode {
        if force_full || needs_full_slice(task) {
            ContextMode::Full
        } else {
            ContextMode::Core
        }
    }

    pub async fn build(&self, request: BuildRequest) -> Result<ContextBundle, OrchestratorError> {
        let mode = self.classify(&request.task, request.force_full || request.adaptive.is_some());
        match mode {
            ContextMode::Core => self.build_core(request).await,
            ContextMode::Full => self.build_full(request).await,
        }
    }

    pub async fn build_core(
        &self,
        request: BuildRequest,
    ) -> Result<ContextBundle, OrchestratorError> {
        let memories = self
            .search_memories(&request, CORE_MEMORIES)
            .await?;
        let fragments = self.search_fragments(&request, CORE_FRAGMENTS).await?;
        let rules = filter_rules(self.business_rules.iter(), CORE_RULES_CAP);
        let history = tail(&request.history, CORE_HISTORY);
        let (patterns, warnings) = detect_patterns(&request.task);

        let mut bundle = self.assemble(request, memories, fragments, rules, history, false);
        bundle.business_logic = BusinessLogic { patterns, warnings };
        self.enforce_budget(&mut bundle);
        Ok(bundle)
    }

    pub async fn build_full(
        &self,
        request: BuildRequest,
    ) -> Result<ContextBundle, OrchestratorError> {
        let memories = self.search_memories(&request, FULL_MEMORIES).await?;
        let mut fragments = self.search_fragments(&request, FULL_FRAGMENTS).await?;
        // Full slice groups fragments by category; priority and score decide
        // order within a category.
        fragments.sort_by(|a, b| {
            a.category
                .cmp(&b.category)
                .then(a.priority.cmp(&b.priority))
                .then(b.score.total_cmp(&a.score))
        });
        let rules = self.business_rules.clone();
        let history_len = self.config.max_history_messages.min(10);
        let history = tail(&request.history, history_len);
        let (patterns, warnings) = detect_patterns(&request.task);
        let product_context = self.fetch_product_context(&request.task).await;

        let mut bundle = self.assemble(request, memories, fragments, rules, history, true);
        bundle.business_logic = BusinessLogic { patterns, warnings };
        bundle.product_context = product_context;
        self.enforce_budget(&mut bundle);
        Ok(bundle)
    }

    async fn search_memories(
        &self,
        request: &BuildRequest,
        k: usize,
    ) -> Result<Vec<RankedMemory>, OrchestratorError> {
        if request.task.trim().is_empty() {
            return Ok(Vec::new());
        }
        self.vector
            .search(&request.task, Some(&request.user_id), k, MEMORY_MIN_SCORE)
            .await
            .map_err(|e| OrchestratorError::Context(format!("memory search: {e}")))
    }

    async fn search_fragments(
        &self,
        request: &BuildRequest,
        k: usize,
    ) -> Result<Vec<RankedFragment>, OrchestratorError> {
        if request.task.trim().is_empty() {
            return Ok(Vec::new());
        }
        self.vector
            .search_fragments(&request.task, k, FRAGMENT_MIN_SCORE)
            .await
            .map_err(|e| OrchestratorError::Context(format!("fragment search: {e}")))
    }

    /// Fetches and strips product payloads for SKUs the task references.
    /// Read failures skip the SKU; the build never fails on product context.
    async fn fetch_product_context(&self, task: &str) -> Vec<serde_json::Value> {
        let Some(reader) = &self.product_reader else {
            return Vec::new();
        };
        let mut blobs = Vec::new();
        for sku in extract_skus(task).into_iter().take(FULL_PRODUCT_BLOBS) {
            match reader.invoke(json!({"identifier": sku})).await {
                Ok(product) => blobs.push(strip_product_keys(&product)),
                Err(e) => tracing::debug!(%sku, "product context fetch skipped: {e}"),
            }
        }
        blobs
    }

    fn assemble(
        &self,
        request: BuildRequest,
        memories: Vec<RankedMemory>,
        fragments: Vec<RankedFragment>,
        rules: Vec<String>,
        history: Vec<ChatMessage>,
        full_slice: bool,
    ) -> ContextBundle {
        let user_profile = request
            .user_profile
            .clone()
            .or_else(|| Some(format!("Operator: {}", request.user_id)));
        ContextBundle {
            task: request.task,
            conversation_id: request.conversation_id,
            user_id: request.user_id,
            autonomy: request.autonomy,
            user_profile,
            memories,
            fragments,
            rules,
            history,
            current_tasks: request.current_tasks,
            business_logic: BusinessLogic::default(),
            additional_context: request.additional_context,
            adaptive: request.adaptive,
            product_context: Vec::new(),
            full_slice,
        }
    }

    /// Trims sections in priority order until the serialized bundle fits the
    /// ceiling. Truncation always leaves a visible marker.
    fn enforce_budget(&self, bundle: &mut ContextBundle) {
        let max = self.config.max_context_bytes;
        if bundle.serialized_len() <= max {
            return;
        }

        if let Some(extra) = bundle.additional_context.take() {
            // Room left for the section once the marker and JSON overhead are
            // accounted for.
            let room = max.saturating_sub(
                bundle.serialized_len() + CONTEXT_TRUNCATED_MARKER.len() + 16,
            );
            if room >= extra.len() {
                bundle.additional_context = Some(extra);
            } else if room > 0 {
                let keep = extra
                    .char_indices()
                    .take_while(|(i, _)| *i < room)
                    .last()
                    .map(|(i, c)| i + c.len_utf8())
                    .unwrap_or(0);
                bundle.additional_context =
                    Some(format!("{}\n{CONTEXT_TRUNCATED_MARKER}", &extra[..keep]));
            } else {
                bundle.additional_context = Some(CONTEXT_TRUNCATED_MARKER.to_string());
            }
        }
        if bundle.serialized_len() <= max {
            return;
        }

        while bundle.serialized_len() > max && !bundle.product_context.is_empty() {
            bundle.product_context.pop();
        }
        if bundle.serialized_len() <= max {
            return;
        }

        if !bundle.fragments.is_empty() {
            while bundle.serialized_len() > max && bundle.fragments.len() > 1 {
                bundle.fragments.pop();
            }
            let marker = RankedFragment {
                content: FRAGMENTS_TRUNCATED_MARKER.to_string(),
                category: "system".to_string(),
                priority: crate::types::FragmentPriority::Low,
                score: 0.0,
                tags: Vec::new(),
                agent_type: None,
            };
            if bundle.serialized_len() > max {
                bundle.fragments.clear();
            }
            bundle.fragments.push(marker);
        }
        if bundle.serialized_len() <= max {
            return;
        }

        if !bundle.memories.is_empty() {
            while bundle.serialized_len() > max && !bundle.memories.is_empty() {
                bundle.memories.pop();
            }
            bundle.memories.push(RankedMemory {
                content: MEMORIES_TRUNCATED_MARKER.to_string(),
                score: 0.0,
                metadata: Default::default(),
            });
        }
        if bundle.serialized_len() <= max {
            return;
        }

        if !bundle.rules.is_empty() {
            while bundle.serialized_len() > max && !bundle.rules.is_empty() {
                bundle.rules.pop();
            }
            bundle.rules.push(RULES_TRUNCATED_MARKER.to_string());
        }
        if bundle.serialized_len() <= max {
            return;
        }

        if !bundle.history.is_empty() {
            while bundle.serialized_len() > max && !bundle.history.is_empty() {
                bundle.history.remove(0);
            }
            if let Some(first) = bundle.history.first_mut() {
                first.content = format!("{HISTORY_TRUNCATED_MARKER}\n{}", first.content);
            }
        }
    }
}

fn tail(history: &[ChatMessage], n: usize) -> Vec<ChatMessage> {
    let start = history.len().saturating_sub(n);
    history[start..].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{LexicalVectorStore, StoredFragment, VectorStore};
    use crate::types::{ChatRole, FragmentPriority};
    use chrono::Utc;
    use std::collections::HashMap;

    fn message(id: i64, content: &str) -> ChatMessage {
        ChatMessage {
            id,
            role: if id % 2 == 0 {
                ChatRole::User
            } else {
                ChatRole::Assistant
            },
            content: content.to_string(),
            created_at: Utc::now(),
        }
    }

    async fn seeded_store() -> Arc<dyn VectorStore> {
        let store = LexicalVectorStore::new();
        store
            .add(
                "operator prefers espresso pricing in USD",
                Some("u1"),
                HashMap::new(),
            )
            .await
            .unwrap();
        store
            .add_fragment(StoredFragment {
                id: String::new(),
                content: "pricing updates go through update_pricing".into(),
                category: "pricing".into(),
                priority: FragmentPriority::High,
                tags: vec![],
                agent_type: None,
            })
            .await
            .unwrap();
        Arc::new(store)
    }

    fn builder(store: Arc<dyn VectorStore>, max_bytes: usize) -> ContextBuilder {
        let config = RuntimeConfig {
            max_context_bytes: max_bytes,
            ..Default::default()
        };
        ContextBuilder::new(store, config).with_rules(vec![
            "ALWAYS respect MAP pricing".to_string(),
            "NEVER delete a product".to_string(),
            "tone: concise".to_string(),
        ])
    }

    #[tokio::test]
    async fn core_slice_limits_sections() {
        let builder = builder(seeded_store().await, 150_000);
        let mut request = BuildRequest::new(
            "update espresso pricing for ESP-1001",
            1,
            "u1",
            AutonomyLevel::High,
        );
        request.history = (0..8).map(|i| message(i, "turn")).collect();

        let bundle = builder.build(request).await.unwrap();
        assert!(!bundle.full_slice);
        assert!(bundle.history.len() <= 3);
        // Constraint lines only.
        assert_eq!(bundle.rules.len(), 2);
        assert!(bundle.serialized_len() <= 150_000);
    }

    #[tokio::test]
    async fn bulk_task_selects_full_slice() {
        let builder = builder(seeded_store().await, 150_000);
        let request = BuildRequest::new(
            "remove discounts on all products",
            1,
            "u1",
            AutonomyLevel::High,
        );
        let bundle = builder.build(request).await.unwrap();
        assert!(bundle.full_slice);
        // Full slice carries the unfiltered rule set.
        assert_eq!(bundle.rules.len(), 3);
    }

    #[tokio::test]
    async fn zero_token_task_returns_nonempty_bundle() {
        let builder = builder(seeded_store().await, 150_000);
        let bundle = builder
            .build(BuildRequest::new("", 1, "u1", AutonomyLevel::Medium))
            .await
            .unwrap();
        assert!(bundle.user_profile.is_some());
        assert!(bundle.memories.is_empty());
        assert!(bundle.fragments.is_empty());
        assert!(bundle.serialized_len() > 0);
    }

    #[tokio::test]
    async fn overflow_truncates_with_visible_marker() {
        let builder = builder(seeded_store().await, 4_000);
        let mut request = BuildRequest::new(
            "bulk update all products with the attached data",
            1,
            "u1",
            AutonomyLevel::High,
        );
        request.additional_context = Some("x".repeat(40 * 1024));
        let bundle = builder.build(request).await.unwrap();
        assert!(bundle.serialized_len() <= 4_000);
        assert!(bundle
            .additional_context
            .as_deref()
            .map(|c| c.contains(CONTEXT_TRUNCATED_MARKER))
            .unwrap_or(false));
    }

    #[tokio::test]
    async fn fragment_overflow_leaves_fragment_marker() {
        let store = LexicalVectorStore::new();
        for i in 0..10 {
            store
                .add_fragment(StoredFragment {
                    id: String::new(),
                    content: format!("bulk products rule {i} {}", "y".repeat(600)),
                    category: "bulk".into(),
                    priority: FragmentPriority::Medium,
                    tags: vec![],
                    agent_type: None,
                })
                .await
                .unwrap();
        }
        let builder = builder(Arc::new(store), 2_500);
        let bundle = builder
            .build(BuildRequest::new(
                "bulk products sweep",
                1,
                "u1",
                AutonomyLevel::High,
            ))
            .await
            .unwrap();
        assert!(bundle.serialized_len() <= 2_500);
        assert!(bundle
            .fragments
            .iter()
            .any(|f| f.content == FRAGMENTS_TRUNCATED_MARKER));
    }

    #[tokio::test]
    async fn core_fields_are_subset_of_full_fields() {
        let builder = builder(seeded_store().await, 150_000);
        let core = builder
            .build_core(BuildRequest::new(
                "update espresso pricing",
                1,
                "u1",
                AutonomyLevel::High,
            ))
            .await
            .unwrap();
        let full = builder
            .build_full(BuildRequest::new(
                "update espresso pricing",
                1,
                "u1",
                AutonomyLevel::High,
            ))
            .await
            .unwrap();
        assert!(full.memories.len() >= core.memories.len());
        assert!(full.fragments.len() >= core.fragments.len());
        assert!(full.rules.len() >= core.rules.len());
        assert!(full.history.len() >= core.history.len());
    }
}

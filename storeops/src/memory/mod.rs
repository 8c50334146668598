//! Semantic search ports: memories, prompt fragments, and embeddings.
//!
//! The core never assumes a specific engine. `LexicalVectorStore` is the
//! in-process fallback used in tests and single-node deployments; it scores
//! by token overlap but honors the same `[0,1]` score and min-score contract
//! as a real vector engine.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::types::{FragmentPriority, RankedFragment, RankedMemory};

/// Default score floor for memory search.
pub const MEMORY_MIN_SCORE: f32 = 0.5;
/// Default score floor for prompt fragment search.
pub const FRAGMENT_MIN_SCORE: f32 = 0.4;

#[derive(Debug, Clone)]
pub struct StoredMemory {
    pub id: String,
    pub content: String,
    pub user_id: Option<String>,
    pub metadata: HashMap<String, Value>,
}

#[derive(Debug, Clone)]
pub struct StoredFragment {
    pub id: String,
    pub content: String,
    pub category: String,
    pub priority: FragmentPriority,
    pub tags: Vec<String>,
    pub agent_type: Option<String>,
}

#[async_trait::async_trait]
pub trait VectorStore: Send + Sync {
    /// Searches memories scoped to a user. Results are ranked, scores in
    /// [0,1], filtered by `min_score`.
    async fn search(
        &self,
        query: &str,
        user_id: Option<&str>,
        k: usize,
        min_score: f32,
    ) -> anyhow::Result<Vec<RankedMemory>>;

    async fn add(
        &self,
        content: &str,
        user_id: Option<&str>,
        metadata: HashMap<String, Value>,
    ) -> anyhow::Result<String>;

    async fn delete(&self, id: &str) -> anyhow::Result<bool>;

    async fn list(&self, user_id: Option<&str>) -> anyhow::Result<Vec<StoredMemory>>;

    async fn search_fragments(
        &self,
        query: &str,
        k: usize,
        min_score: f32,
    ) -> anyhow::Result<Vec<RankedFragment>>;

    async fn add_fragment(&self, fragment: StoredFragment) -> anyhow::Result<String>;
}

/// Text-to-vector port backing the tool cache's semantic matching.
#[async_trait::async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>>;
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        (dot / (norm_a * norm_b)).clamp(-1.0, 1.0)
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '-')
        .filter(|t| t.len() > 1)
        .map(|t| t.to_string())
        .collect()
}

/// Deterministic feature-hash embedder. Not semantically meaningful, but
/// stable: identical descriptors embed identically, overlapping token sets
/// land close under cosine.
pub struct HashEmbedder {
    dims: usize,
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self { dims: 256 }
    }
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }

    fn bucket(&self, token: &str) -> usize {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        token.hash(&mut hasher);
        (hasher.finish() as usize) % self.dims
    }
}

#[async_trait::async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let mut vector = vec![0.0f32; self.dims];
        for token in tokenize(text) {
            vector[self.bucket(&token)] += 1.0;
        }
        Ok(vector)
    }
}

/// Token-overlap score in [0,1]: |query ∩ doc| / |query|.
fn overlap_score(query_tokens: &HashSet<String>, doc: &str) -> f32 {
    if query_tokens.is_empty() {
        return 0.0;
    }
    let doc_tokens: HashSet<String> = tokenize(doc).into_iter().collect();
    let hits = query_tokens.intersection(&doc_tokens).count();
    hits as f32 / query_tokens.len() as f32
}

#[derive(Default)]
struct LexicalState {
    memories: BTreeMap<String, StoredMemory>,
    fragments: BTreeMap<String, StoredFragment>,
}

/// In-process store with lexical scoring. Insertion order is stable, search
/// is deterministic, and scores obey the vector-store contract.
#[derive(Default)]
pub struct LexicalVectorStore {
    state: RwLock<LexicalState>,
}

impl LexicalVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<dyn VectorStore> {
        Arc::new(Self::new())
    }
}

#[async_trait::async_trait]
impl VectorStore for LexicalVectorStore {
    async fn search(
        &self,
        query: &str,
        user_id: Option<&str>,
        k: usize,
        min_score: f32,
    ) -> anyhow::Result<Vec<RankedMemory>> {
        let query_tokens: HashSet<String> = tokenize(query).into_iter().collect();
        let state = self.state.read().await;
        let mut scored: Vec<RankedMemory> = state
            .memories
            .values()
            .filter(|memory| match (user_id, &memory.user_id) {
                (Some(user), Some(owner)) => user == owner,
                (Some(_), None) | (None, _) => true,
            })
            .map(|memory| RankedMemory {
                content: memory.content.clone(),
                score: overlap_score(&query_tokens, &memory.content),
                metadata: memory.metadata.clone(),
            })
            .filter(|ranked| ranked.score >= min_score)
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(k);
        Ok(scored)
    }

    async fn add(
        &self,
        content: &str,
        user_id: Option<&str>,
        metadata: HashMap<String, Value>,
    ) -> anyhow::Result<String> {
        let id = Uuid::new_v4().to_string();
        let mut state = self.state.write().await;
        state.memories.insert(
            id.clone(),
            StoredMemory {
                id: id.clone(),
                content: content.to_string(),
                user_id: user_id.map(|u| u.to_string()),
                metadata,
            },
        );
        Ok(id)
    }

    async fn delete(&self, id: &str) -> anyhow::Result<bool> {
        let mut state = self.state.write().await;
        Ok(state.memories.remove(id).is_some() || state.fragments.remove(id).is_some())
    }

    async fn list(&self, user_id: Option<&str>) -> anyhow::Result<Vec<StoredMemory>> {
        let state = self.state.read().await;
        Ok(state
            .memories
            .values()
            .filter(|memory| match (user_id, &memory.user_id) {
                (Some(user), Some(owner)) => user == owner,
                (Some(_), None) | (None, _) => true,
            })
            .cloned()
            .collect())
    }

    async fn search_fragments(
        &self,
        query: &str,
        k: usize,
        min_score: f32,
    ) -> anyhow::Result<Vec<RankedFragment>> {
        let query_tokens: HashSet<String> = tokenize(query).into_iter().collect();
        let state = self.state.read().await;
        let mut scored: Vec<RankedFragment> = state
            .fragments
            .values()
            .map(|fragment| RankedFragment {
                content: fragment.content.clone(),
                category: fragment.category.clone(),
                priority: fragment.priority,
                score: overlap_score(&query_tokens, &fragment.content),
                tags: fragment.tags.clone(),
                agent_type: fragment.agent_type.clone(),
            })
            .filter(|ranked| ranked.score >= min_score)
            .collect();
        // Priority first, score second: critical fragments surface even when
        // a low-priority fragment matches more tokens.
        scored.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(b.score.total_cmp(&a.score))
        });
        scored.truncate(k);
        Ok(scored)
    }

    async fn add_fragment(&self, mut fragment: StoredFragment) -> anyhow::Result<String> {
        if fragment.id.is_empty() {
            fragment.id = Uuid::new_v4().to_string();
        }
        let id = fragment.id.clone();
        let mut state = self.state.write().await;
        state.fragments.insert(id.clone(), fragment);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragment(content: &str, priority: FragmentPriority) -> StoredFragment {
        StoredFragment {
            id: String::new(),
            content: content.to_string(),
            category: "pricing".into(),
            priority,
            tags: vec![],
            agent_type: None,
        }
    }

    #[tokio::test]
    async fn memory_search_scopes_by_user_and_score() {
        let store = LexicalVectorStore::new();
        store
            .add("customer prefers espresso roast pricing", Some("u1"), HashMap::new())
            .await
            .unwrap();
        store
            .add("espresso roast discount history", Some("u2"), HashMap::new())
            .await
            .unwrap();

        let hits = store
            .search("espresso roast pricing", Some("u1"), 5, MEMORY_MIN_SCORE)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].content.contains("prefers"));
        assert!(hits[0].score >= MEMORY_MIN_SCORE);
    }

    #[tokio::test]
    async fn fragments_rank_by_priority_then_score() {
        let store = LexicalVectorStore::new();
        store
            .add_fragment(fragment("map pricing floor must hold", FragmentPriority::Low))
            .await
            .unwrap();
        store
            .add_fragment(fragment("map pricing rules", FragmentPriority::Critical))
            .await
            .unwrap();

        let hits = store
            .search_fragments("map pricing", 5, FRAGMENT_MIN_SCORE)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].priority, FragmentPriority::Critical);
    }

    #[tokio::test]
    async fn hash_embedder_is_deterministic() {
        let embedder = HashEmbedder::default();
        let a = embedder.embed("get_product mexican-altura").await.unwrap();
        let b = embedder.embed("get_product mexican-altura").await.unwrap();
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-6);

        let c = embedder.embed("update_pricing ESP-1001").await.unwrap();
        assert!(cosine_similarity(&a, &c) < 0.9);
    }
}

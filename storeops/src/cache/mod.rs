//! Semantic cache of recent tool outputs, scoped to a conversation.
//!
//! A hit requires cosine similarity at or above the threshold between the
//! embedded query and the stored `tool_name + canonical args` descriptor.
//! Invalidation is semantic, not temporal; hits surface their age so callers
//! decide freshness.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::memory::{cosine_similarity, Embedder};
use crate::types::ConversationId;

pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.75;

/// Read-dominant tools whose results are worth caching.
pub const DEFAULT_CACHEABLE_TOOLS: &[&str] = &[
    "get_product",
    "search_products",
    "get_collection",
    "get_inventory",
    "list_orders",
    "get_pricing",
];

#[derive(Debug, Clone)]
struct CacheEntry {
    tool_name: String,
    params: Value,
    result: Value,
    descriptor: String,
    embedding: Vec<f32>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheHit {
    pub tool_name: String,
    pub params: Value,
    pub result: Value,
    pub similarity: f32,
    pub age_seconds: i64,
}

#[derive(Debug, Clone)]
pub struct CacheSearchOptions {
    /// Restrict hits to this tool. `None` opts into cross-tool search.
    pub tool: Option<String>,
    pub k: usize,
    pub similarity_threshold: f32,
}

impl Default for CacheSearchOptions {
    fn default() -> Self {
        Self {
            tool: None,
            k: 3,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub per_tool: HashMap<String, usize>,
}

/// Canonical string form of tool arguments: object keys sorted recursively
/// so equivalent calls produce identical descriptors.
pub fn canonicalize_args(value: &Value) -> String {
    fn canonical(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut sorted: Vec<(&String, &Value)> = map.iter().collect();
                sorted.sort_by(|a, b| a.0.cmp(b.0));
                Value::Object(
                    sorted
                        .into_iter()
                        .map(|(k, v)| (k.clone(), canonical(v)))
                        .collect(),
                )
            }
            Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
            other => other.clone(),
        }
    }
    canonical(value).to_string()
}

pub struct ToolResultCache {
    embedder: Arc<dyn Embedder>,
    whitelist: HashSet<String>,
    entries: RwLock<HashMap<ConversationId, Vec<CacheEntry>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ToolResultCache {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self::with_whitelist(
            embedder,
            DEFAULT_CACHEABLE_TOOLS.iter().map(|t| t.to_string()),
        )
    }

    pub fn with_whitelist(
        embedder: Arc<dyn Embedder>,
        whitelist: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            embedder,
            whitelist: whitelist.into_iter().collect(),
            entries: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn is_cacheable(&self, tool_name: &str) -> bool {
        self.whitelist.contains(tool_name)
    }

    fn descriptor(tool_name: &str, params: &Value) -> String {
        format!("{tool_name} {}", canonicalize_args(params))
    }

    /// Stores one result. Replaces any entry with the same tool and
    /// canonical args for the conversation.
    pub async fn store(
        &self,
        conv: ConversationId,
        tool_name: &str,
        params: &Value,
        result: &Value,
    ) -> anyhow::Result<()> {
        let descriptor = Self::descriptor(tool_name, params);
        let embedding = self.embedder.embed(&descriptor).await?;
        let entry = CacheEntry {
            tool_name: tool_name.to_string(),
            params: params.clone(),
            result: result.clone(),
            descriptor: descriptor.clone(),
            embedding,
            created_at: Utc::now(),
        };
        let mut entries = self.entries.write().await;
        let slot = entries.entry(conv).or_default();
        slot.retain(|existing| existing.descriptor != descriptor);
        slot.push(entry);
        Ok(())
    }

    pub async fn search(
        &self,
        conv: ConversationId,
        query: &str,
        options: &CacheSearchOptions,
    ) -> anyhow::Result<Vec<CacheHit>> {
        let query_embedding = self.embedder.embed(query).await?;
        let entries = self.entries.read().await;
        let now = Utc::now();
        let mut hits: Vec<CacheHit> = entries
            .get(&conv)
            .map(|slot| {
                slot.iter()
                    .filter(|entry| match &options.tool {
                        Some(tool) => &entry.tool_name == tool,
                        None => true,
                    })
                    .filter_map(|entry| {
                        let similarity = cosine_similarity(&query_embedding, &entry.embedding);
                        (similarity >= options.similarity_threshold).then(|| CacheHit {
                            tool_name: entry.tool_name.clone(),
                            params: entry.params.clone(),
                            result: entry.result.clone(),
                            similarity,
                            age_seconds: (now - entry.created_at).num_seconds(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        hits.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        hits.truncate(options.k);

        if hits.is_empty() {
            self.misses.fetch_add(1, Ordering::Relaxed);
        } else {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        Ok(hits)
    }

    /// Exact-descriptor convenience used by the supervisor before invoking a
    /// tool: same tool, same canonical args.
    pub async fn lookup(
        &self,
        conv: ConversationId,
        tool_name: &str,
        params: &Value,
    ) -> anyhow::Result<Option<CacheHit>> {
        let options = CacheSearchOptions {
            tool: Some(tool_name.to_string()),
            k: 1,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
        };
        let hits = self
            .search(conv, &Self::descriptor(tool_name, params), &options)
            .await?;
        Ok(hits.into_iter().next())
    }

    pub async fn stats(&self, conv: ConversationId) -> CacheStats {
        let entries = self.entries.read().await;
        let slot = entries.get(&conv);
        let mut per_tool: HashMap<String, usize> = HashMap::new();
        if let Some(slot) = slot {
            for entry in slot {
                *per_tool.entry(entry.tool_name.clone()).or_default() += 1;
            }
        }
        CacheStats {
            entries: slot.map(|s| s.len()).unwrap_or(0),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            per_tool,
        }
    }

    pub async fn clear(&self, conv: ConversationId) {
        self.entries.write().await.remove(&conv);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::HashEmbedder;
    use serde_json::json;

    fn cache() -> ToolResultCache {
        ToolResultCache::new(Arc::new(HashEmbedder::default()))
    }

    #[test]
    fn canonicalization_sorts_keys_recursively() {
        let a = json!({"b": 1, "a": {"z": true, "y": [1, 2]}});
        let b = json!({"a": {"y": [1, 2], "z": true}, "b": 1});
        assert_eq!(canonicalize_args(&a), canonicalize_args(&b));
    }

    #[tokio::test]
    async fn exact_lookup_hits_same_tool_and_args() {
        let cache = cache();
        let params = json!({"identifier": "mexican-altura"});
        cache
            .store(1, "get_product", &params, &json!({"title": "Mexican Altura"}))
            .await
            .unwrap();

        let hit = cache.lookup(1, "get_product", &params).await.unwrap().unwrap();
        assert_eq!(hit.tool_name, "get_product");
        assert!(hit.similarity > 0.99);
        assert!(hit.age_seconds >= 0);

        // Different conversation: no hit.
        assert!(cache.lookup(2, "get_product", &params).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn tool_filter_blocks_cross_tool_hits_unless_opted_in() {
        let cache = cache();
        let params = json!({"identifier": "mexican-altura"});
        cache
            .store(1, "get_product", &params, &json!({"ok": true}))
            .await
            .unwrap();

        let scoped = CacheSearchOptions {
            tool: Some("get_inventory".into()),
            ..Default::default()
        };
        let hits = cache
            .search(1, "get_product {\"identifier\":\"mexican-altura\"}", &scoped)
            .await
            .unwrap();
        assert!(hits.is_empty());

        let cross = CacheSearchOptions::default();
        let hits = cache
            .search(1, "get_product {\"identifier\":\"mexican-altura\"}", &cross)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn stats_count_entries_per_tool() {
        let cache = cache();
        cache
            .store(1, "get_product", &json!({"id": 1}), &json!({}))
            .await
            .unwrap();
        cache
            .store(1, "get_product", &json!({"id": 2}), &json!({}))
            .await
            .unwrap();
        cache
            .store(1, "get_inventory", &json!({"id": 1}), &json!({}))
            .await
            .unwrap();
        let stats = cache.stats(1).await;
        assert_eq!(stats.entries, 3);
        assert_eq!(stats.per_tool["get_product"], 2);
    }
}

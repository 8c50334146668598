//! Documentation introspection tools for the software engineering agent.

use std::path::PathBuf;

use serde_json::{json, Value};

use crate::error::OrchestratorError;
use crate::tools::Tool;

const MAX_DOC_BYTES: usize = 32 * 1024;

fn resolve_within(root: &PathBuf, relative: &str) -> Result<PathBuf, OrchestratorError> {
    let candidate = root.join(relative);
    let canonical = candidate
        .canonicalize()
        .map_err(|e| OrchestratorError::NotFound(format!("doc '{relative}': {e}")))?;
    let root_canonical = root
        .canonicalize()
        .map_err(|e| OrchestratorError::Store(format!("docs root: {e}")))?;
    if !canonical.starts_with(&root_canonical) {
        return Err(OrchestratorError::Validation(format!(
            "doc path '{relative}' escapes the docs root"
        )));
    }
    Ok(canonical)
}

/// Case-insensitive substring search over the docs tree.
pub struct DocSearchTool {
    root: PathBuf,
}

impl DocSearchTool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait::async_trait]
impl Tool for DocSearchTool {
    fn name(&self) -> &str {
        "search_docs"
    }

    fn description(&self) -> &str {
        "Searches tool and API documentation for a phrase; returns matching files and lines."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Phrase to search for (case-insensitive)."
                }
            },
            "required": ["query"]
        })
    }

    fn read_only(&self) -> bool {
        true
    }

    async fn invoke(&self, args: Value) -> Result<Value, OrchestratorError> {
        let query = args
            .get("query")
            .and_then(|v| v.as_str())
            .ok_or_else(|| OrchestratorError::Validation("search_docs: missing query".into()))?
            .to_lowercase();

        let mut matches = Vec::new();
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                    continue;
                }
                let Ok(contents) = tokio::fs::read_to_string(&path).await else {
                    continue;
                };
                for (number, line) in contents.lines().enumerate() {
                    if line.to_lowercase().contains(&query) {
                        matches.push(json!({
                            "file": path.strip_prefix(&self.root).unwrap_or(&path).display().to_string(),
                            "line": number + 1,
                            "text": line.trim(),
                        }));
                        if matches.len() >= 50 {
                            return Ok(json!({"matches": matches, "truncated": true}));
                        }
                    }
                }
            }
        }
        Ok(json!({"matches": matches, "truncated": false}))
    }
}

pub struct DocReadTool {
    root: PathBuf,
}

impl DocReadTool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait::async_trait]
impl Tool for DocReadTool {
    fn name(&self) -> &str {
        "read_doc"
    }

    fn description(&self) -> &str {
        "Reads one documentation file by path relative to the docs root."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path relative to the docs root."
                }
            },
            "required": ["path"]
        })
    }

    fn read_only(&self) -> bool {
        true
    }

    async fn invoke(&self, args: Value) -> Result<Value, OrchestratorError> {
        let relative = args
            .get("path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| OrchestratorError::Validation("read_doc: missing path".into()))?;
        let path = resolve_within(&self.root, relative)?;
        let mut contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| OrchestratorError::NotFound(format!("doc '{relative}': {e}")))?;
        let truncated = contents.len() > MAX_DOC_BYTES;
        if truncated {
            contents.truncate(MAX_DOC_BYTES);
        }
        Ok(json!({"path": relative, "content": contents, "truncated": truncated}))
    }
}

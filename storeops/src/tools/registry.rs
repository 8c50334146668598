use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_openai::types::{
    ChatCompletionTool, ChatCompletionToolType, FunctionObject,
};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::schema::adapt_schema;
use super::Tool;
use crate::cache::ToolResultCache;
use crate::error::OrchestratorError;
use crate::types::ConversationId;

pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(300);

struct RegisteredTool {
    tool: Arc<dyn Tool>,
    adapted_schema: Value,
    validator: jsonschema::Validator,
}

/// Registers opaque tools, adapts their schemas for the model's
/// function-call surface, validates arguments, and proxies successful
/// read-tool results into the cache.
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
    cache: Arc<ToolResultCache>,
}

impl ToolRegistry {
    pub fn new(cache: Arc<ToolResultCache>) -> Self {
        Self {
            tools: HashMap::new(),
            cache,
        }
    }

    /// Adapts and registers one tool. Tools whose schemas cannot be adapted
    /// safely are excluded from the registered surface.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), OrchestratorError> {
        let name = tool.name().to_string();
        let parameters = tool.parameters();
        let adapted_schema = match adapt_schema(&name, &parameters) {
            Ok(schema) => schema,
            Err(e) => {
                tracing::warn!(tool = %name, "excluding tool with unadaptable schema: {e}");
                return Err(e);
            }
        };
        // Arguments are validated against the tool's declared contract, not
        // the adapted wire schema.
        let validator = jsonschema::validator_for(&parameters).map_err(|e| {
            OrchestratorError::SchemaAdapt {
                tool: name.clone(),
                reason: format!("schema does not compile: {e}"),
            }
        })?;
        self.tools.insert(
            name,
            RegisteredTool {
                tool,
                adapted_schema,
                validator,
            },
        );
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(|r| r.tool.clone())
    }

    pub fn cache(&self) -> Arc<ToolResultCache> {
        self.cache.clone()
    }

    /// Tool definitions in the model's function-call format.
    pub fn definitions(&self) -> Vec<ChatCompletionTool> {
        let mut defs: Vec<ChatCompletionTool> = self
            .tools
            .values()
            .map(|registered| ChatCompletionTool {
                r#type: ChatCompletionToolType::Function,
                function: FunctionObject {
                    name: registered.tool.name().to_string(),
                    description: Some(registered.tool.description().to_string()),
                    parameters: Some(registered.adapted_schema.clone()),
                    strict: None,
                },
            })
            .collect();
        defs.sort_by(|a, b| a.function.name.cmp(&b.function.name));
        defs
    }

    /// Invokes a tool with validation, timeout, cancellation, and cache
    /// proxying. Validation failures come back as errors for the model; they
    /// are never silently coerced.
    pub async fn invoke(
        &self,
        conv: ConversationId,
        name: &str,
        args: Value,
        cancel: &CancellationToken,
    ) -> Result<Value, OrchestratorError> {
        let registered = self
            .tools
            .get(name)
            .ok_or_else(|| OrchestratorError::NotFound(format!("tool '{name}'")))?;

        let args = strip_null_optionals(args, &registered.tool.parameters());
        if let Err(error) = registered.validator.validate(&args) {
            return Err(OrchestratorError::Validation(format!(
                "invalid arguments for '{name}': {error}"
            )));
        }

        if cancel.is_cancelled() {
            return Err(OrchestratorError::Interrupted);
        }
        let timeout = registered.tool.timeout().unwrap_or(DEFAULT_TOOL_TIMEOUT);
        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(OrchestratorError::Interrupted),
            outcome = tokio::time::timeout(timeout, registered.tool.invoke(args.clone())) => {
                match outcome {
                    Ok(result) => result,
                    Err(_) => Err(OrchestratorError::ToolExecution(format!(
                        "tool '{name}' timed out after {timeout:?}"
                    ))),
                }
            }
        };

        if let Ok(result) = &result {
            if registered.tool.read_only() && self.cache.is_cacheable(name) {
                if let Err(e) = self.cache.store(conv, name, &args, result).await {
                    tracing::warn!(tool = %name, "failed to cache tool result: {e}");
                }
            }
        }
        result
    }
}

/// Drops explicit nulls for optional fields before validation. The adapted
/// wire schema advertises optionals as nullable with a null default, so
/// models legitimately send them.
fn strip_null_optionals(args: Value, schema: &Value) -> Value {
    let required: Vec<&str> = schema
        .get("required")
        .and_then(|r| r.as_array())
        .map(|items| items.iter().filter_map(|v| v.as_str()).collect())
        .unwrap_or_default();
    match args {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(key, value)| !value.is_null() || required.contains(&key.as_str()))
                .collect(),
        ),
        other => other,
    }
}

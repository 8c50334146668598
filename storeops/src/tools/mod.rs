mod registry;
mod schema;

pub use registry::{ToolRegistry, DEFAULT_TOOL_TIMEOUT};
pub use schema::adapt_schema;

use std::time::Duration;

use serde_json::Value;

use crate::error::OrchestratorError;

/// An opaque action the model can call. Concrete commerce tools live outside
/// the core; the runtime sees name, description, schema, and `invoke`.
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema of the tool's parameters, before adaptation.
    fn parameters(&self) -> Value;

    /// Whether the tool only reads state. Read-dominant tools are eligible
    /// for result caching.
    fn read_only(&self) -> bool {
        false
    }

    /// Per-tool invocation timeout; the registry default applies otherwise.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    async fn invoke(&self, args: Value) -> Result<Value, OrchestratorError>;
}

use thiserror::Error;

use crate::types::ConversationId;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Model error: {0}")]
    Model(String),
    #[error("Tool execution error: {0}")]
    ToolExecution(String),
    #[error("Schema adaptation error for tool '{tool}': {reason}")]
    SchemaAdapt { tool: String, reason: String },
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Store error: {0}")]
    Store(String),
    #[error("Context build error: {0}")]
    Context(String),
    #[error("Conversation {0} already has an active run")]
    Busy(ConversationId),
    #[error("Batch of {got} items is below the parallel executor minimum of {min}")]
    TooFewItems { got: usize, min: usize },
    #[error("Batch of {got} items exceeds the parallel executor maximum of {max}; route this through the software engineering agent instead")]
    TooManyItems { got: usize, max: usize },
    #[error("Execution was interrupted by user")]
    Interrupted,
    #[error("Fatal: {0}")]
    Fatal(String),
}

impl OrchestratorError {
    /// Classifies errors the supervisor may retry inside the affected call.
    pub fn is_transient(&self) -> bool {
        matches!(self, OrchestratorError::Model(_) | OrchestratorError::Store(_))
    }
}

//! storeops: the core multi-agent orchestration runtime of an e-commerce
//! operations assistant.
//!
//! One operator message becomes a Run: the supervisor analyzes intent,
//! classifies bulk scope, builds a budgeted context slice, drives the model
//! through tools and sub-agents, guards every assistant turn against
//! announce-and-stop, and streams progress as SSE frames. Transport, model
//! providers, the concrete commerce tools, and persistence engines are
//! ports supplied by the embedding application.

pub mod agent;
pub mod bus;
pub mod cache;
pub mod checkpoint;
pub mod config;
pub mod context;
pub mod conversation;
pub mod error;
pub mod guardrail;
pub mod llm;
pub mod memory;
pub mod supervisor;
pub mod tools;
pub mod types;

pub use config::RuntimeConfig;
pub use error::OrchestratorError;
pub use supervisor::{RunOutcome, RunRequest, RunStatus, Supervisor, SupervisorPorts};

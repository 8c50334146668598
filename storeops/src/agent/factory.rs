use std::path::PathBuf;
use std::sync::Arc;

use crate::agent::bash::BashCapability;
use crate::agent::builtin::{UpdateTaskStatusTool, UpdateTopicTool};
use crate::agent::instructions::render_instructions;
use crate::agent::parallel::{BatchPolicy, ParallelExecutorAgent};
use crate::agent::swe::{DocReadTool, DocSearchTool};
use crate::agent::{AgentKind, LoopAgent};
use crate::bus::EventBus;
use crate::cache::ToolResultCache;
use crate::config::RuntimeConfig;
use crate::conversation::{ConversationStore, TaskManager};
use crate::llm::ChatModel;
use crate::tools::{Tool, ToolRegistry};
use crate::types::ContextBundle;

const BASH_ROLE: &str = "You are a systems operations agent for an e-commerce store. You perform file, git, and system tasks through the bash tool and run legacy scripts. Report exit codes and output faithfully; never invent results.";

const SWE_ROLE: &str = "You are a software engineering agent for an e-commerce store. You create and refactor operational tooling. Consult the documentation tools before writing code against an unfamiliar API.";

/// Builds sub-agents from a context bundle. Every agent is a fresh
/// construction; nothing is shared across invocations except the ports.
pub struct AgentFactory {
    model: Arc<dyn ChatModel>,
    conversations: Arc<dyn ConversationStore>,
    task_manager: Arc<TaskManager>,
    cache: Arc<ToolResultCache>,
    bus: Arc<EventBus>,
    config: RuntimeConfig,
    forwarded_env: Vec<String>,
    docs_root: Option<PathBuf>,
}

impl AgentFactory {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        model: Arc<dyn ChatModel>,
        conversations: Arc<dyn ConversationStore>,
        task_manager: Arc<TaskManager>,
        cache: Arc<ToolResultCache>,
        bus: Arc<EventBus>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            model,
            conversations,
            task_manager,
            cache,
            bus,
            config,
            forwarded_env: Vec::new(),
            docs_root: None,
        }
    }

    /// Credential variables the bash environment scrub forwards.
    pub fn with_forwarded_env(mut self, vars: Vec<String>) -> Self {
        self.forwarded_env = vars;
        self
    }

    pub fn with_docs_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.docs_root = Some(root.into());
        self
    }

    fn base_registry(&self, bundle: &ContextBundle) -> ToolRegistry {
        let mut registry = ToolRegistry::new(self.cache.clone());
        let register = |registry: &mut ToolRegistry, tool: Arc<dyn Tool>| {
            if let Err(e) = registry.register(tool) {
                tracing::warn!("skipping built-in tool: {e}");
            }
        };
        register(
            &mut registry,
            Arc::new(BashCapability::new(
                self.config.bash_timeout_ms,
                self.forwarded_env.clone(),
            )),
        );
        register(
            &mut registry,
            Arc::new(UpdateTaskStatusTool::new(
                self.task_manager.clone(),
                bundle.conversation_id,
            )),
        );
        register(
            &mut registry,
            Arc::new(UpdateTopicTool::new(
                self.conversations.clone(),
                bundle.conversation_id,
            )),
        );
        registry
    }

    pub fn bash_agent(&self, bundle: &ContextBundle) -> LoopAgent {
        LoopAgent::new(
            "bash-agent",
            AgentKind::Bash,
            render_instructions(BASH_ROLE, bundle),
            self.base_registry(bundle),
            self.model.clone(),
            bundle.conversation_id,
            self.bus.clone(),
        )
    }

    pub fn engineering_agent(&self, bundle: &ContextBundle) -> LoopAgent {
        let mut registry = self.base_registry(bundle);
        if let Some(root) = &self.docs_root {
            for tool in [
                Arc::new(DocSearchTool::new(root.clone())) as Arc<dyn Tool>,
                Arc::new(DocReadTool::new(root.clone())) as Arc<dyn Tool>,
            ] {
                if let Err(e) = registry.register(tool) {
                    tracing::warn!("skipping doc tool: {e}");
                }
            }
        }
        LoopAgent::new(
            "engineering-agent",
            AgentKind::SoftwareEngineering,
            render_instructions(SWE_ROLE, bundle),
            registry,
            self.model.clone(),
            bundle.conversation_id,
            self.bus.clone(),
        )
    }

    /// Parallel executor for a specific per-item operation. Policy knobs
    /// default from config; callers override per dispatch.
    pub fn parallel_executor(
        &self,
        bundle: &ContextBundle,
        operation: Arc<dyn Tool>,
        policy: Option<BatchPolicy>,
    ) -> ParallelExecutorAgent {
        ParallelExecutorAgent::new(
            operation,
            policy.unwrap_or_else(|| BatchPolicy::from_config(&self.config)),
            &self.config,
            bundle.conversation_id,
            self.bus.clone(),
        )
    }
}

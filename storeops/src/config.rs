use serde::{Deserialize, Serialize};

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Runtime limits and knobs, read once at startup and threaded explicitly.
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
pub struct RuntimeConfig {
    /// Hard ceiling on the serialized context bundle.
    pub max_context_bytes: usize,
    /// Conversation turns included in agent input.
    pub max_history_messages: usize,
    /// Continuation retries before the output guard gives up.
    pub bulk_guard_max_retries: u32,
    pub parallel_executor_concurrency: usize,
    pub parallel_executor_throttle_ms: u64,
    pub parallel_executor_max_items: usize,
    pub parallel_executor_min_items: usize,
    pub bash_timeout_ms: u64,
    pub orchestrator_max_turns_bulk: usize,
    pub orchestrator_max_turns_standard: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_context_bytes: 150_000,
            max_history_messages: 10,
            bulk_guard_max_retries: 5,
            parallel_executor_concurrency: 5,
            parallel_executor_throttle_ms: 1000,
            parallel_executor_max_items: 50,
            parallel_executor_min_items: 10,
            bash_timeout_ms: 300_000,
            orchestrator_max_turns_bulk: 500,
            orchestrator_max_turns_standard: 100,
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_context_bytes: env_usize("MAX_CONTEXT_BYTES", defaults.max_context_bytes),
            max_history_messages: env_usize("MAX_HISTORY_MESSAGES", defaults.max_history_messages),
            bulk_guard_max_retries: env_u32(
                "BULK_GUARD_MAX_RETRIES",
                defaults.bulk_guard_max_retries,
            ),
            parallel_executor_concurrency: env_usize(
                "PARALLEL_EXECUTOR_CONCURRENCY",
                defaults.parallel_executor_concurrency,
            ),
            parallel_executor_throttle_ms: env_u64(
                "PARALLEL_EXECUTOR_THROTTLE_MS",
                defaults.parallel_executor_throttle_ms,
            ),
            parallel_executor_max_items: env_usize(
                "PARALLEL_EXECUTOR_MAX_ITEMS",
                defaults.parallel_executor_max_items,
            ),
            parallel_executor_min_items: env_usize(
                "PARALLEL_EXECUTOR_MIN_ITEMS",
                defaults.parallel_executor_min_items,
            ),
            bash_timeout_ms: env_u64("BASH_TIMEOUT_MS", defaults.bash_timeout_ms),
            orchestrator_max_turns_bulk: env_usize(
                "ORCHESTRATOR_MAX_TURNS_BULK",
                defaults.orchestrator_max_turns_bulk,
            ),
            orchestrator_max_turns_standard: env_usize(
                "ORCHESTRATOR_MAX_TURNS_STANDARD",
                defaults.orchestrator_max_turns_standard,
            ),
        }
    }

    /// Turn cap for a run, depending on whether bulk handling is active.
    pub fn max_turns(&self, bulk: bool) -> usize {
        if bulk {
            self.orchestrator_max_turns_bulk
        } else {
            self.orchestrator_max_turns_standard
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = RuntimeConfig::default();
        assert_eq!(config.max_context_bytes, 150_000);
        assert_eq!(config.bulk_guard_max_retries, 5);
        assert_eq!(config.parallel_executor_concurrency, 5);
        assert_eq!(config.parallel_executor_min_items, 10);
        assert_eq!(config.parallel_executor_max_items, 50);
        assert_eq!(config.bash_timeout_ms, 300_000);
        assert_eq!(config.max_turns(true), 500);
        assert_eq!(config.max_turns(false), 100);
    }
}

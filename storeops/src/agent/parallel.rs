//! Light-bulk worker: applies one operation to each item of a 10-50 item
//! batch under a concurrency cap, inter-operation throttle, and per-item
//! retry limit. Results keep input order.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::bus::{events, EventBus};
use crate::config::RuntimeConfig;
use crate::error::OrchestratorError;
use crate::tools::Tool;
use crate::types::ConversationId;

#[derive(Debug, Clone)]
pub struct BatchPolicy {
    pub concurrency: usize,
    pub throttle: Duration,
    pub retry_limit: u32,
    pub dry_run: bool,
}

impl BatchPolicy {
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            concurrency: config.parallel_executor_concurrency,
            throttle: Duration::from_millis(config.parallel_executor_throttle_ms),
            retry_limit: 2,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Completed,
    Failed,
    /// The run was cancelled before this item started.
    Interrupted,
    DryRun,
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemResult {
    pub item: Value,
    pub status: ItemStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempts: u32,
}

pub struct ParallelExecutorAgent {
    operation: Arc<dyn Tool>,
    policy: BatchPolicy,
    min_items: usize,
    max_items: usize,
    conversation_id: ConversationId,
    bus: Arc<EventBus>,
}

impl ParallelExecutorAgent {
    pub fn new(
        operation: Arc<dyn Tool>,
        policy: BatchPolicy,
        config: &RuntimeConfig,
        conversation_id: ConversationId,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            operation,
            policy,
            min_items: config.parallel_executor_min_items,
            max_items: config.parallel_executor_max_items,
            conversation_id,
            bus,
        }
    }

    /// Runs the batch. Results come back in input order regardless of
    /// completion order. On cancellation, in-flight items finish; items not
    /// yet started come back as `interrupted`.
    pub async fn run(
        &self,
        items: Vec<Value>,
        cancel: &CancellationToken,
    ) -> Result<Vec<ItemResult>, OrchestratorError> {
        if items.len() < self.min_items {
            return Err(OrchestratorError::TooFewItems {
                got: items.len(),
                min: self.min_items,
            });
        }
        if items.len() > self.max_items {
            return Err(OrchestratorError::TooManyItems {
                got: items.len(),
                max: self.max_items,
            });
        }

        let semaphore = Arc::new(Semaphore::new(self.policy.concurrency.max(1)));
        let gate = Arc::new(Mutex::new(tokio::time::Instant::now()));
        let total = items.len();
        tracing::info!(
            total,
            concurrency = self.policy.concurrency,
            dry_run = self.policy.dry_run,
            "parallel executor starting batch"
        );

        let futures = items.into_iter().enumerate().map(|(index, item)| {
            let semaphore = semaphore.clone();
            let gate = gate.clone();
            let operation = self.operation.clone();
            let policy = self.policy.clone();
            let bus = self.bus.clone();
            let conv = self.conversation_id;
            let cancel = cancel.clone();

            async move {
                // Semaphore enforces the cap; acquire before the throttle
                // gate so waiting items do not consume throttle slots.
                let Ok(_permit) = semaphore.acquire().await else {
                    return interrupted_result(item);
                };
                if cancel.is_cancelled() {
                    return interrupted_result(item);
                }

                if policy.dry_run {
                    return ItemResult {
                        item,
                        status: ItemStatus::DryRun,
                        output: None,
                        error: None,
                        attempts: 0,
                    };
                }

                throttle(&gate, policy.throttle).await;

                let mut attempts = 0;
                let mut last_error = None;
                while attempts <= policy.retry_limit {
                    attempts += 1;
                    match operation.invoke(item.clone()).await {
                        Ok(output) => {
                            bus.emit(
                                conv,
                                events::AGENT_TOOL_CALL,
                                json!({
                                    "agent": "parallel_executor",
                                    "tool": operation.name(),
                                    "index": index,
                                    "status": "completed",
                                }),
                            );
                            return ItemResult {
                                item,
                                status: ItemStatus::Completed,
                                output: Some(output),
                                error: None,
                                attempts,
                            };
                        }
                        Err(e) => {
                            tracing::warn!(index, attempts, "batch item failed: {e}");
                            last_error = Some(e.to_string());
                            if cancel.is_cancelled() {
                                break;
                            }
                        }
                    }
                }
                ItemResult {
                    item,
                    status: ItemStatus::Failed,
                    output: None,
                    error: last_error,
                    attempts,
                }
            }
        });

        let results = join_all(futures).await;
        let completed = results
            .iter()
            .filter(|r| r.status == ItemStatus::Completed)
            .count();
        tracing::info!(completed, total, "parallel executor batch finished");
        Ok(results)
    }
}

fn interrupted_result(item: Value) -> ItemResult {
    ItemResult {
        item,
        status: ItemStatus::Interrupted,
        output: None,
        error: None,
        attempts: 0,
    }
}

/// Global rate gate: operation starts are spaced at least `throttle` apart.
async fn throttle(gate: &Arc<Mutex<tokio::time::Instant>>, throttle: Duration) {
    if throttle.is_zero() {
        return;
    }
    let mut last = gate.lock().await;
    let now = tokio::time::Instant::now();
    let next = (*last + throttle).max(now);
    *last = next;
    drop(last);
    tokio::time::sleep_until(next).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingOp {
        running: AtomicUsize,
        peak: AtomicUsize,
        fail_first_for: Option<String>,
        failed_once: std::sync::Mutex<std::collections::HashSet<String>>,
    }

    impl CountingOp {
        fn new() -> Self {
            Self {
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                fail_first_for: None,
                failed_once: std::sync::Mutex::new(Default::default()),
            }
        }
    }

    #[async_trait::async_trait]
    impl Tool for CountingOp {
        fn name(&self) -> &str {
            "apply_item"
        }
        fn description(&self) -> &str {
            "applies the operation to one item"
        }
        fn parameters(&self) -> Value {
            json!({"type": "object", "properties": {"id": {"type": "string"}}, "required": ["id"]})
        }
        async fn invoke(&self, args: Value) -> Result<Value, OrchestratorError> {
            let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(running, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);

            let id = args["id"].as_str().unwrap_or_default().to_string();
            if let Some(target) = &self.fail_first_for {
                if &id == target && self.failed_once.lock().unwrap().insert(id.clone()) {
                    return Err(OrchestratorError::ToolExecution("transient".into()));
                }
            }
            Ok(json!({"applied": id}))
        }
    }

    fn config() -> RuntimeConfig {
        RuntimeConfig {
            parallel_executor_throttle_ms: 0,
            ..Default::default()
        }
    }

    fn items(n: usize) -> Vec<Value> {
        (0..n).map(|i| json!({"id": format!("item-{i}")})).collect()
    }

    fn agent(op: Arc<dyn Tool>, policy: BatchPolicy) -> ParallelExecutorAgent {
        ParallelExecutorAgent::new(op, policy, &config(), 1, Arc::new(EventBus::new()))
    }

    #[tokio::test]
    async fn rejects_out_of_range_batches() {
        let op = Arc::new(CountingOp::new());
        let agent = agent(op, BatchPolicy::from_config(&config()));
        let cancel = CancellationToken::new();

        let err = agent.run(items(9), &cancel).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::TooFewItems { got: 9, .. }));

        let err = agent.run(items(51), &cancel).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::TooManyItems { got: 51, .. }));

        assert!(agent.run(items(10), &cancel).await.is_ok());
    }

    #[tokio::test]
    async fn concurrency_cap_is_never_exceeded() {
        let op = Arc::new(CountingOp::new());
        let policy = BatchPolicy {
            concurrency: 3,
            throttle: Duration::ZERO,
            retry_limit: 0,
            dry_run: false,
        };
        let agent = agent(op.clone(), policy);
        let results = agent
            .run(items(20), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(results.len(), 20);
        assert!(op.peak.load(Ordering::SeqCst) <= 3);
        // Input order is preserved.
        assert_eq!(results[0].item["id"], "item-0");
        assert_eq!(results[19].item["id"], "item-19");
    }

    #[tokio::test]
    async fn failed_items_retry_up_to_the_limit() {
        let mut op = CountingOp::new();
        op.fail_first_for = Some("item-3".into());
        let policy = BatchPolicy {
            concurrency: 5,
            throttle: Duration::ZERO,
            retry_limit: 2,
            dry_run: false,
        };
        let agent = agent(Arc::new(op), policy);
        let results = agent
            .run(items(10), &CancellationToken::new())
            .await
            .unwrap();
        let retried = &results[3];
        assert_eq!(retried.status, ItemStatus::Completed);
        assert_eq!(retried.attempts, 2);
    }

    #[tokio::test]
    async fn dry_run_invokes_nothing() {
        let op = Arc::new(CountingOp::new());
        let policy = BatchPolicy {
            concurrency: 5,
            throttle: Duration::ZERO,
            retry_limit: 0,
            dry_run: true,
        };
        let agent = agent(op.clone(), policy);
        let results = agent
            .run(items(10), &CancellationToken::new())
            .await
            .unwrap();
        assert!(results.iter().all(|r| r.status == ItemStatus::DryRun));
        assert_eq!(op.peak.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancellation_interrupts_unstarted_items() {
        let op = Arc::new(CountingOp::new());
        let policy = BatchPolicy {
            concurrency: 1,
            throttle: Duration::ZERO,
            retry_limit: 0,
            dry_run: false,
        };
        let agent = agent(op, policy);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let results = agent.run(items(10), &cancel).await.unwrap();
        assert!(results
            .iter()
            .all(|r| r.status == ItemStatus::Interrupted));
    }
}

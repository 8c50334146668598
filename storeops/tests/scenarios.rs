//! End-to-end runtime scenarios driven by a scripted chat model. The guard
//! classifiers run rule-based, so every path here is deterministic.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use storeops::agent::AgentFactory;
use storeops::bus::{EventBus, SseFrame, Subscription};
use storeops::cache::ToolResultCache;
use storeops::checkpoint::CheckpointStore;
use storeops::context::ContextBuilder;
use storeops::conversation::{ConversationStore, MemoryConversationStore, TaskManager};
use storeops::error::OrchestratorError;
use storeops::guardrail::{InputGuard, OutputGuard};
use storeops::llm::{ChatModel, ModelRequest, ModelTurn, PromptMessage, ToolInvocation};
use storeops::memory::{HashEmbedder, LexicalVectorStore};
use storeops::supervisor::{RunRequest, RunStatus, Supervisor, SupervisorPorts};
use storeops::tools::{Tool, ToolRegistry};
use storeops::types::{
    ChatRole, Checkpoint, CheckpointStats, FileAttachment, FileEncoding, ImageAttachment,
};
use storeops::RuntimeConfig;

struct ScriptedModel {
    turns: StdMutex<VecDeque<ModelTurn>>,
    requests: Arc<StdMutex<Vec<ModelRequest>>>,
}

impl ScriptedModel {
    fn new(turns: Vec<ModelTurn>, requests: Arc<StdMutex<Vec<ModelRequest>>>) -> Self {
        Self {
            turns: StdMutex::new(turns.into()),
            requests,
        }
    }
}

#[async_trait::async_trait]
impl ChatModel for ScriptedModel {
    async fn complete(
        &self,
        request: ModelRequest,
        _cancel: &CancellationToken,
    ) -> Result<ModelTurn, OrchestratorError> {
        self.requests.lock().unwrap().push(request);
        self.turns
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| OrchestratorError::Model("script exhausted".into()))
    }
}

/// Model that blocks until the run is cancelled.
struct BlockingModel;

#[async_trait::async_trait]
impl ChatModel for BlockingModel {
    async fn complete(
        &self,
        _request: ModelRequest,
        cancel: &CancellationToken,
    ) -> Result<ModelTurn, OrchestratorError> {
        cancel.cancelled().await;
        Err(OrchestratorError::Interrupted)
    }
}

struct RecordingTool {
    name: String,
    read_only: bool,
    calls: Arc<StdMutex<Vec<Value>>>,
    response: Value,
}

impl RecordingTool {
    fn new(
        name: &str,
        read_only: bool,
        response: Value,
    ) -> (Arc<dyn Tool>, Arc<StdMutex<Vec<Value>>>) {
        let calls = Arc::new(StdMutex::new(Vec::new()));
        let tool: Arc<dyn Tool> = Arc::new(Self {
            name: name.to_string(),
            read_only,
            calls: calls.clone(),
            response,
        });
        (tool, calls)
    }
}

#[async_trait::async_trait]
impl Tool for RecordingTool {
    fn name(&self) -> &str {
        &self.name
    }
    fn description(&self) -> &str {
        "test tool"
    }
    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "identifier": {"type": "string"},
                "sku": {"type": "string"},
                "price": {"type": "number"},
                "url": {"type": "string"}
            },
            "required": []
        })
    }
    fn read_only(&self) -> bool {
        self.read_only
    }
    async fn invoke(&self, args: Value) -> Result<Value, OrchestratorError> {
        self.calls.lock().unwrap().push(args);
        Ok(self.response.clone())
    }
}

struct Harness {
    supervisor: Arc<Supervisor>,
    conversations: Arc<MemoryConversationStore>,
    checkpoints: Arc<CheckpointStore>,
    cache: Arc<ToolResultCache>,
    requests: Arc<StdMutex<Vec<ModelRequest>>>,
    _dir: tempfile::TempDir,
}

fn harness(model: Arc<dyn ChatModel>, tools: Vec<Arc<dyn Tool>>) -> (Harness, Subscription) {
    dotenv::dotenv().ok();
    let dir = tempfile::tempdir().unwrap();
    let config = RuntimeConfig {
        parallel_executor_throttle_ms: 0,
        ..Default::default()
    };

    let conversations = Arc::new(MemoryConversationStore::new());
    let checkpoints = Arc::new(CheckpointStore::new(dir.path()).unwrap());
    let bus = Arc::new(EventBus::new());
    let subscription = bus.subscribe("u1");
    let task_manager = Arc::new(TaskManager::new(checkpoints.clone(), bus.clone()));

    let cache = Arc::new(ToolResultCache::new(Arc::new(HashEmbedder::default())));
    let mut registry = ToolRegistry::new(cache.clone());
    for tool in tools {
        registry.register(tool).unwrap();
    }
    let registry = Arc::new(registry);

    let vector = LexicalVectorStore::shared();
    let context_builder = Arc::new(
        ContextBuilder::new(vector, config.clone())
            .with_rules(vec!["ALWAYS respect MAP pricing".to_string()]),
    );

    let factory = Arc::new(AgentFactory::new(
        model.clone(),
        conversations.clone(),
        task_manager.clone(),
        cache.clone(),
        bus.clone(),
        config.clone(),
    ));

    let ports = SupervisorPorts {
        model,
        conversations: conversations.clone(),
        checkpoints: checkpoints.clone(),
        task_manager,
        context_builder,
        tools: registry,
        factory,
        bus,
        cancellations: Arc::new(storeops::supervisor::CancellationRegistry::new()),
        input_guard: InputGuard::rule_based(),
        output_guard: OutputGuard::rule_based(),
    };

    let harness = Harness {
        supervisor: Arc::new(Supervisor::new(ports, config)),
        conversations,
        checkpoints,
        cache,
        requests: Arc::new(StdMutex::new(Vec::new())),
        _dir: dir,
    };
    (harness, subscription)
}

fn scripted_harness(
    turns: Vec<ModelTurn>,
    tools: Vec<Arc<dyn Tool>>,
) -> (Harness, Subscription) {
    let requests = Arc::new(StdMutex::new(Vec::new()));
    let model = Arc::new(ScriptedModel::new(turns, requests.clone()));
    let (mut harness, subscription) = harness(model, tools);
    harness.requests = requests;
    (harness, subscription)
}

fn drain(subscription: &mut Subscription) -> Vec<SseFrame> {
    let mut frames = Vec::new();
    while let Ok(frame) = subscription.frames.try_recv() {
        frames.push(frame);
    }
    frames
}

fn tool_call(name: &str, args: Value) -> ToolInvocation {
    ToolInvocation {
        id: uuid_like(name),
        name: name.to_string(),
        arguments: args.to_string(),
    }
}

fn uuid_like(seed: &str) -> String {
    format!("call-{seed}")
}

#[tokio::test]
async fn simple_lookup_runs_one_tool_and_streams_done() {
    let _ = tracing_subscriber::fmt::try_init();
    let (get_product, calls) = RecordingTool::new(
        "get_product",
        true,
        json!({"title": "Mexican Altura", "price": "18.00"}),
    );
    let (harness, mut subscription) = scripted_harness(
        vec![
            ModelTurn::ToolCalls {
                content: String::new(),
                calls: vec![tool_call("get_product", json!({"identifier": "mexican-altura"}))],
            },
            ModelTurn::Text("Mexican Altura sells for $18.00.".into()),
        ],
        vec![get_product],
    );

    let outcome = harness
        .supervisor
        .handle(RunRequest::text(
            "Get product details for mexican-altura",
            "u1",
        ))
        .await
        .unwrap();

    assert_eq!(outcome.status, RunStatus::Done);
    assert_eq!(outcome.text, "Mexican Altura sells for $18.00.");
    assert_eq!(calls.lock().unwrap().len(), 1);
    assert_eq!(calls.lock().unwrap()[0]["identifier"], "mexican-altura");

    // Not classified bulk: no plan was created.
    assert!(harness
        .checkpoints
        .read_plan(outcome.conversation_id)
        .await
        .unwrap()
        .is_empty());

    // The read result landed in the cache.
    let hit = harness
        .cache
        .lookup(
            outcome.conversation_id,
            "get_product",
            &json!({"identifier": "mexican-altura"}),
        )
        .await
        .unwrap();
    assert!(hit.is_some());

    let names: Vec<String> = drain(&mut subscription).into_iter().map(|f| f.event).collect();
    assert!(names.contains(&"start".to_string()));
    assert!(names.contains(&"conversation_id".to_string()));
    assert!(names.contains(&"tool_call".to_string()));
    assert!(names.contains(&"assistant_delta".to_string()));
    assert_eq!(names.last().unwrap(), "done");
}

#[tokio::test]
async fn specific_price_update_is_not_bulk_and_persists() {
    let (update_pricing, calls) =
        RecordingTool::new("update_pricing", false, json!({"ok": true}));
    let (harness, _subscription) = scripted_harness(
        vec![
            ModelTurn::ToolCalls {
                content: String::new(),
                calls: vec![tool_call(
                    "update_pricing",
                    json!({"sku": "ESP-1001", "price": 49.99}),
                )],
            },
            ModelTurn::Text("Updated ESP-1001 to $49.99.".into()),
        ],
        vec![update_pricing],
    );

    let outcome = harness
        .supervisor
        .handle(RunRequest::text("Update SKU ESP-1001 to $49.99", "u1"))
        .await
        .unwrap();

    assert_eq!(outcome.status, RunStatus::Done);
    {
        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0]["sku"], "ESP-1001");
        assert_eq!(calls[0]["price"], 49.99);
    }

    // Assistant message persisted; no task plan; no bulk retries.
    let messages = harness
        .conversations
        .messages(outcome.conversation_id, 10)
        .await
        .unwrap();
    assert_eq!(messages.last().unwrap().role, ChatRole::Assistant);
    assert_eq!(messages.last().unwrap().content, "Updated ESP-1001 to $49.99.");
    assert!(harness
        .checkpoints
        .read_plan(outcome.conversation_id)
        .await
        .unwrap()
        .is_empty());

    // Write tools are never cached.
    let stats = harness.cache.stats(outcome.conversation_id).await;
    assert_eq!(stats.entries, 0);
}

fn bulk_request(urls: usize) -> String {
    let list: Vec<String> = (1..=urls)
        .map(|i| format!("https://shop.example/products/p{i}"))
        .collect();
    format!("remove discount from these products:\n{}", list.join("\n"))
}

#[tokio::test]
async fn bulk_tripwire_composes_checkpoint_aware_continuation() {
    let (harness, mut subscription) = scripted_harness(
        vec![
            // Turn 1: announce-and-stop with no work behind it.
            ModelTurn::Text(
                "I'll now continue with the remaining products. Would you like me to continue?"
                    .into(),
            ),
            // Continuation run completes the batch.
            ModelTurn::Text("All 25 items have been updated.".into()),
        ],
        vec![],
    );

    // Conversation exists up front so a prior checkpoint can be seeded; 11
    // of the 25 items were completed in an earlier run.
    let conversation = harness.conversations.create("u1", "bulk run").await.unwrap();
    let completed: Vec<String> = (1..=11)
        .map(|i| format!("https://shop.example/products/p{i}"))
        .collect();
    harness
        .checkpoints
        .append_checkpoint(
            conversation.id,
            Checkpoint {
                seq: 0,
                timestamp: chrono::Utc::now(),
                completed: completed.clone(),
                failed: vec![],
                stats: CheckpointStats {
                    completed: 11,
                    failed: 0,
                    remaining: 14,
                },
                last_item: completed.last().cloned(),
                bulk_operation: None,
            },
        )
        .await
        .unwrap();

    let mut request = RunRequest::text(bulk_request(25), "u1");
    request.conv_id = Some(conversation.id);
    let outcome = harness.supervisor.handle(request).await.unwrap();

    assert_eq!(outcome.status, RunStatus::Done);
    // Preserved text plus the continuation result.
    assert!(outcome.text.contains("Would you like me to continue?"));
    assert!(outcome.text.contains("All 25 items have been updated."));

    // The continuation prompt enumerated exactly the 14 remaining items and
    // forbade handing control back.
    let requests = harness.requests.lock().unwrap();
    assert_eq!(requests.len(), 2);
    let continuation = match &requests[1].messages[1] {
        PromptMessage::User(text) => text.clone(),
        other => panic!("expected user prompt, got {other:?}"),
    };
    let listed = continuation
        .lines()
        .filter(|line| line.starts_with("- https://"))
        .count();
    assert_eq!(listed, 14);
    assert!(!continuation.contains("- https://shop.example/products/p1\n"));
    assert!(continuation.contains("Do NOT return control"));
    assert!(continuation.contains("Do NOT show code"));
    drop(requests);

    // A 25-item plan was created and announced.
    let plan = harness.checkpoints.read_plan(conversation.id).await.unwrap();
    assert_eq!(plan.len(), 25);
    let frames = drain(&mut subscription);
    assert!(frames.iter().any(|f| f.event == "task_plan_created"));
    assert!(frames
        .iter()
        .any(|f| f.event == "agent_status" && f.data["status"] == "guardrail_enforced"));

    // Plan in the store matches the last task_summary projection.
    let last_summary = frames
        .iter()
        .rev()
        .find(|f| f.event == "task_summary")
        .unwrap();
    assert_eq!(last_summary.data["total"], 25);

    // Completion cleared the bulk state.
    assert!(harness
        .supervisor
        .bulk_state(conversation.id)
        .map(|s| !s.active)
        .unwrap_or(true));
}

#[tokio::test]
async fn tripwire_retries_are_bounded_with_termination_notice() {
    // Every turn announces and stops; the guard must give up after the
    // configured retries and emit the preserved text plus a notice.
    let stall =
        "I'll continue with the remaining products. Would you like me to continue?".to_string();
    let turns: Vec<ModelTurn> = (0..6).map(|_| ModelTurn::Text(stall.clone())).collect();
    let (harness, _subscription) = scripted_harness(turns, vec![]);

    let outcome = harness
        .supervisor
        .handle(RunRequest::text(bulk_request(12), "u1"))
        .await
        .unwrap();

    assert_eq!(outcome.status, RunStatus::Done);
    assert!(outcome.text.contains("Would you like me to continue?"));
    assert!(outcome.text.contains("halted after 5 continuation attempts"));

    // Exactly maxRetries + 1 model calls: the original plus five retries.
    assert_eq!(harness.requests.lock().unwrap().len(), 6);
}

#[tokio::test]
async fn interrupt_mid_run_yields_interrupted_event() {
    let (harness, mut subscription) = harness(Arc::new(BlockingModel), vec![]);
    let conversation = harness.conversations.create("u1", "t").await.unwrap();

    let supervisor = harness.supervisor.clone();
    let conv = conversation.id;
    let run = tokio::spawn(async move {
        let mut request = RunRequest::text("Get product details for mexican-altura", "u1");
        request.conv_id = Some(conv);
        supervisor.handle(request).await
    });

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert!(harness.supervisor.interrupt(conv));

    let outcome = run.await.unwrap().unwrap();
    assert_eq!(outcome.status, RunStatus::Interrupted);
    assert_eq!(outcome.text, "Execution was interrupted by user");

    let frames = drain(&mut subscription);
    assert_eq!(frames.last().unwrap().event, "interrupted");
}

#[tokio::test]
async fn overlapping_run_is_rejected_busy() {
    let (harness, _subscription) = harness(Arc::new(BlockingModel), vec![]);
    let conversation = harness.conversations.create("u1", "t").await.unwrap();
    let conv = conversation.id;

    let supervisor = harness.supervisor.clone();
    let first = tokio::spawn(async move {
        let mut request = RunRequest::text("first", "u1");
        request.conv_id = Some(conv);
        supervisor.handle(request).await
    });
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let mut second = RunRequest::text("second", "u1");
    second.conv_id = Some(conv);
    let err = harness.supervisor.handle(second).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Busy(id) if id == conv));

    harness.supervisor.interrupt(conv);
    let outcome = first.await.unwrap().unwrap();
    assert_eq!(outcome.status, RunStatus::Interrupted);
}

#[tokio::test]
async fn valid_attachments_are_folded_before_the_model_sees_the_turn() {
    let (harness, _subscription) = scripted_harness(
        vec![ModelTurn::Text("The sheet lists one SKU at $49.99.".into())],
        vec![],
    );

    let mut request = RunRequest::text("summarize the attached price sheet", "u1");
    request.file = Some(FileAttachment {
        name: "prices.csv".to_string(),
        mime_type: "text/csv".to_string(),
        encoding: FileEncoding::Text,
        content: Some("sku,price\nESP-1001,49.99".to_string()),
        data: None,
    });
    request.image = Some(ImageAttachment::Url {
        url: "https://cdn.example/shelf.jpg".to_string(),
    });

    let outcome = harness.supervisor.handle(request).await.unwrap();
    assert_eq!(outcome.status, RunStatus::Done);

    // The persisted user message carries the folded attachment content.
    let messages = harness
        .conversations
        .messages(outcome.conversation_id, 10)
        .await
        .unwrap();
    let user_message = &messages[0];
    assert_eq!(user_message.role, ChatRole::User);
    assert!(user_message.content.contains("ESP-1001,49.99"));
    assert!(user_message
        .content
        .contains("[attached image: https://cdn.example/shelf.jpg]"));

    // The model's prompt saw the folded message too.
    let requests = harness.requests.lock().unwrap();
    let prompt = match &requests[0].messages[1] {
        PromptMessage::User(text) => text.clone(),
        other => panic!("expected user prompt, got {other:?}"),
    };
    assert!(prompt.contains("ESP-1001,49.99"));
}

#[tokio::test]
async fn malformed_attachment_fails_the_run_with_validation_error() {
    let (harness, mut subscription) = scripted_harness(
        vec![ModelTurn::Text("never reached".into())],
        vec![],
    );

    // Binary encoding with no data payload.
    let mut request = RunRequest::text("import this", "u1");
    request.file = Some(FileAttachment {
        name: "dump.bin".to_string(),
        mime_type: "application/octet-stream".to_string(),
        encoding: FileEncoding::Binary,
        content: None,
        data: None,
    });
    let err = harness.supervisor.handle(request).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Validation(_)));

    // No model call was made and the stream ended with an error frame.
    assert!(harness.requests.lock().unwrap().is_empty());
    let frames = drain(&mut subscription);
    assert_eq!(frames.last().unwrap().event, "error");
    assert!(frames.last().unwrap().data["message"]
        .as_str()
        .unwrap()
        .contains("missing data"));
}

#[tokio::test]
async fn tool_failure_is_returned_to_the_model_not_fatal() {
    struct FailingTool;

    #[async_trait::async_trait]
    impl Tool for FailingTool {
        fn name(&self) -> &str {
            "update_pricing"
        }
        fn description(&self) -> &str {
            "always fails"
        }
        fn parameters(&self) -> Value {
            json!({"type": "object", "properties": {"sku": {"type": "string"}}, "required": ["sku"]})
        }
        async fn invoke(&self, _args: Value) -> Result<Value, OrchestratorError> {
            Err(OrchestratorError::ToolExecution("pricing API returned 502".into()))
        }
    }

    let (harness, _subscription) = scripted_harness(
        vec![
            ModelTurn::ToolCalls {
                content: String::new(),
                calls: vec![tool_call("update_pricing", json!({"sku": "ESP-1001"}))],
            },
            ModelTurn::Text("The pricing API rejected the update; nothing was changed.".into()),
        ],
        vec![Arc::new(FailingTool) as Arc<dyn Tool>],
    );

    let outcome = harness
        .supervisor
        .handle(RunRequest::text("Update SKU ESP-1001 to $49.99", "u1"))
        .await
        .unwrap();
    assert_eq!(outcome.status, RunStatus::Done);

    // The model saw the structured error as its tool result.
    let requests = harness.requests.lock().unwrap();
    let last = requests.last().unwrap();
    let saw_error = last.messages.iter().any(|m| {
        matches!(m, PromptMessage::ToolResult { content, .. } if content.contains("pricing API returned 502"))
    });
    assert!(saw_error);
}

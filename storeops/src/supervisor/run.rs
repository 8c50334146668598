use std::sync::{Arc, Mutex as StdMutex};

use async_openai::types::{ChatCompletionTool, ChatCompletionToolType, FunctionObject};
use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::cancel::CancellationRegistry;
use super::continuation::{compose_continuation_prompt, preserve_text, termination_notice};
use super::intent::{analyze_intent, IntentAnalysis};
use crate::agent::{AgentFactory, AgentStatus, BatchPolicy, ItemStatus, INTERRUPTED_MESSAGE};
use crate::bus::{events, EventBus};
use crate::checkpoint::CheckpointStore;
use crate::context::{BuildRequest, ContextBuilder};
use crate::context::patterns::extract_entities;
use crate::conversation::{recommend_autonomy, ConversationStore, TaskManager};
use crate::error::OrchestratorError;
use crate::guardrail::{GuardDecision, InputGuard, OutputGuard};
use crate::llm::{ChatModel, ModelRequest, ModelTurn, PromptMessage, ToolInvocation};
use crate::tools::ToolRegistry;
use crate::types::{
    AdaptiveContext, AutonomyLevel, BulkCheckpointInfo, BulkOperationState, ChatRole, Checkpoint,
    CheckpointStats, ContextBundle, Conversation, ConversationId, ExtractedData, FileAttachment,
    FileEncoding, ImageAttachment, TaskItem,
};

pub const SPAWN_BASH: &str = "spawn_bash_agent";
pub const SPAWN_ENGINEER: &str = "spawn_software_engineer";
pub const SPAWN_PARALLEL: &str = "spawn_parallel_executor";

const ORCHESTRATOR_ROLE: &str = "You are the supervising agent of an e-commerce operations assistant. You complete operator requests end to end: call store tools directly for catalog and pricing work, and delegate through spawn_bash_agent (system/file/git tasks), spawn_software_engineer (tool creation and refactoring), or spawn_parallel_executor (batches of 10-50 items). Execute operations; never describe what you would do instead of doing it.";

/// One inbound operator turn.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub message: String,
    pub conv_id: Option<ConversationId>,
    pub user_id: String,
    pub image: Option<ImageAttachment>,
    pub file: Option<FileAttachment>,
}

impl RunRequest {
    pub fn text(message: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            conv_id: None,
            user_id: user_id.into(),
            image: None,
            file: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Done,
    Failed,
    Interrupted,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub conversation_id: ConversationId,
    pub status: RunStatus,
    pub text: String,
}

/// The ports a supervisor drives. Everything is shared; the supervisor owns
/// only per-run state.
pub struct SupervisorPorts {
    pub model: Arc<dyn ChatModel>,
    pub conversations: Arc<dyn ConversationStore>,
    pub checkpoints: Arc<CheckpointStore>,
    pub task_manager: Arc<TaskManager>,
    pub context_builder: Arc<ContextBuilder>,
    pub tools: Arc<ToolRegistry>,
    pub factory: Arc<AgentFactory>,
    pub bus: Arc<EventBus>,
    pub cancellations: Arc<CancellationRegistry>,
    pub input_guard: InputGuard,
    pub output_guard: OutputGuard,
}

pub struct Supervisor {
    ports: SupervisorPorts,
    config: crate::config::RuntimeConfig,
    bulk_states: DashMap<ConversationId, BulkOperationState>,
}

impl Supervisor {
    pub fn new(ports: SupervisorPorts, config: crate::config::RuntimeConfig) -> Self {
        Self {
            ports,
            config,
            bulk_states: DashMap::new(),
        }
    }

    pub fn cancellations(&self) -> Arc<CancellationRegistry> {
        self.ports.cancellations.clone()
    }

    /// Aborts the active run on a conversation, if any.
    pub fn interrupt(&self, conv: ConversationId) -> bool {
        self.ports.cancellations.abort(conv)
    }

    /// Snapshot of the bulk state for a conversation, if any.
    pub fn bulk_state(&self, conv: ConversationId) -> Option<BulkOperationState> {
        self.bulk_states.get(&conv).map(|s| s.clone())
    }

    /// Processes one operator turn end to end. A terminal event is always
    /// emitted before the stream closes.
    pub async fn handle(&self, request: RunRequest) -> Result<RunOutcome, OrchestratorError> {
        let conversation = self.pick_conversation(&request).await?;
        let conv = conversation.id;

        let Some(cancel) = self.ports.cancellations.begin(conv) else {
            return Err(OrchestratorError::Busy(conv));
        };
        self.ports.bus.bind(conv, &request.user_id);
        self.ports.bus.emit(conv, events::START, json!({}));
        self.ports.bus.emit(
            conv,
            events::CONVERSATION_ID,
            json!({"conversation_id": conv}),
        );

        let result = self.run_inner(conversation, &request, &cancel).await;
        let outcome = match result {
            Ok(outcome) => {
                match outcome.status {
                    RunStatus::Done => self.ports.bus.emit(
                        conv,
                        events::DONE,
                        json!({"response": outcome.text}),
                    ),
                    RunStatus::Interrupted => self.ports.bus.emit(
                        conv,
                        events::INTERRUPTED,
                        json!({"response": outcome.text}),
                    ),
                    RunStatus::Failed => self.ports.bus.emit(
                        conv,
                        events::ERROR,
                        json!({"message": outcome.text}),
                    ),
                }
                Ok(outcome)
            }
            Err(e) => {
                tracing::error!(conv, "run failed: {e}");
                self.ports
                    .bus
                    .emit(conv, events::ERROR, json!({"message": redacted_message(&e)}));
                Err(e)
            }
        };

        self.ports.cancellations.finish(conv);
        self.ports.bus.close(conv);
        outcome
    }

    async fn pick_conversation(
        &self,
        request: &RunRequest,
    ) -> Result<Conversation, OrchestratorError> {
        match request.conv_id {
            Some(id) => self
                .ports
                .conversations
                .get(id)
                .await
                .map_err(|e| OrchestratorError::Store(e.to_string()))?
                .ok_or_else(|| OrchestratorError::NotFound(format!("conversation {id}"))),
            None => self
                .ports
                .conversations
                .create(&request.user_id, &request.message)
                .await
                .map_err(|e| OrchestratorError::Store(e.to_string())),
        }
    }

    async fn run_inner(
        &self,
        conversation: Conversation,
        request: &RunRequest,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, OrchestratorError> {
        let conv = conversation.id;
        let message = normalize_attachments(request)?;
        self.ports
            .conversations
            .append_message(conv, ChatRole::User, &message)
            .await
            .map_err(|e| OrchestratorError::Store(e.to_string()))?;

        self.emit_processing(conv, "analyzing_request");
        let autonomy = self.resolve_autonomy(conv, &message).await;

        // Bulk detection never blocks the request; it only sets state.
        let verdict = self.ports.input_guard.inspect(&message).await;
        let mut bulk_state = self
            .bulk_states
            .get(&conv)
            .map(|s| s.clone())
            .unwrap_or_default();
        if verdict.is_bulk_operation {
            self.activate_bulk(conv, &message, &verdict, &mut bulk_state)
                .await?;
        }

        self.emit_processing(conv, "building_context");
        let bundle = self.build_context(conv, request, &message, autonomy, &bulk_state).await?;

        let instructions = crate::agent::instructions::render_instructions(
            ORCHESTRATOR_ROLE,
            &bundle,
        );
        let max_turns = self.config.max_turns(bulk_state.active);
        let partial = Arc::new(StdMutex::new(String::new()));
        let mut prompt = message.clone();
        let mut preserved_parts: Vec<String> = Vec::new();

        let final_text = loop {
            if cancel.is_cancelled() {
                return Ok(self
                    .finish_interrupted(conv, &partial, &bulk_state)
                    .await);
            }
            partial.lock().map(|mut p| p.clear()).ok();

            let text = match self
                .drive_model(&instructions, &prompt, &bundle, conv, cancel, max_turns, &partial)
                .await
            {
                Ok(text) => text,
                Err(OrchestratorError::Interrupted) => {
                    return Ok(self
                        .finish_interrupted(conv, &partial, &bulk_state)
                        .await);
                }
                Err(e) => return Err(e),
            };

            match self.ports.output_guard.inspect(&text, &mut bulk_state).await {
                GuardDecision::PassThrough | GuardDecision::Complete => {
                    break assemble(&preserved_parts, &text);
                }
                GuardDecision::Progress { count } => {
                    record_progress(&mut bulk_state, count);
                    let seq = self.append_progress_checkpoint(conv, &bulk_state).await?;
                    bulk_state.last_checkpoint_index = Some(seq);
                    break assemble(&preserved_parts, &text);
                }
                GuardDecision::Tripwire { verdict } => {
                    tracing::warn!(conv, reasoning = %verdict.reasoning, "output guard tripped");
                    let preserved = preserve_text(&text);
                    self.ports.bus.emit(
                        conv,
                        events::AGENT_STATUS,
                        json!({
                            "status": "guardrail_enforced",
                            "retry": bulk_state.retry_count + 1,
                        }),
                    );
                    if bulk_state.retry_count >= self.config.bulk_guard_max_retries {
                        preserved_parts.push(preserved);
                        let notice =
                            termination_notice(&bulk_state, self.config.bulk_guard_max_retries);
                        bulk_state.reset();
                        break format!("{}{notice}", preserved_parts.join("\n\n"));
                    }
                    bulk_state.retry_count += 1;
                    // Each retry is a fresh invocation; the checkpoint-backed
                    // state is the source of truth for remaining work.
                    prompt = compose_continuation_prompt(&preserved, &bulk_state, &message);
                    preserved_parts.push(preserved);
                }
            }
        };

        self.bulk_states.insert(conv, bulk_state);
        self.ports
            .conversations
            .append_message(conv, ChatRole::Assistant, &final_text)
            .await
            .map_err(|e| OrchestratorError::Store(e.to_string()))?;

        Ok(RunOutcome {
            conversation_id: conv,
            status: RunStatus::Done,
            text: final_text,
        })
    }

    async fn finish_interrupted(
        &self,
        conv: ConversationId,
        partial: &Arc<StdMutex<String>>,
        bulk_state: &BulkOperationState,
    ) -> RunOutcome {
        let preserved = partial.lock().map(|p| p.clone()).unwrap_or_default();
        let text = if preserved.trim().is_empty() {
            INTERRUPTED_MESSAGE.to_string()
        } else {
            format!("{preserved}\n\n{INTERRUPTED_MESSAGE}")
        };
        self.bulk_states.insert(conv, bulk_state.clone());
        if let Err(e) = self
            .ports
            .conversations
            .append_message(conv, ChatRole::Assistant, &text)
            .await
        {
            tracing::warn!(conv, "failed to persist interrupted message: {e}");
        }
        RunOutcome {
            conversation_id: conv,
            status: RunStatus::Interrupted,
            text,
        }
    }

    async fn resolve_autonomy(&self, conv: ConversationId, message: &str) -> AutonomyLevel {
        let IntentAnalysis { autonomy, confidence, reasoning } = analyze_intent(message);
        tracing::debug!(conv, ?autonomy, confidence, %reasoning, "intent analysis");

        if let Ok(Some(preference)) = self.ports.conversations.autonomy_preference(conv).await {
            return preference;
        }
        let recent = self
            .ports
            .conversations
            .messages(conv, self.config.max_history_messages)
            .await
            .unwrap_or_default();
        let recommended = recommend_autonomy(&recent);
        lower_of(autonomy, recommended)
    }

    async fn activate_bulk(
        &self,
        conv: ConversationId,
        message: &str,
        verdict: &crate::guardrail::BulkVerdict,
        state: &mut BulkOperationState,
    ) -> Result<(), OrchestratorError> {
        let entities = extract_entities(message);
        let expected = verdict.expected_items.max(entities.len());
        tracing::info!(
            conv,
            expected,
            operation = verdict.operation_type.as_deref().unwrap_or("unknown"),
            "bulk operation detected"
        );

        state.active = true;
        state.conversation_id = Some(conv);
        state.operation_type = verdict.operation_type.clone();
        state.expected_items = expected;
        if !entities.is_empty() {
            state.item_list = entities.clone();
        }
        state.adaptive_context = Some(AdaptiveContext {
            extracted: ExtractedData {
                entities: entities.clone(),
                action: verdict.operation_type.clone(),
            },
            fetched_context: None,
        });

        // Plan one task per item; the data extractor fills the sidecar.
        let operation = verdict
            .operation_type
            .clone()
            .unwrap_or_else(|| "process".to_string());
        let tasks: Vec<TaskItem> = if entities.is_empty() {
            vec![TaskItem {
                index: 0,
                description: format!("{operation}: {expected} items"),
                status: crate::types::TaskStatus::Pending,
                data: None,
            }]
        } else {
            entities
                .iter()
                .enumerate()
                .map(|(index, item)| TaskItem {
                    index,
                    description: format!("{operation} {item}"),
                    status: crate::types::TaskStatus::Pending,
                    data: Some(json!({"item": item})),
                })
                .collect()
        };
        self.ports.task_manager.replace_plan(conv, tasks).await?;

        // Resuming: the latest checkpoint pre-seeds completed items.
        if let Some(checkpoint) = self.ports.checkpoints.latest_checkpoint(conv).await? {
            state.last_checkpoint_index = Some(checkpoint.seq);
            state.record_completed(checkpoint.completed.iter().cloned());
        }
        Ok(())
    }

    async fn build_context(
        &self,
        conv: ConversationId,
        request: &RunRequest,
        message: &str,
        autonomy: AutonomyLevel,
        bulk_state: &BulkOperationState,
    ) -> Result<ContextBundle, OrchestratorError> {
        let history = self
            .ports
            .conversations
            .messages(conv, self.config.max_history_messages)
            .await
            .map_err(|e| OrchestratorError::Store(e.to_string()))?;
        let current_tasks = self.ports.checkpoints.read_plan(conv).await?;

        let mut build = BuildRequest::new(message, conv, request.user_id.clone(), autonomy);
        build.force_full = bulk_state.active;
        build.history = history;
        build.current_tasks = current_tasks;
        build.adaptive = bulk_state.adaptive_context.clone();
        self.ports.context_builder.build(build).await
    }

    /// One model-driven tool loop up to the turn cap. Streams deltas onto
    /// the bus and accumulates them in `partial` for abort recovery.
    #[allow(clippy::too_many_arguments)]
    async fn drive_model(
        &self,
        instructions: &str,
        prompt: &str,
        bundle: &ContextBundle,
        conv: ConversationId,
        cancel: &CancellationToken,
        max_turns: usize,
        partial: &Arc<StdMutex<String>>,
    ) -> Result<String, OrchestratorError> {
        let mut messages = vec![
            PromptMessage::System(instructions.to_string()),
            PromptMessage::User(prompt.to_string()),
        ];
        let mut definitions = self.ports.tools.definitions();
        definitions.extend(spawn_tool_definitions());

        for _turn in 0..max_turns {
            if cancel.is_cancelled() {
                return Err(OrchestratorError::Interrupted);
            }

            let (delta_tx, mut delta_rx) = mpsc::channel::<String>(64);
            let bus = self.ports.bus.clone();
            let partial_sink = partial.clone();
            let forwarder = tokio::spawn(async move {
                while let Some(delta) = delta_rx.recv().await {
                    if let Ok(mut p) = partial_sink.lock() {
                        p.push_str(&delta);
                    }
                    bus.emit(conv, events::ASSISTANT_DELTA, json!({"delta": delta}));
                }
            });

            let request = ModelRequest::new(messages.clone()).with_tools(definitions.clone());
            let turn = self
                .ports
                .model
                .complete_stream(request, delta_tx, cancel)
                .await;
            let _ = forwarder.await;
            let turn = turn?;

            match turn {
                ModelTurn::Text(text) => return Ok(text),
                ModelTurn::ToolCalls { content, calls } => {
                    messages.push(PromptMessage::Assistant {
                        content,
                        tool_calls: calls.clone(),
                    });
                    // Independent calls in one turn run concurrently; results
                    // return to the model in request order.
                    let results = join_all(
                        calls
                            .iter()
                            .map(|call| self.dispatch_call(bundle, conv, call, cancel)),
                    )
                    .await;

                    let mut interrupted = false;
                    for (call, result) in calls.iter().zip(results) {
                        let content = match result {
                            Ok(content) => content,
                            Err(OrchestratorError::Interrupted) => {
                                interrupted = true;
                                INTERRUPTED_MESSAGE.to_string()
                            }
                            Err(e) => json!({"error": e.to_string()}).to_string(),
                        };
                        messages.push(PromptMessage::ToolResult {
                            tool_call_id: call.id.clone(),
                            tool_name: call.name.clone(),
                            content,
                        });
                    }
                    if interrupted {
                        return Err(OrchestratorError::Interrupted);
                    }
                }
            }
        }
        Err(OrchestratorError::Model(format!(
            "run exceeded the turn cap of {max_turns}"
        )))
    }

    /// Routes one model call: sub-agent spawn or registered tool.
    async fn dispatch_call(
        &self,
        bundle: &ContextBundle,
        conv: ConversationId,
        call: &ToolInvocation,
        cancel: &CancellationToken,
    ) -> Result<String, OrchestratorError> {
        let args: Value = serde_json::from_str(&call.arguments).unwrap_or(Value::Null);
        match call.name.as_str() {
            SPAWN_BASH | SPAWN_ENGINEER => self.spawn_loop_agent(bundle, conv, &call.name, &args, cancel).await,
            SPAWN_PARALLEL => self.spawn_parallel(bundle, conv, &args, cancel).await,
            _ => self.invoke_tool(conv, call, args, cancel).await,
        }
    }

    async fn invoke_tool(
        &self,
        conv: ConversationId,
        call: &ToolInvocation,
        args: Value,
        cancel: &CancellationToken,
    ) -> Result<String, OrchestratorError> {
        self.ports.bus.emit(
            conv,
            events::TOOL_CALL,
            json!({"tool": call.name, "args": args}),
        );

        // Cached result first; the hit carries its age so the model can
        // decide freshness.
        if let Ok(Some(hit)) = self.ports.tools.cache().lookup(conv, &call.name, &args).await {
            tracing::debug!(tool = %call.name, age = hit.age_seconds, "tool cache hit");
            return Ok(json!({
                "cached": true,
                "age_seconds": hit.age_seconds,
                "result": hit.result,
            })
            .to_string());
        }

        match self.ports.tools.invoke(conv, &call.name, args, cancel).await {
            Ok(value) => Ok(value.to_string()),
            Err(OrchestratorError::Interrupted) => Err(OrchestratorError::Interrupted),
            // Tool failures go back to the model; they never kill the run.
            Err(e) => Ok(json!({"error": e.to_string()}).to_string()),
        }
    }

    async fn spawn_loop_agent(
        &self,
        bundle: &ContextBundle,
        conv: ConversationId,
        name: &str,
        args: &Value,
        cancel: &CancellationToken,
    ) -> Result<String, OrchestratorError> {
        let task = args
            .get("task")
            .and_then(|v| v.as_str())
            .unwrap_or(&bundle.task)
            .to_string();
        self.emit_processing(conv, &format!("dispatching {name}"));

        let agent = if name == SPAWN_BASH {
            self.ports.factory.bash_agent(bundle)
        } else {
            self.ports.factory.engineering_agent(bundle)
        };
        let outcome = agent.run(&task, cancel).await;
        Ok(json!({
            "status": outcome.status,
            "output": outcome.output,
        })
        .to_string())
    }

    async fn spawn_parallel(
        &self,
        bundle: &ContextBundle,
        conv: ConversationId,
        args: &Value,
        cancel: &CancellationToken,
    ) -> Result<String, OrchestratorError> {
        let tool_name = args.get("tool").and_then(|v| v.as_str()).unwrap_or_default();
        let Some(operation) = self.ports.tools.get(tool_name) else {
            return Ok(json!({"error": format!("unknown per-item tool '{tool_name}'")}).to_string());
        };
        let items = args
            .get("items")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        let dry_run = args.get("dry_run").and_then(|v| v.as_bool()).unwrap_or(false);

        self.emit_processing(conv, "dispatching parallel executor");
        let mut policy = BatchPolicy::from_config(&self.config);
        policy.dry_run = dry_run;
        let executor = self.ports.factory.parallel_executor(bundle, operation, Some(policy));

        match executor.run(items, cancel).await {
            Ok(results) => {
                let status = if results.iter().any(|r| r.status == ItemStatus::Interrupted) {
                    AgentStatus::Interrupted
                } else {
                    AgentStatus::Completed
                };
                Ok(json!({"status": status, "results": results}).to_string())
            }
            // Batch-size rejections go back to the model so it can re-route.
            Err(e @ OrchestratorError::TooFewItems { .. })
            | Err(e @ OrchestratorError::TooManyItems { .. }) => {
                Ok(json!({"error": e.to_string()}).to_string())
            }
            Err(e) => Err(e),
        }
    }

    async fn append_progress_checkpoint(
        &self,
        conv: ConversationId,
        state: &BulkOperationState,
    ) -> Result<u64, OrchestratorError> {
        let completed: Vec<String> = state.completed_items.iter().cloned().collect();
        let checkpoint = Checkpoint {
            seq: 0,
            timestamp: Utc::now(),
            last_item: completed.last().cloned(),
            stats: CheckpointStats {
                completed: completed.len(),
                failed: 0,
                remaining: state.expected_items.saturating_sub(completed.len()),
            },
            completed,
            failed: Vec::new(),
            bulk_operation: Some(BulkCheckpointInfo {
                operation_type: state
                    .operation_type
                    .clone()
                    .unwrap_or_else(|| "unknown".to_string()),
                total_expected: state.expected_items,
                adaptive_context: crate::types::AdaptiveContextInfo {
                    token_count: state
                        .adaptive_context
                        .as_ref()
                        .map(|a| serde_json::to_string(a).map(|s| s.len()).unwrap_or(0))
                        .unwrap_or(0),
                    has_extracted_data: state.adaptive_context.is_some(),
                },
            }),
        };
        self.ports.checkpoints.append_checkpoint(conv, checkpoint).await
    }

    fn emit_processing(&self, conv: ConversationId, status: &str) {
        self.ports
            .bus
            .emit(conv, events::AGENT_PROCESSING, json!({"status": status}));
    }
}

/// Progress counts map onto the item list in order; completed items only
/// ever grow until the state resets.
fn record_progress(state: &mut BulkOperationState, count: usize) {
    let items: Vec<String> = state.item_list.iter().take(count).cloned().collect();
    state.record_completed(items);
}

fn lower_of(a: AutonomyLevel, b: AutonomyLevel) -> AutonomyLevel {
    fn rank(level: AutonomyLevel) -> u8 {
        match level {
            AutonomyLevel::High => 0,
            AutonomyLevel::Medium => 1,
            AutonomyLevel::Low => 2,
        }
    }
    if rank(a) >= rank(b) {
        a
    } else {
        b
    }
}

fn assemble(preserved: &[String], text: &str) -> String {
    if preserved.is_empty() {
        text.to_string()
    } else {
        format!("{}\n\n{text}", preserved.join("\n\n"))
    }
}

/// Stack traces never reach the client; they stay in the logs.
fn redacted_message(error: &OrchestratorError) -> String {
    match error {
        OrchestratorError::Busy(conv) => format!("conversation {conv} is busy"),
        OrchestratorError::NotFound(what) => format!("not found: {what}"),
        OrchestratorError::Validation(reason) => reason.clone(),
        _ => "internal error".to_string(),
    }
}

/// Decoded payload ceiling for inline images.
const MAX_IMAGE_BYTES: usize = 20 * 1024 * 1024;
/// Payload ceiling for file attachments (text or decoded binary).
const MAX_ATTACHMENT_BYTES: usize = 10 * 1024 * 1024;
const MAX_URL_LEN: usize = 2048;

fn decode_base64_payload(payload: &str, what: &str) -> Result<usize, OrchestratorError> {
    use base64::Engine;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .map_err(|e| {
            OrchestratorError::Validation(format!("{what}: payload is not valid base64: {e}"))
        })?;
    Ok(bytes.len())
}

fn validate_image(image: &ImageAttachment) -> Result<(), OrchestratorError> {
    match image {
        ImageAttachment::DataUrl { data } => {
            // Accept a full data URL or a bare base64 payload.
            let payload = if let Some(rest) = data.strip_prefix("data:") {
                let (media_type, payload) = rest.split_once(";base64,").ok_or_else(|| {
                    OrchestratorError::Validation(
                        "image data URL must carry a base64 payload".to_string(),
                    )
                })?;
                if !media_type.starts_with("image/") {
                    return Err(OrchestratorError::Validation(format!(
                        "image data URL has non-image media type '{media_type}'"
                    )));
                }
                payload
            } else {
                data.as_str()
            };
            if payload.trim().is_empty() {
                return Err(OrchestratorError::Validation(
                    "image attachment payload is empty".to_string(),
                ));
            }
            let decoded = decode_base64_payload(payload, "image attachment")?;
            if decoded > MAX_IMAGE_BYTES {
                return Err(OrchestratorError::Validation(format!(
                    "image attachment is {decoded} bytes; the limit is {MAX_IMAGE_BYTES}"
                )));
            }
            Ok(())
        }
        ImageAttachment::Url { url } => {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(OrchestratorError::Validation(
                    "image URL must use http or https".to_string(),
                ));
            }
            if url.len() > MAX_URL_LEN
                || url.chars().any(|c| c.is_whitespace() || c.is_control())
            {
                return Err(OrchestratorError::Validation(
                    "image URL is malformed".to_string(),
                ));
            }
            Ok(())
        }
    }
}

fn validate_file(file: &FileAttachment) -> Result<(), OrchestratorError> {
    if file.name.trim().is_empty() {
        return Err(OrchestratorError::Validation(
            "file attachment is missing a name".to_string(),
        ));
    }
    match file.encoding {
        FileEncoding::Text => {
            if file.data.is_some() {
                return Err(OrchestratorError::Validation(format!(
                    "text file '{}' carries a binary payload; use encoding \"binary\"",
                    file.name
                )));
            }
            let content = file.content.as_ref().ok_or_else(|| {
                OrchestratorError::Validation(format!(
                    "text file '{}' is missing content",
                    file.name
                ))
            })?;
            if content.len() > MAX_ATTACHMENT_BYTES {
                return Err(OrchestratorError::Validation(format!(
                    "file '{}' is {} bytes; the limit is {MAX_ATTACHMENT_BYTES}",
                    file.name,
                    content.len()
                )));
            }
        }
        FileEncoding::Binary => {
            if file.content.is_some() {
                return Err(OrchestratorError::Validation(format!(
                    "binary file '{}' carries inline text; use encoding \"text\"",
                    file.name
                )));
            }
            let data = file.data.as_ref().ok_or_else(|| {
                OrchestratorError::Validation(format!(
                    "binary file '{}' is missing data",
                    file.name
                ))
            })?;
            let decoded =
                decode_base64_payload(data, &format!("binary file '{}'", file.name))?;
            if decoded > MAX_ATTACHMENT_BYTES {
                return Err(OrchestratorError::Validation(format!(
                    "file '{}' is {decoded} bytes; the limit is {MAX_ATTACHMENT_BYTES}",
                    file.name
                )));
            }
        }
    }
    Ok(())
}

/// Validates attachments and folds them into the user message. Runs before
/// intent analysis; a bad attachment fails the run with a validation error.
fn normalize_attachments(request: &RunRequest) -> Result<String, OrchestratorError> {
    let mut message = request.message.clone();
    if let Some(image) = &request.image {
        validate_image(image)?;
        match image {
            ImageAttachment::Url { url } => {
                message.push_str(&format!("\n\n[attached image: {url}]"));
            }
            ImageAttachment::DataUrl { .. } => {
                message.push_str("\n\n[attached image: inline data]");
            }
        }
    }
    if let Some(file) = &request.file {
        validate_file(file)?;
        match (file.encoding, &file.content) {
            (FileEncoding::Text, Some(content)) => {
                message.push_str(&format!(
                    "\n\n[attached file {} ({})]\n{content}",
                    file.name, file.mime_type
                ));
            }
            _ => {
                message.push_str(&format!(
                    "\n\n[attached binary file {} ({})]",
                    file.name, file.mime_type
                ));
            }
        }
    }
    Ok(message)
}

fn spawn_tool_definitions() -> Vec<ChatCompletionTool> {
    fn function(name: &str, description: &str, parameters: Value) -> ChatCompletionTool {
        ChatCompletionTool {
            r#type: ChatCompletionToolType::Function,
            function: FunctionObject {
                name: name.to_string(),
                description: Some(description.to_string()),
                parameters: Some(parameters),
                strict: None,
            },
        }
    }
    vec![
        function(
            SPAWN_BASH,
            "Delegates a file/git/system task to the bash agent.",
            json!({
                "type": "object",
                "properties": {
                    "task": {"type": "string", "description": "What the agent should accomplish."}
                },
                "required": ["task"]
            }),
        ),
        function(
            SPAWN_ENGINEER,
            "Delegates tool creation or refactoring to the software engineering agent.",
            json!({
                "type": "object",
                "properties": {
                    "task": {"type": "string", "description": "What the agent should build or change."}
                },
                "required": ["task"]
            }),
        ),
        function(
            SPAWN_PARALLEL,
            "Applies one registered tool to each item of a 10-50 item batch with bounded concurrency.",
            json!({
                "type": "object",
                "properties": {
                    "tool": {"type": "string", "description": "Registered tool to apply per item."},
                    "items": {
                        "type": "array",
                        "items": {"type": "object"},
                        "description": "Per-item argument objects."
                    },
                    "dry_run": {"type": "boolean", "description": "Validate without executing.", "nullable": true, "default": null}
                },
                "required": ["tool", "items"]
            }),
        ),
    ]
}

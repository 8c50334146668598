//! Per-conversation SSE fan-out.
//!
//! The bus pre-encodes `event:`/`data:` frames and hands them to per-user
//! sinks. Writes are fire-and-forget: a slow or disconnected client drops
//! frames, it never blocks the supervisor. Intercepted backend log lines
//! travel through a second, independently bounded channel so they cannot
//! starve model token frames.

use std::fmt::Write as _;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing::Subscriber;
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

use crate::types::ConversationId;

/// Event names emitted by the runtime. Clients tolerate unknown names.
pub mod events {
    pub const START: &str = "start";
    pub const CONVERSATION_ID: &str = "conversation_id";
    pub const AGENT_PROCESSING: &str = "agent_processing";
    pub const AGENT_STATUS: &str = "agent_status";
    pub const ASSISTANT_DELTA: &str = "assistant_delta";
    pub const TOOL_CALL: &str = "tool_call";
    pub const AGENT_TOOL_CALL: &str = "agent_tool_call";
    pub const TASK_PLAN_CREATED: &str = "task_plan_created";
    pub const TASK_SUMMARY: &str = "task_summary";
    pub const INTERRUPTED: &str = "interrupted";
    pub const ERROR: &str = "error";
    pub const DONE: &str = "done";
    pub const LOG: &str = "log";
}

#[derive(Debug, Clone, PartialEq)]
pub struct SseFrame {
    pub event: String,
    pub data: Value,
}

impl SseFrame {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    /// Wire form: `event: <name>\ndata: <json>\n\n`.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        let _ = write!(out, "event: {}\n", self.event);
        let _ = write!(out, "data: {}\n\n", self.data);
        out
    }
}

struct Sink {
    frames: mpsc::Sender<SseFrame>,
    logs: mpsc::Sender<SseFrame>,
}

pub struct Subscription {
    pub frames: mpsc::Receiver<SseFrame>,
    pub logs: mpsc::Receiver<SseFrame>,
}

const DEFAULT_FRAME_CAPACITY: usize = 1024;
const DEFAULT_LOG_CAPACITY: usize = 256;

#[derive(Default)]
pub struct EventBus {
    sinks: DashMap<String, Sink>,
    routes: DashMap<ConversationId, String>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the sink for a user and returns its
    /// receivers. The latest subscriber wins.
    pub fn subscribe(&self, user_id: &str) -> Subscription {
        let (frame_tx, frame_rx) = mpsc::channel(DEFAULT_FRAME_CAPACITY);
        let (log_tx, log_rx) = mpsc::channel(DEFAULT_LOG_CAPACITY);
        self.sinks.insert(
            user_id.to_string(),
            Sink {
                frames: frame_tx,
                logs: log_tx,
            },
        );
        Subscription {
            frames: frame_rx,
            logs: log_rx,
        }
    }

    pub fn unsubscribe(&self, user_id: &str) {
        self.sinks.remove(user_id);
    }

    /// Routes a conversation's events to a user's sink.
    pub fn bind(&self, conv: ConversationId, user_id: &str) {
        self.routes.insert(conv, user_id.to_string());
    }

    /// Fire-and-forget emit. Frames for full or missing sinks are dropped
    /// silently.
    pub fn emit(&self, conv: ConversationId, event: &str, data: Value) {
        let Some(user_id) = self.routes.get(&conv).map(|u| u.clone()) else {
            return;
        };
        self.emit_to_user(&user_id, event, data);
    }

    pub fn emit_to_user(&self, user_id: &str, event: &str, data: Value) {
        if let Some(sink) = self.sinks.get(user_id) {
            let _ = sink.frames.try_send(SseFrame::new(event, data));
        }
    }

    /// Intercepted backend log line; independent channel from model frames.
    pub fn emit_log(&self, user_id: &str, line: String) {
        if let Some(sink) = self.sinks.get(user_id) {
            let _ = sink.logs.try_send(SseFrame::new(events::LOG, json!({ "line": line })));
        }
    }

    /// Drops the conversation's routing entry. Terminal frames must already
    /// have been emitted.
    pub fn close(&self, conv: ConversationId) {
        self.routes.remove(&conv);
    }
}

/// `tracing` layer routing records tagged with a `user` field onto the bus.
pub struct UserLogLayer {
    bus: Arc<EventBus>,
}

impl UserLogLayer {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }
}

#[derive(Default)]
struct LogVisitor {
    user: Option<String>,
    message: String,
}

impl Visit for LogVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "user" {
            self.user = Some(value.to_string());
        } else if field.name() == "message" {
            self.message = value.to_string();
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else if field.name() == "user" {
            self.user = Some(format!("{value:?}").trim_matches('"').to_string());
        }
    }
}

impl<S: Subscriber> Layer<S> for UserLogLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = LogVisitor::default();
        event.record(&mut visitor);
        if let Some(user) = visitor.user {
            let metadata = event.metadata();
            let line = format!("{} {}: {}", metadata.level(), metadata.target(), visitor.message);
            self.bus.emit_log(&user, line);
        }
    }
}

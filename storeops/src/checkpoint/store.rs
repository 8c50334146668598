use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::plan::{parse_plan, render_plan, render_task, tasks_of, PlanLine};
use crate::error::OrchestratorError;
use crate::types::{Checkpoint, ConversationId, TaskItem, TaskStatus};

/// Structured sidecar written next to the plan file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDataFile {
    #[serde(rename = "conversationId")]
    pub conversation_id: String,
    pub created: String,
    pub tasks: Vec<TaskItem>,
}

/// Durable per-conversation plan, sidecar, and checkpoint log.
///
/// Writes go through a temp file plus rename so a crash mid-write never
/// leaves a torn plan. One async writer lock per conversation; readers see
/// last-committed state.
pub struct CheckpointStore {
    root: PathBuf,
    locks: Mutex<HashMap<ConversationId, Arc<Mutex<()>>>>,
    latest_seq: Mutex<HashMap<ConversationId, u64>>,
}

impl CheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            locks: Mutex::new(HashMap::new()),
            latest_seq: Mutex::new(HashMap::new()),
        })
    }

    fn plan_path(&self, conv: ConversationId) -> PathBuf {
        self.root.join(format!("TODO-{conv}.md"))
    }

    fn sidecar_path(&self, conv: ConversationId) -> PathBuf {
        self.root.join(format!("TODO-{conv}-data.json"))
    }

    fn checkpoint_path(&self, conv: ConversationId) -> PathBuf {
        self.root.join(format!("TODO-{conv}-checkpoints.jsonl"))
    }

    async fn writer_lock(&self, conv: ConversationId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(conv).or_default().clone()
    }

    async fn write_atomic(&self, path: &Path, contents: &str) -> Result<(), OrchestratorError> {
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, contents)
            .await
            .map_err(|e| OrchestratorError::Store(format!("write {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| OrchestratorError::Store(format!("rename {}: {e}", path.display())))
    }

    /// Atomically replaces the whole plan (and sidecar) for a conversation.
    pub async fn write_plan(
        &self,
        conv: ConversationId,
        tasks: &[TaskItem],
    ) -> Result<(), OrchestratorError> {
        let lock = self.writer_lock(conv).await;
        let _guard = lock.lock().await;

        let lines: Vec<PlanLine> = tasks
            .iter()
            .enumerate()
            .map(|(index, task)| {
                PlanLine::Task(TaskItem {
                    index,
                    ..task.clone()
                })
            })
            .collect();
        self.write_atomic(&self.plan_path(conv), &render_plan(&lines))
            .await?;

        let sidecar = TaskDataFile {
            conversation_id: conv.to_string(),
            created: Utc::now().to_rfc3339(),
            tasks: lines
                .iter()
                .filter_map(|line| match line {
                    PlanLine::Task(task) => Some(task.clone()),
                    PlanLine::Other(_) => None,
                })
                .collect(),
        };
        let json = serde_json::to_string_pretty(&sidecar)
            .map_err(|e| OrchestratorError::Store(e.to_string()))?;
        self.write_atomic(&self.sidecar_path(conv), &json).await
    }

    /// Parses the plan checklist. A missing file is an empty plan. Sidecar
    /// `data` is merged in by index when the sidecar is readable; a corrupt
    /// sidecar degrades to plan-only results.
    pub async fn read_plan(&self, conv: ConversationId) -> Result<Vec<TaskItem>, OrchestratorError> {
        let path = self.plan_path(conv);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(OrchestratorError::Store(format!(
                    "read {}: {e}",
                    path.display()
                )))
            }
        };
        let mut tasks = tasks_of(&parse_plan(&contents));

        match self.read_sidecar(conv).await {
            Ok(Some(sidecar)) => {
                for task in tasks.iter_mut() {
                    if let Some(entry) = sidecar.tasks.get(task.index) {
                        task.data = entry.data.clone();
                    }
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(conv, "sidecar unreadable, using plan file only: {e}");
            }
        }
        Ok(tasks)
    }

    pub async fn read_sidecar(
        &self,
        conv: ConversationId,
    ) -> Result<Option<TaskDataFile>, OrchestratorError> {
        let path = self.sidecar_path(conv);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(OrchestratorError::Store(format!(
                    "read {}: {e}",
                    path.display()
                )))
            }
        };
        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|e| OrchestratorError::Store(format!("parse {}: {e}", path.display())))
    }

    /// Rewrites the status of a single task, preserving every other line.
    /// Applying the same update twice is a no-op.
    pub async fn update_status(
        &self,
        conv: ConversationId,
        index: usize,
        status: TaskStatus,
    ) -> Result<(), OrchestratorError> {
        let lock = self.writer_lock(conv).await;
        let _guard = lock.lock().await;

        let path = self.plan_path(conv);
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| OrchestratorError::NotFound(format!("plan for {conv}: {e}")))?;
        let mut lines = parse_plan(&contents);
        let mut found = false;
        for line in lines.iter_mut() {
            if let PlanLine::Task(task) = line {
                if task.index == index {
                    task.status = status;
                    found = true;
                    break;
                }
            }
        }
        if !found {
            return Err(OrchestratorError::NotFound(format!(
                "task index {index} out of range for conversation {conv}"
            )));
        }
        self.write_atomic(&path, &render_plan(&lines)).await?;

        // Keep the sidecar's index space in step with the plan file.
        if let Ok(Some(mut sidecar)) = self.read_sidecar(conv).await {
            if let Some(entry) = sidecar.tasks.get_mut(index) {
                entry.status = status;
                if let Ok(json) = serde_json::to_string_pretty(&sidecar) {
                    self.write_atomic(&self.sidecar_path(conv), &json).await?;
                }
            }
        }
        Ok(())
    }

    /// Updates the structured `data` of one task in the sidecar only.
    pub async fn update_task_data(
        &self,
        conv: ConversationId,
        index: usize,
        data: Value,
    ) -> Result<(), OrchestratorError> {
        let lock = self.writer_lock(conv).await;
        let _guard = lock.lock().await;

        let mut sidecar = match self.read_sidecar(conv).await {
            Ok(Some(sidecar)) => sidecar,
            _ => {
                // Rebuild from the plan file when missing or corrupt.
                let tasks = self.read_plan(conv).await?;
                TaskDataFile {
                    conversation_id: conv.to_string(),
                    created: Utc::now().to_rfc3339(),
                    tasks,
                }
            }
        };
        let entry = sidecar.tasks.get_mut(index).ok_or_else(|| {
            OrchestratorError::NotFound(format!(
                "task index {index} out of range for conversation {conv}"
            ))
        })?;
        entry.data = Some(data);
        let json = serde_json::to_string_pretty(&sidecar)
            .map_err(|e| OrchestratorError::Store(e.to_string()))?;
        self.write_atomic(&self.sidecar_path(conv), &json).await
    }

    /// Appends a checkpoint with the next monotonic seq; the record is
    /// flushed before the call returns.
    pub async fn append_checkpoint(
        &self,
        conv: ConversationId,
        mut checkpoint: Checkpoint,
    ) -> Result<u64, OrchestratorError> {
        let lock = self.writer_lock(conv).await;
        let _guard = lock.lock().await;

        let seq = {
            let mut latest = self.latest_seq.lock().await;
            let next = match latest.get(&conv) {
                Some(seq) => seq + 1,
                None => match self.read_latest_checkpoint(conv).await? {
                    Some(previous) => previous.seq + 1,
                    None => 1,
                },
            };
            latest.insert(conv, next);
            next
        };
        checkpoint.seq = seq;

        let line = serde_json::to_string(&checkpoint)
            .map_err(|e| OrchestratorError::Store(e.to_string()))?;
        let path = self.checkpoint_path(conv);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| OrchestratorError::Store(format!("open {}: {e}", path.display())))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| OrchestratorError::Store(e.to_string()))?;
        file.write_all(b"\n")
            .await
            .map_err(|e| OrchestratorError::Store(e.to_string()))?;
        file.sync_data()
            .await
            .map_err(|e| OrchestratorError::Store(e.to_string()))?;
        Ok(seq)
    }

    pub async fn latest_checkpoint(
        &self,
        conv: ConversationId,
    ) -> Result<Option<Checkpoint>, OrchestratorError> {
        self.read_latest_checkpoint(conv).await
    }

    async fn read_latest_checkpoint(
        &self,
        conv: ConversationId,
    ) -> Result<Option<Checkpoint>, OrchestratorError> {
        let path = self.checkpoint_path(conv);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(OrchestratorError::Store(format!(
                    "read {}: {e}",
                    path.display()
                )))
            }
        };
        let mut latest = None;
        for line in contents.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Checkpoint>(line) {
                Ok(checkpoint) => latest = Some(checkpoint),
                Err(e) => tracing::warn!(conv, "skipping unreadable checkpoint line: {e}"),
            }
        }
        Ok(latest)
    }
}

/// Renders a plan for display in prompts; used by continuation composition.
pub fn render_task_summary(tasks: &[TaskItem]) -> String {
    tasks.iter().map(render_task).collect::<Vec<_>>().join("\n")
}

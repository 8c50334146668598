//! Plan file (`TODO-{conv_id}.md`) parsing and rendering.
//!
//! Three line shapes are recognized; everything else is preserved verbatim on
//! rewrite:
//!
//! ```text
//! - [ ] <description>
//! - [x] <description>
//! - [ ] 🔄 <description>
//! ```

use crate::types::{TaskItem, TaskStatus};

pub const IN_PROGRESS_MARKER: &str = "🔄";

/// A physical line of the plan file. Task lines carry their parsed item;
/// unknown lines survive rewrites untouched.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanLine {
    Task(TaskItem),
    Other(String),
}

pub fn parse_line(line: &str, next_index: usize) -> Option<TaskItem> {
    let rest = line
        .strip_prefix("- [ ] ")
        .map(|rest| (false, rest))
        .or_else(|| line.strip_prefix("- [x] ").map(|rest| (true, rest)));
    let (checked, rest) = rest?;

    let (status, description) = if checked {
        (TaskStatus::Completed, rest)
    } else if let Some(desc) = rest.strip_prefix(IN_PROGRESS_MARKER) {
        (TaskStatus::InProgress, desc.trim_start())
    } else {
        (TaskStatus::Pending, rest)
    };

    Some(TaskItem {
        index: next_index,
        description: description.trim_end().to_string(),
        status,
        data: None,
    })
}

pub fn parse_plan(contents: &str) -> Vec<PlanLine> {
    let mut lines = Vec::new();
    let mut next_index = 0;
    for raw in contents.lines() {
        match parse_line(raw, next_index) {
            Some(task) => {
                next_index += 1;
                lines.push(PlanLine::Task(task));
            }
            None => lines.push(PlanLine::Other(raw.to_string())),
        }
    }
    lines
}

pub fn tasks_of(lines: &[PlanLine]) -> Vec<TaskItem> {
    lines
        .iter()
        .filter_map(|line| match line {
            PlanLine::Task(task) => Some(task.clone()),
            PlanLine::Other(_) => None,
        })
        .collect()
}

pub fn render_task(task: &TaskItem) -> String {
    match task.status {
        TaskStatus::Pending => format!("- [ ] {}", task.description),
        TaskStatus::InProgress => {
            format!("- [ ] {IN_PROGRESS_MARKER} {}", task.description)
        }
        TaskStatus::Completed => format!("- [x] {}", task.description),
    }
}

pub fn render_plan(lines: &[PlanLine]) -> String {
    let mut out = String::new();
    for line in lines {
        match line {
            PlanLine::Task(task) => out.push_str(&render_task(task)),
            PlanLine::Other(raw) => out.push_str(raw),
        }
        out.push('\n');
    }
    out
}

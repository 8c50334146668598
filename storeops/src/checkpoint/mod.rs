pub mod plan;
mod store;

pub use plan::{parse_plan, render_plan, PlanLine, IN_PROGRESS_MARKER};
pub use store::{render_task_summary, CheckpointStore, TaskDataFile};

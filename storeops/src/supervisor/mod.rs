//! The run supervisor: one end-to-end processing of a single operator
//! message, from intent analysis through guarded completion.

mod cancel;
mod continuation;
mod intent;
mod run;

pub use cancel::CancellationRegistry;
pub use continuation::{
    compose_continuation_prompt, preserve_text, termination_notice, PRESERVED_TEXT_CAP,
};
pub use intent::{analyze_intent, IntentAnalysis};
pub use run::{
    RunOutcome, RunRequest, RunStatus, Supervisor, SupervisorPorts, SPAWN_BASH, SPAWN_ENGINEER,
    SPAWN_PARALLEL,
};

use std::sync::Arc;

use super::{GuardModel, RuleBasedGuard, StopVerdict};
use crate::types::BulkOperationState;

/// What the supervisor should do with a candidate assistant turn.
#[derive(Debug, Clone, PartialEq)]
pub enum GuardDecision {
    /// No bulk operation active, or the turn is honest progress.
    PassThrough,
    /// The bulk operation finished; clear state and pass the text through.
    Complete,
    /// Progress was made this turn; record it and checkpoint.
    Progress { count: usize },
    /// Announce-and-stop detected with no actual work behind it.
    Tripwire { verdict: StopVerdict },
}

pub struct OutputGuard {
    model: Arc<dyn GuardModel>,
    fallback: RuleBasedGuard,
}

impl OutputGuard {
    pub fn new(model: Arc<dyn GuardModel>) -> Self {
        Self {
            model,
            fallback: RuleBasedGuard::new(),
        }
    }

    pub fn rule_based() -> Self {
        Self::new(Arc::new(RuleBasedGuard::new()))
    }

    /// Classifies one assistant turn. Mutates `state` for progress and
    /// completion; the caller handles the tripwire.
    pub async fn inspect(&self, output: &str, state: &mut BulkOperationState) -> GuardDecision {
        if !state.active {
            return GuardDecision::PassThrough;
        }

        let verdict = match self.model.classify_stop(output, state).await {
            Ok(verdict) => verdict,
            Err(e) => {
                tracing::warn!("stop classifier failed, using rule fallback: {e}");
                match self.fallback.classify_stop(output, state).await {
                    Ok(verdict) => verdict,
                    Err(_) => return GuardDecision::PassThrough,
                }
            }
        };

        if verdict.is_complete {
            tracing::info!(
                operation = state.operation_type.as_deref().unwrap_or("unknown"),
                "bulk operation complete"
            );
            state.reset();
            return GuardDecision::Complete;
        }
        if verdict.is_announce_and_stop && !verdict.has_actual_work {
            return GuardDecision::Tripwire { verdict };
        }
        GuardDecision::Progress {
            count: verdict.progress_count,
        }
    }
}

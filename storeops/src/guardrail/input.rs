use std::sync::Arc;

use super::{BulkVerdict, GuardModel, RuleBasedGuard};

/// Wraps the bulk classifier with the keyword fallback. Inspection only sets
/// state; it never blocks a request.
pub struct InputGuard {
    model: Arc<dyn GuardModel>,
    fallback: RuleBasedGuard,
}

impl InputGuard {
    pub fn new(model: Arc<dyn GuardModel>) -> Self {
        Self {
            model,
            fallback: RuleBasedGuard::new(),
        }
    }

    pub fn rule_based() -> Self {
        Self::new(Arc::new(RuleBasedGuard::new()))
    }

    pub async fn inspect(&self, request: &str) -> BulkVerdict {
        match self.model.classify_bulk(request).await {
            Ok(verdict) => verdict,
            Err(e) => {
                tracing::warn!("bulk classifier failed, using keyword heuristic: {e}");
                self.fallback
                    .classify_bulk(request)
                    .await
                    .unwrap_or_else(|_| BulkVerdict::not_bulk("fallback heuristic failed"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BulkOperationState;

    struct FailingGuard;

    #[async_trait::async_trait]
    impl GuardModel for FailingGuard {
        async fn classify_bulk(&self, _request: &str) -> anyhow::Result<BulkVerdict> {
            anyhow::bail!("classifier unavailable")
        }
        async fn classify_stop(
            &self,
            _output: &str,
            _state: &BulkOperationState,
        ) -> anyhow::Result<super::super::StopVerdict> {
            anyhow::bail!("classifier unavailable")
        }
    }

    #[tokio::test]
    async fn classifier_failure_falls_back_to_keywords() {
        let guard = InputGuard::new(Arc::new(FailingGuard));
        let verdict = guard.inspect("please continue the bulk cleanup").await;
        assert!(verdict.is_bulk_operation);

        let verdict = guard.inspect("what is the price of mexican-altura?").await;
        assert!(!verdict.is_bulk_operation);
    }
}

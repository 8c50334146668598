//! Deterministic guard classifier.
//!
//! Matches the documented fallback keywords so guardrail behavior is
//! testable without a model. Also the production fallback whenever the model
//! classifier errors.

use std::sync::OnceLock;

use regex::Regex;

use super::{BulkVerdict, GuardModel, StopVerdict};
use crate::context::patterns::{detect_patterns, extract_entities};
use crate::types::{BulkOperationState, DetectedPattern};

static COUNT_RE: OnceLock<Regex> = OnceLock::new();
static PROGRESS_RE: OnceLock<Regex> = OnceLock::new();
static PROCESSED_RE: OnceLock<Regex> = OnceLock::new();
static HANDBACK_RE: OnceLock<Regex> = OnceLock::new();
static WORK_RE: OnceLock<Regex> = OnceLock::new();
static COMPLETE_RE: OnceLock<Regex> = OnceLock::new();

const BULK_KEYWORDS: &[&str] = &["bulk", "continue"];

#[derive(Debug, Default, Clone)]
pub struct RuleBasedGuard;

impl RuleBasedGuard {
    pub fn new() -> Self {
        Self
    }

    fn explicit_count(request: &str) -> Option<usize> {
        let re = COUNT_RE.get_or_init(|| {
            Regex::new(r"(?i)\b(\d{1,5})\s+(?:products|items|skus|variants|listings|urls)\b")
                .expect("static regex")
        });
        re.captures(request)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
    }

    fn operation_type(request: &str) -> Option<String> {
        let (patterns, _) = detect_patterns(request);
        for pattern in patterns {
            let name = match pattern {
                DetectedPattern::DiscountRemoval => "discount_removal",
                DetectedPattern::MapPricing => continue,
                DetectedPattern::BulkOperation => continue,
                DetectedPattern::PriceUpdate => "price_update",
            };
            return Some(name.to_string());
        }
        None
    }
}

#[async_trait::async_trait]
impl GuardModel for RuleBasedGuard {
    async fn classify_bulk(&self, request: &str) -> anyhow::Result<BulkVerdict> {
        let lowered = request.to_lowercase();
        let keyword_hit = BULK_KEYWORDS.iter().any(|k| lowered.contains(k));
        let entities = extract_entities(request);
        let explicit = Self::explicit_count(request);
        let is_bulk = keyword_hit || entities.len() >= 10 || explicit.map(|n| n >= 10).unwrap_or(false);

        if !is_bulk {
            return Ok(BulkVerdict::not_bulk("no bulk keywords or item lists"));
        }
        let expected_items = explicit.unwrap_or(entities.len());
        Ok(BulkVerdict {
            is_bulk_operation: true,
            expected_items,
            operation_type: Self::operation_type(request),
            reasoning: format!(
                "keyword_hit={keyword_hit}, entities={}, explicit_count={explicit:?}",
                entities.len()
            ),
        })
    }

    async fn classify_stop(
        &self,
        output: &str,
        state: &BulkOperationState,
    ) -> anyhow::Result<StopVerdict> {
        let handback_re = HANDBACK_RE.get_or_init(|| {
            Regex::new(
                r"(?i)(would you like me to continue|shall i (continue|proceed)|should i (continue|proceed)|do you want me to|let me know (if|when|whether)|ready to proceed\?)",
            )
            .expect("static regex")
        });
        let work_re = WORK_RE.get_or_init(|| {
            Regex::new(r"(?i)(✓|✅|\bupdated\b|\bprocessed\b|\bcompleted\b|\bremoved\b|\bdone\b|\bskipped\b)")
                .expect("static regex")
        });
        let complete_re = COMPLETE_RE.get_or_init(|| {
            Regex::new(r"(?i)\ball\s+(?:\d+\s+)?items?\s+(?:have been\s+|are\s+)?(completed|processed|updated|removed|done)\b")
                .expect("static regex")
        });

        let progress_count = parse_progress(output);
        let has_actual_work = work_re.is_match(output) || progress_count > 0;
        let announces_handback = handback_re.is_match(output);
        let is_complete = complete_re.is_match(output)
            || (state.expected_items > 0
                && progress_count
                    .max(state.completed_items.len())
                    >= state.expected_items);

        Ok(StopVerdict {
            is_announce_and_stop: announces_handback && !is_complete,
            has_actual_work,
            is_complete,
            progress_count,
            reasoning: format!(
                "handback={announces_handback}, work={has_actual_work}, progress={progress_count}"
            ),
        })
    }
}

/// Pulls a progress count out of assistant text: "14 of 25", "14/25", or
/// "processed 14".
pub fn parse_progress(output: &str) -> usize {
    let ratio_re = PROGRESS_RE.get_or_init(|| {
        Regex::new(r"(\d{1,5})\s*(?:of|/)\s*(\d{1,5})").expect("static regex")
    });
    if let Some(captures) = ratio_re.captures(output) {
        if let Some(n) = captures.get(1).and_then(|m| m.as_str().parse().ok()) {
            return n;
        }
    }
    let processed_re = PROCESSED_RE.get_or_init(|| {
        Regex::new(r"(?i)\b(?:processed|completed|updated|removed)\s+(\d{1,5})\b")
            .expect("static regex")
    });
    processed_re
        .captures(output)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0)
}

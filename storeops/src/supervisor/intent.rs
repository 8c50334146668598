//! Autonomy intent analysis for one operator turn.

use serde::Serialize;

use crate::types::AutonomyLevel;

#[derive(Debug, Clone, Serialize)]
pub struct IntentAnalysis {
    pub autonomy: AutonomyLevel,
    pub confidence: f32,
    pub reasoning: String,
}

const LOW_MARKERS: &[&str] = &[
    "ask me first",
    "ask before",
    "check with me",
    "confirm with me",
    "confirm before",
    "don't do anything yet",
    "wait for my approval",
];

const MEDIUM_MARKERS: &[&str] = &[
    "carefully",
    "be careful",
    "double-check",
    "double check",
    "verify first",
    "cautiously",
];

const HIGH_MARKERS: &[&str] = &["just do it", "go ahead", "don't ask", "no need to confirm"];

/// Operators issuing direct imperatives get high autonomy; hedging language
/// steps it down. A conversation-level preference overrides this analysis.
pub fn analyze_intent(message: &str) -> IntentAnalysis {
    let lowered = message.to_lowercase();

    if LOW_MARKERS.iter().any(|m| lowered.contains(m)) {
        return IntentAnalysis {
            autonomy: AutonomyLevel::Low,
            confidence: 0.9,
            reasoning: "operator asked for confirmation before actions".into(),
        };
    }
    if MEDIUM_MARKERS.iter().any(|m| lowered.contains(m)) {
        return IntentAnalysis {
            autonomy: AutonomyLevel::Medium,
            confidence: 0.7,
            reasoning: "operator asked for caution".into(),
        };
    }
    if HIGH_MARKERS.iter().any(|m| lowered.contains(m)) {
        return IntentAnalysis {
            autonomy: AutonomyLevel::High,
            confidence: 0.95,
            reasoning: "operator explicitly delegated".into(),
        };
    }
    IntentAnalysis {
        autonomy: AutonomyLevel::High,
        confidence: 0.6,
        reasoning: "direct operational request".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_requests_default_to_high() {
        let intent = analyze_intent("Update SKU ESP-1001 to $49.99");
        assert_eq!(intent.autonomy, AutonomyLevel::High);
    }

    #[test]
    fn confirmation_requests_drop_to_low() {
        let intent = analyze_intent("update the prices but check with me before each change");
        assert_eq!(intent.autonomy, AutonomyLevel::Low);
        assert!(intent.confidence > 0.8);
    }

    #[test]
    fn caution_requests_are_medium() {
        let intent = analyze_intent("carefully clean up the stale discounts");
        assert_eq!(intent.autonomy, AutonomyLevel::Medium);
    }
}

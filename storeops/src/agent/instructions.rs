//! Instruction assembly: a stable template over the context bundle plus an
//! autonomy preamble.

use crate::types::{AutonomyLevel, ChatRole, ContextBundle};

pub fn autonomy_preamble(level: AutonomyLevel) -> &'static str {
    match level {
        AutonomyLevel::High => {
            "AUTONOMY: high. Act immediately. Do not ask for confirmation; report what you did."
        }
        AutonomyLevel::Medium => {
            "AUTONOMY: medium. Act on routine operations; confirm only before risky or irreversible changes."
        }
        AutonomyLevel::Low => {
            "AUTONOMY: low. Describe and confirm every write operation before performing it."
        }
    }
}

/// Renders the bundle into agent instructions. Section order is stable so
/// prompts diff cleanly across runs.
pub fn render_instructions(role: &str, bundle: &ContextBundle) -> String {
    let mut out = String::new();
    out.push_str(role);
    out.push_str("\n\n");
    out.push_str(autonomy_preamble(bundle.autonomy));
    out.push('\n');

    if let Some(profile) = &bundle.user_profile {
        out.push_str("\n## Operator\n");
        out.push_str(profile);
        out.push('\n');
    }
    if !bundle.rules.is_empty() {
        out.push_str("\n## Business rules\n");
        for rule in &bundle.rules {
            out.push_str("- ");
            out.push_str(rule);
            out.push('\n');
        }
    }
    if !bundle.memories.is_empty() {
        out.push_str("\n## Relevant memory\n");
        for memory in &bundle.memories {
            out.push_str("- ");
            out.push_str(&memory.content);
            out.push('\n');
        }
    }
    if !bundle.fragments.is_empty() {
        out.push_str("\n## Guidance\n");
        let mut last_category = None;
        for fragment in &bundle.fragments {
            if last_category != Some(&fragment.category) {
                out.push_str(&format!("### {}\n", fragment.category));
                last_category = Some(&fragment.category);
            }
            out.push_str(&fragment.content);
            out.push('\n');
        }
    }
    if !bundle.business_logic.warnings.is_empty() {
        out.push_str("\n## Warnings\n");
        for warning in &bundle.business_logic.warnings {
            out.push_str("- ");
            out.push_str(warning);
            out.push('\n');
        }
    }
    if !bundle.current_tasks.is_empty() {
        out.push_str("\n## Current tasks\n");
        out.push_str(&crate::checkpoint::render_task_summary(&bundle.current_tasks));
        out.push('\n');
    }
    if !bundle.history.is_empty() {
        out.push_str("\n## Recent conversation\n");
        for message in &bundle.history {
            let who = match message.role {
                ChatRole::User => "operator",
                ChatRole::Assistant => "assistant",
            };
            out.push_str(&format!("{who}: {}\n", message.content));
        }
    }
    if !bundle.product_context.is_empty() {
        out.push_str("\n## Referenced products\n");
        for product in &bundle.product_context {
            out.push_str(&product.to_string());
            out.push('\n');
        }
    }
    if let Some(adaptive) = &bundle.adaptive {
        out.push_str("\n## Active bulk operation\n");
        if let Some(action) = &adaptive.extracted.action {
            out.push_str(&format!("action: {action}\n"));
        }
        if !adaptive.extracted.entities.is_empty() {
            out.push_str(&format!(
                "items ({}): {}\n",
                adaptive.extracted.entities.len(),
                adaptive.extracted.entities.join(", ")
            ));
        }
        if let Some(fetched) = &adaptive.fetched_context {
            out.push_str(&format!("fetched context: {fetched}\n"));
        }
    }
    if let Some(additional) = &bundle.additional_context {
        out.push_str("\n## Additional context\n");
        out.push_str(additional);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BusinessLogic, ContextBundle};

    fn bundle(autonomy: AutonomyLevel) -> ContextBundle {
        ContextBundle {
            task: "update pricing".into(),
            conversation_id: 1,
            user_id: "u1".into(),
            autonomy,
            user_profile: Some("Operator: u1".into()),
            memories: vec![],
            fragments: vec![],
            rules: vec!["NEVER price below MAP".into()],
            history: vec![],
            current_tasks: vec![],
            business_logic: BusinessLogic::default(),
            additional_context: None,
            adaptive: None,
            product_context: vec![],
            full_slice: false,
        }
    }

    #[test]
    fn preamble_matches_autonomy_level() {
        let high = render_instructions("You run shell tasks.", &bundle(AutonomyLevel::High));
        assert!(high.contains("Act immediately"));
        let low = render_instructions("You run shell tasks.", &bundle(AutonomyLevel::Low));
        assert!(low.contains("confirm every write"));
    }

    #[test]
    fn sections_render_in_stable_order() {
        let text = render_instructions("Role.", &bundle(AutonomyLevel::High));
        let rules_at = text.find("## Business rules").unwrap();
        let operator_at = text.find("## Operator").unwrap();
        assert!(operator_at < rules_at);
    }
}

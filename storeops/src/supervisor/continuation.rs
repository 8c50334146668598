//! Tripwire recovery: preserving partial output and composing the
//! continuation prompt that forces the model back to work.

use crate::types::BulkOperationState;

/// Streamed assistant text preserved across a tripwire, capped at 50 KiB.
pub const PRESERVED_TEXT_CAP: usize = 50 * 1024;

pub const PRESERVED_TRUNCATION_MARKER: &str = "\n[...partial output truncated...]";

pub fn preserve_text(text: &str) -> String {
    if text.len() <= PRESERVED_TEXT_CAP {
        return text.to_string();
    }
    let cut = text
        .char_indices()
        .take_while(|(i, _)| *i < PRESERVED_TEXT_CAP)
        .last()
        .map(|(i, c)| i + c.len_utf8())
        .unwrap_or(0);
    format!("{}{PRESERVED_TRUNCATION_MARKER}", &text[..cut])
}

/// The message appended when retries are exhausted.
pub fn termination_notice(state: &BulkOperationState, max_retries: u32) -> String {
    format!(
        "\n\n---\nBulk operation halted after {max_retries} continuation attempts: {} of {} items confirmed complete. Remaining items are listed in the latest checkpoint; send \"continue\" to resume.",
        state.completed_items.len(),
        state.expected_items,
    )
}

/// Builds the prompt for a fresh supervisor invocation after a tripwire.
/// The checkpoint-backed state decides what is still to do; the prompt
/// forbids handing control back and forbids showing code instead of
/// executing.
pub fn compose_continuation_prompt(
    preserved: &str,
    state: &BulkOperationState,
    original_context: &str,
) -> String {
    let remaining = state.remaining_items();
    let mut prompt = String::new();
    prompt.push_str(
        "You stopped mid-way through a bulk operation. Your previous output is quoted below; the work it promised was NOT finished.\n\n",
    );
    prompt.push_str("--- previous output ---\n");
    prompt.push_str(preserved);
    prompt.push_str("\n--- end previous output ---\n\n");

    prompt.push_str(&format!(
        "{} of {} items are confirmed complete. Process the remaining {} items NOW, one by one:\n",
        state.completed_items.len(),
        state.expected_items,
        remaining.len(),
    ));
    for item in &remaining {
        prompt.push_str("- ");
        prompt.push_str(item);
        prompt.push('\n');
    }

    prompt.push_str(
        "\nRules for this continuation:\n\
         - Do NOT return control to the user, ask whether to continue, or wait for confirmation.\n\
         - Do NOT show code or describe what you would do; execute the operations with your tools.\n\
         - Report each item as it completes and finish with a final count.\n",
    );

    if !original_context.is_empty() {
        prompt.push_str("\n--- original request context ---\n");
        prompt.push_str(original_context);
        prompt.push('\n');
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> BulkOperationState {
        let mut state = BulkOperationState {
            active: true,
            expected_items: 5,
            item_list: (1..=5).map(|i| format!("sku-{i}")).collect(),
            operation_type: Some("discount_removal".into()),
            ..Default::default()
        };
        state.record_completed(["sku-1".to_string(), "sku-2".to_string()]);
        state
    }

    #[test]
    fn preserved_text_is_capped_with_marker() {
        let long = "x".repeat(PRESERVED_TEXT_CAP + 1000);
        let preserved = preserve_text(&long);
        assert!(preserved.len() <= PRESERVED_TEXT_CAP + PRESERVED_TRUNCATION_MARKER.len());
        assert!(preserved.ends_with(PRESERVED_TRUNCATION_MARKER));

        let short = "done: sku-1";
        assert_eq!(preserve_text(short), short);
    }

    #[test]
    fn continuation_enumerates_remaining_items_only() {
        let prompt = compose_continuation_prompt("Processed 2 of 5.", &state(), "remove discounts");
        assert!(prompt.contains("- sku-3"));
        assert!(prompt.contains("- sku-4"));
        assert!(prompt.contains("- sku-5"));
        assert!(!prompt.contains("- sku-1\n"));
        assert!(prompt.contains("Do NOT return control"));
        assert!(prompt.contains("Do NOT show code"));
        assert!(prompt.contains("remove discounts"));
        assert!(prompt.contains("Processed 2 of 5."));
    }
}

//! Task text classification: full-slice triggers, business pattern
//! detection, SKU and entity extraction, business-rule filtering.

use std::sync::OnceLock;

use regex::Regex;

use crate::types::DetectedPattern;

fn regex(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("static regex"))
}

static BULK_RE: OnceLock<Regex> = OnceLock::new();
static EXPORT_RE: OnceLock<Regex> = OnceLock::new();
static COUNT_RE: OnceLock<Regex> = OnceLock::new();
static SKU_RE: OnceLock<Regex> = OnceLock::new();
static URL_RE: OnceLock<Regex> = OnceLock::new();
static DISCOUNT_RE: OnceLock<Regex> = OnceLock::new();
static MAP_RE: OnceLock<Regex> = OnceLock::new();
static PRICE_RE: OnceLock<Regex> = OnceLock::new();

fn bulk_re() -> &'static Regex {
    regex(&BULK_RE, r"(?i)\b(bulk|batch|all\s+products)\b")
}

/// SKU-like tokens: short uppercase prefix, optional dash, digit run.
pub fn extract_skus(text: &str) -> Vec<String> {
    let re = regex(&SKU_RE, r"\b[A-Z]{2,6}-?\d{2,6}\b");
    let mut skus: Vec<String> = re.find_iter(text).map(|m| m.as_str().to_string()).collect();
    skus.dedup();
    skus
}

pub fn extract_urls(text: &str) -> Vec<String> {
    let re = regex(&URL_RE, r#"https?://[^\s"'<>)]+"#);
    re.find_iter(text).map(|m| m.as_str().to_string()).collect()
}

/// Entities referenced by a request: URLs first, then SKUs, deduplicated in
/// order of appearance.
pub fn extract_entities(text: &str) -> Vec<String> {
    let mut entities = extract_urls(text);
    for sku in extract_skus(text) {
        if !entities.contains(&sku) {
            entities.push(sku);
        }
    }
    entities
}

/// Whether the task needs the full context slice.
pub fn needs_full_slice(task: &str) -> bool {
    if bulk_re().is_match(task) {
        return true;
    }
    if regex(&EXPORT_RE, r"(?i)\b(json\s+array|csv|export)\b").is_match(task) {
        return true;
    }
    // Standalone counts of 100 or more; digits glued to a SKU prefix do not
    // count.
    let count_re = regex(&COUNT_RE, r"(?:^|[\s(\[])(\d{3,})\b");
    if count_re
        .captures_iter(task)
        .filter_map(|c| c.get(1))
        .any(|m| m.as_str().parse::<u64>().map(|n| n >= 100).unwrap_or(false))
    {
        return true;
    }
    if task.len() > 5 * 1024 {
        return true;
    }
    extract_skus(task).len() >= 6
}

pub fn detect_patterns(task: &str) -> (Vec<DetectedPattern>, Vec<String>) {
    let mut patterns = Vec::new();
    let mut warnings = Vec::new();

    if regex(
        &DISCOUNT_RE,
        r"(?i)\b(remove|clear|strip|end|revert)\b.*\b(discount|sale|compare[-\s]?at)\b",
    )
    .is_match(task)
    {
        patterns.push(DetectedPattern::DiscountRemoval);
        warnings.push(
            "Discount removal resets compareAtPrice; confirm the original price source before writing".to_string(),
        );
    }
    if regex(&MAP_RE, r"(?i)(\bmap\b|minimum\s+advertised)").is_match(task) {
        patterns.push(DetectedPattern::MapPricing);
        warnings.push("MAP floors apply; never price below the minimum advertised price".to_string());
    }
    if bulk_re().is_match(task) {
        patterns.push(DetectedPattern::BulkOperation);
    }
    if regex(
        &PRICE_RE,
        r"(?i)\b(update|change|set|raise|lower|adjust)\b.*\b(price|pricing)\b",
    )
    .is_match(task)
    {
        patterns.push(DetectedPattern::PriceUpdate);
    }
    (patterns, warnings)
}

/// Keeps only rule lines carrying a hard constraint marker.
pub fn filter_rules<'a, I>(rules: I, cap: usize) -> Vec<String>
where
    I: IntoIterator<Item = &'a String>,
{
    rules
        .into_iter()
        .filter(|line| {
            line.contains("CRITICAL")
                || line.contains("ALWAYS")
                || line.contains("NEVER")
                || line.contains("MAP")
        })
        .take(cap)
        .cloned()
        .collect()
}

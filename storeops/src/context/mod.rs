mod builder;
pub mod patterns;
pub mod product;

pub use builder::{
    BuildRequest, ContextBuilder, ContextMode, CONTEXT_TRUNCATED_MARKER,
    FRAGMENTS_TRUNCATED_MARKER, HISTORY_TRUNCATED_MARKER, MEMORIES_TRUNCATED_MARKER,
    RULES_TRUNCATED_MARKER,
};
pub use product::strip_product_keys;

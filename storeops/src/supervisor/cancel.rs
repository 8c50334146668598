//! Cancellation token registry keyed by conversation.
//!
//! One live run per conversation: `begin` claims the slot or reports the
//! conflict. `abort` is reachable from the transport layer and propagates
//! through every suspension point holding the token.

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::types::ConversationId;

#[derive(Default)]
pub struct CancellationRegistry {
    tokens: DashMap<String, CancellationToken>,
}

/// Conversation ids arrive as ints from the core and strings from the
/// transport; both normalize to the same key.
fn normalize(conv: ConversationId) -> String {
    conv.to_string()
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the conversation for a new run. `None` when a run is already
    /// active.
    pub fn begin(&self, conv: ConversationId) -> Option<CancellationToken> {
        let key = normalize(conv);
        match self.tokens.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => None,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let token = CancellationToken::new();
                slot.insert(token.clone());
                Some(token)
            }
        }
    }

    /// Aborts the active run, if any. Returns whether a run was aborted.
    pub fn abort(&self, conv: ConversationId) -> bool {
        if let Some(token) = self.tokens.get(&normalize(conv)) {
            tracing::info!(conv, "aborting active run");
            token.cancel();
            true
        } else {
            false
        }
    }

    /// Accepts the raw string key the transport layer carries.
    pub fn abort_key(&self, key: &str) -> bool {
        match key.trim().parse::<ConversationId>() {
            Ok(conv) => self.abort(conv),
            Err(_) => false,
        }
    }

    pub fn finish(&self, conv: ConversationId) {
        self.tokens.remove(&normalize(conv));
    }

    pub fn is_active(&self, conv: ConversationId) -> bool {
        self.tokens.contains_key(&normalize(conv))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_begin_is_rejected_until_finish() {
        let registry = CancellationRegistry::new();
        let token = registry.begin(7).unwrap();
        assert!(registry.begin(7).is_none());
        assert!(registry.begin(8).is_some());

        registry.finish(7);
        assert!(!token.is_cancelled());
        assert!(registry.begin(7).is_some());
    }

    #[test]
    fn abort_cancels_the_active_token() {
        let registry = CancellationRegistry::new();
        let token = registry.begin(7).unwrap();
        assert!(registry.abort_key(" 7 "));
        assert!(token.is_cancelled());
        assert!(!registry.abort(99));
    }
}

//! One in-flight primary request per conversation.
//!
//! A new message on a conversation cancels whatever was still streaming on it. Entries are keyed by
//! conversation id and tagged with a generation so a finishing request never removes the ticket
//! of the request that superseded it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Clone, Debug)]
pub struct InFlightTicket {
    generation: u64,
    token: CancellationToken,
}

impl InFlightTicket {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

#[derive(Debug, Default)]
pub struct InFlightRegistry {
    entries: Mutex<HashMap<String, (u64, CancellationToken)>>,
    generation: AtomicU64,
}

impl InFlightRegistry {
    /// Registers a new request for `key`, cancelling the one it replaces.
    pub fn begin(&self, key: &str) -> InFlightTicket {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let token = CancellationToken::new();
        let previous = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), (generation, token.clone()));

        if let Some((_, superseded)) = previous {
            superseded.cancel();
            debug!(
                event_name = "agent.stream.superseded",
                conversation_id = %key,
                "cancelled previous request"
            );
        }
        InFlightTicket { generation, token }
    }

    pub fn finish(&self, key: &str, ticket: &InFlightTicket) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.get(key).is_some_and(|(generation, _)| *generation == ticket.generation) {
            entries.remove(key);
        }
    }

    /// Cancels the request in flight for `key`. Returns `false` when there was none.
    pub fn cancel(&self, key: &str) -> bool {
        let removed = self.entries.lock().unwrap_or_else(PoisonError::into_inner).remove(key);
        match removed {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[cfg(test)]
mod tests {
    use super::InFlightRegistry;

    #[test]
    fn new_request_cancels_the_previous_one() {
        let registry = InFlightRegistry::default();
        let first = registry.begin("conv-1");
        let second = registry.begin("conv-1");

        assert!(first.token().is_cancelled());
        assert!(!second.token().is_cancelled());
        assert_eq!(registry.in_flight(), 1);
    }

    #[test]
    fn stale_finish_keeps_the_newer_entry() {
        let registry = InFlightRegistry::default();
        let first = registry.begin("conv-1");
        let second = registry.begin("conv-1");

        registry.finish("conv-1", &first);
        assert_eq!(registry.in_flight(), 1);
        registry.finish("conv-1", &second);
        assert_eq!(registry.in_flight(), 0);
    }

    #[test]
    fn conversations_are_independent() {
        let registry = InFlightRegistry::default();
        let first = registry.begin("conv-1");
        let _other = registry.begin("conv-2");

        assert!(!first.token().is_cancelled());
        assert!(registry.cancel("conv-2"));
        assert!(!registry.cancel("conv-2"));
        assert!(!first.token().is_cancelled());
    }
}

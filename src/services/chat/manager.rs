//! Registry of in-flight turns, one per conversation. Enforces the
//! single-turn invariant and hands out the cancellation handle that governs
//! the whole turn (primary stream, push channel, edit request).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::services::cancel::CancelSender;

pub(crate) struct ActiveTurn {
    pub turn_id: String,
    pub cancel: CancelSender,
    pub handle: tokio::task::JoinHandle<()>,
}

#[derive(Default)]
struct TurnRegistry {
    by_conversation: HashMap<String, ActiveTurn>,
}

// NOTE: Using std::sync::Mutex since the lock is never held across .await.
#[derive(Clone, Default)]
pub struct TurnManager {
    registry: Arc<Mutex<TurnRegistry>>,
}

impl TurnManager {
    pub fn is_active(&self, conversation_id: &str) -> bool {
        self.lock().by_conversation.contains_key(conversation_id)
    }

    /// Remove and return the active turn for a conversation, if any. The
    /// caller owns cancellation and joining from here.
    pub(crate) fn take(&self, conversation_id: &str) -> Option<ActiveTurn> {
        self.lock().by_conversation.remove(conversation_id)
    }

    /// Register a turn under a locked section shared with `spawn`, so the
    /// task's own cleanup cannot race the insertion.
    pub(crate) fn register_with<F>(
        &self,
        conversation_id: &str,
        turn_id: &str,
        cancel: CancelSender,
        spawn: F,
    ) where
        F: FnOnce() -> tokio::task::JoinHandle<()>,
    {
        let mut registry = self.lock();
        let handle = spawn();
        registry.by_conversation.insert(
            conversation_id.to_string(),
            ActiveTurn {
                turn_id: turn_id.to_string(),
                cancel,
                handle,
            },
        );
    }

    /// Drop the registry entry once a turn completes, unless a newer turn
    /// has already taken the slot.
    pub(crate) fn finish(&self, conversation_id: &str, turn_id: &str) {
        let mut registry = self.lock();
        if registry
            .by_conversation
            .get(conversation_id)
            .map(|t| t.turn_id.as_str())
            == Some(turn_id)
        {
            registry.by_conversation.remove(conversation_id);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TurnRegistry> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Cancel a turn and wait for it to unwind. The watch flip wakes every
/// suspension point inside the turn; joining guarantees no further writes to
/// conversation state once this returns.
pub(crate) async fn cancel_and_join(turn: ActiveTurn) {
    let _ = turn.cancel.send(true);
    let _ = turn.handle.await;
}

use super::ChatTurn;
use parking_lot::Mutex;
use std::sync::Arc;

/// Conversation history for one widget session.
///
/// Cloning shares the same history. Turns are only ever appended; the whole
/// history is discarded by [`ChatSession::reset`].
#[derive(Debug, Clone, Default)]
pub struct ChatSession {
    turns: Arc<Mutex<Vec<ChatTurn>>>,
}

impl ChatSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&self) {
        self.turns.lock().clear();
    }

    pub fn push(&self, turn: ChatTurn) {
        self.turns.lock().push(turn);
    }

    /// Appends `turn` and returns the history including it.
    pub fn push_and_snapshot(&self, turn: ChatTurn) -> Vec<ChatTurn> {
        let mut turns = self.turns.lock();
        turns.push(turn);
        turns.clone()
    }

    pub fn history(&self) -> Vec<ChatTurn> {
        self.turns.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.turns.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.lock().is_empty()
    }
}

//! In-memory message storage keyed by message id.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use crate::message::ChatMessage;

/// Thread-safe map from message id to message.
///
/// The store does no validation of its own; callers decide what is allowed
/// in. One instance is built by the top-level assembly and shared by `Arc`.
#[derive(Default)]
pub struct MessageStore {
    messages: RwLock<HashMap<String, ChatMessage>>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self {
            messages: RwLock::new(HashMap::new()),
        }
    }

    /// Inserts the message, replacing any earlier entry with the same id.
    pub fn add(&self, message: ChatMessage) {
        self.messages
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(message.id.clone(), message);
    }

    /// Returns a copy of the message with this id, or `None` if it is unknown.
    pub fn get(&self, id: &str) -> Option<ChatMessage> {
        self.messages
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.messages
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.messages
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

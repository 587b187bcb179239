//! Parent/child index over a [`MessageStore`].
//!
//! The tree may be causally incomplete at any moment: a message can arrive
//! before its ancestors. [`MessageTree::ancestor_chain`] walks as far as the
//! local knowledge allows and names the nearest missing ancestor so the
//! caller can ask a peer for it. Once that ancestor is added the next walk
//! goes one step further.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;

use crate::{error::TreeError, message::ChatMessage, store::MessageStore};

/// Result of walking from a leaf toward the root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AncestorChain {
    /// Known messages, leaf first.
    pub messages: Vec<ChatMessage>,
    /// Nearest ancestor referenced by a parent link but absent locally.
    pub needed: Option<String>,
}

pub struct MessageTree {
    store: Arc<MessageStore>,
    /// Parent id to child ids in first-seen order. Roots live under "".
    children: RwLock<HashMap<String, Vec<String>>>,
}

impl MessageTree {
    pub fn new(store: Arc<MessageStore>) -> Self {
        Self {
            store,
            children: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<MessageStore> {
        &self.store
    }

    /// Stores the message and records it under its parent.
    ///
    /// Adding a message that is already stored under the same parent is a
    /// no-op; a different parent is rejected, since parent links never
    /// change. Messages without an id, or whose known ancestry already
    /// contains their own id, are rejected too.
    pub fn add(&self, message: ChatMessage) -> Result<(), TreeError> {
        if message.id.is_empty() {
            return Err(TreeError::MissingId);
        }

        // Held from the checks through the insert.
        let mut children = self
            .children
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = self.store.get(&message.id) {
            if existing.parent_id != message.parent_id {
                return Err(TreeError::Reparent {
                    id: message.id,
                    parent: existing.parent_id,
                });
            }
            let siblings = children.entry(existing.parent_id).or_default();
            if !siblings.contains(&existing.id) {
                siblings.push(existing.id);
            }
            return Ok(());
        }
        if self.closes_cycle(&message) {
            return Err(TreeError::Cycle(message.id));
        }

        let id = message.id.clone();
        let parent = message.parent_id.clone();
        self.store.add(message);
        children.entry(parent).or_default().push(id);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<ChatMessage> {
        self.store.get(id)
    }

    /// Snapshot of the known child ids of `id`.
    pub fn children(&self, id: &str) -> Vec<String> {
        self.children
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    /// Walks from `leaf_id` toward the root, collecting at most `max_length`
    /// messages.
    ///
    /// The walk ends at a true root, at the length cap, or at the first
    /// parent that is not stored locally. In the last case that parent id is
    /// reported as `needed`, even when the chain is already at the cap. An
    /// unknown leaf yields an empty chain.
    pub fn ancestor_chain(&self, leaf_id: &str, max_length: usize) -> AncestorChain {
        let mut chain = AncestorChain::default();
        if max_length == 0 {
            return chain;
        }
        let Some(mut current) = self.store.get(leaf_id) else {
            return chain;
        };

        loop {
            let parent_id = current.parent_id.clone();
            chain.messages.push(current);
            if parent_id.is_empty() {
                break;
            }
            match self.store.get(&parent_id) {
                Some(_) if chain.messages.len() >= max_length => break,
                Some(parent) => current = parent,
                None => {
                    debug!(id = %parent_id, "ancestor not known locally");
                    chain.needed = Some(parent_id);
                    break;
                }
            }
        }
        chain
    }

    fn closes_cycle(&self, message: &ChatMessage) -> bool {
        // A well-formed ancestry visits each stored message at most once.
        let limit = self.store.len() + 1;
        let mut cursor = message.parent_id.clone();
        for _ in 0..=limit {
            if cursor.is_empty() {
                return false;
            }
            if cursor == message.id {
                return true;
            }
            match self.store.get(&cursor) {
                Some(parent) => cursor = parent.parent_id,
                None => return false,
            }
        }
        true
    }
}

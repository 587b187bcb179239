use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single authored post and one node of the conversation tree.
///
/// Field names on the wire follow the arbor protocol (`UUID`, `Parent`, ...).
/// An empty `parent_id` marks a root message.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ChatMessage {
    #[serde(rename = "UUID")]
    pub id: String,
    #[serde(rename = "Parent")]
    pub parent_id: String,
    #[serde(rename = "Content")]
    pub content: String,
    #[serde(rename = "Username")]
    pub author: String,
    #[serde(rename = "Timestamp")]
    pub created_at: i64,
}

impl ChatMessage {
    /// Creates a root message stamped with the current time. The id stays
    /// empty until [`ChatMessage::assign_id`] is called.
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            created_at: chrono::Utc::now().timestamp(),
            ..Self::default()
        }
    }

    /// Replaces the id with a freshly generated v4 uuid.
    pub fn assign_id(&mut self) {
        self.id = Uuid::new_v4().to_string();
    }

    /// Builds an unsent reply whose parent is this message.
    pub fn reply(&self, content: impl Into<String>) -> Self {
        Self {
            parent_id: self.id.clone(),
            ..Self::new(content)
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_message_is_an_unidentified_root() {
        let message = ChatMessage::new("hello");
        assert!(message.id.is_empty());
        assert!(message.is_root());
        assert_eq!(message.content, "hello");
        assert!(message.created_at > 0);
    }

    #[test]
    fn assign_id_generates_distinct_ids() {
        let mut first = ChatMessage::new("a");
        let mut second = ChatMessage::new("a");
        first.assign_id();
        second.assign_id();
        assert!(!first.id.is_empty());
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn reply_points_at_parent() {
        let mut parent = ChatMessage::new("question");
        parent.assign_id();
        let reply = parent.reply("answer");
        assert_eq!(reply.parent_id, parent.id);
        assert!(reply.id.is_empty());
        assert!(!reply.is_root());
    }

    #[test]
    fn equality_covers_every_field() {
        let base = ChatMessage {
            id: "1".into(),
            parent_id: "0".into(),
            content: "hi".into(),
            author: "alice".into(),
            created_at: 10,
        };
        assert_eq!(base, base.clone());
        assert_ne!(base, ChatMessage { created_at: 11, ..base.clone() });
        assert_ne!(base, ChatMessage { author: "bob".into(), ..base.clone() });
        assert_ne!(base, ChatMessage { parent_id: String::new(), ..base.clone() });
    }
}

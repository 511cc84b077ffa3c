#[cfg(test)]
#[path = "message_test.rs"]
mod tests;

use std::fmt;

use serde_derive::Deserialize;
use serde_derive::Serialize;
use uuid::Uuid;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Stable handle to a transcript entry. Resolved to a position only at write
/// time, so entries can move without invalidating the handle.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn new() -> MessageId {
        return MessageId(Uuid::new_v4());
    }
}

impl Default for MessageId {
    fn default() -> MessageId {
        return MessageId::new();
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        return write!(f, "{}", self.0);
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: &str) -> ChatMessage {
        return ChatMessage {
            id: MessageId::new(),
            role,
            content: content.to_string(),
        };
    }

    /// An empty assistant entry that a generation streams into.
    pub fn placeholder() -> ChatMessage {
        return ChatMessage::new(Role::Assistant, "");
    }

    pub fn append(&mut self, fragment: &str) {
        self.content += fragment;
    }

    pub fn is_empty(&self) -> bool {
        return self.content.is_empty();
    }
}

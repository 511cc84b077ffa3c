#[cfg(test)]
#[path = "transcript_test.rs"]
mod tests;

use anyhow::bail;
use anyhow::Result;

use crate::domain::models::ChatMessage;
use crate::domain::models::MessageId;
use crate::domain::models::RelayMessage;
use crate::domain::models::Role;

/// Ordered conversation. Insertion order is rendering order, and entries are
/// only ever changed through `append` and `fail`.
#[derive(Clone, Debug, Default)]
pub struct Transcript {
    messages: Vec<ChatMessage>,
}

impl Transcript {
    pub fn new() -> Transcript {
        return Transcript::default();
    }

    pub fn messages(&self) -> &[ChatMessage] {
        return &self.messages;
    }

    pub fn len(&self) -> usize {
        return self.messages.len();
    }

    pub fn is_empty(&self) -> bool {
        return self.messages.is_empty();
    }

    pub fn get(&self, id: MessageId) -> Option<&ChatMessage> {
        return self.messages.iter().find(|message| return message.id == id);
    }

    fn position(&self, id: MessageId) -> Option<usize> {
        return self.messages.iter().position(|message| return message.id == id);
    }

    /// Pushes `message` followed by an empty assistant placeholder, returning
    /// the placeholder's handle.
    pub fn begin_generation(&mut self, message: ChatMessage) -> MessageId {
        let placeholder = ChatMessage::placeholder();
        let target = placeholder.id;

        self.messages.push(message);
        self.messages.push(placeholder);

        return target;
    }

    pub fn append(&mut self, target: MessageId, fragment: &str) -> Result<()> {
        if let Some(idx) = self.position(target) {
            self.messages[idx].append(fragment);
            return Ok(());
        }

        bail!(format!("No transcript entry for {target}"));
    }

    /// Replaces the target's content, partial output included, with `message`.
    pub fn fail(&mut self, target: MessageId, message: &str) -> Result<()> {
        if let Some(idx) = self.position(target) {
            self.messages[idx].content = message.to_string();
            return Ok(());
        }

        bail!(format!("No transcript entry for {target}"));
    }

    /// Conversation history preceding `target` in wire form. Empty entries,
    /// such as cancelled placeholders, are left out.
    pub fn history_before(&self, target: MessageId) -> Vec<RelayMessage> {
        let end = self.position(target).unwrap_or(self.messages.len());

        return self.messages[..end]
            .iter()
            .filter(|message| return !message.is_empty() && message.role != Role::System)
            .map(RelayMessage::from)
            .collect();
    }
}

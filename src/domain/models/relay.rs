#[cfg(test)]
#[path = "relay_test.rs"]
mod tests;

use serde_derive::Deserialize;
use serde_derive::Serialize;

use super::ChatMessage;
use super::Role;

/// A message as it travels over the wire, without its transcript handle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayMessage {
    pub role: Role,
    pub content: String,
}

impl RelayMessage {
    pub fn new(role: Role, content: &str) -> RelayMessage {
        return RelayMessage {
            role,
            content: content.to_string(),
        };
    }
}

impl From<&ChatMessage> for RelayMessage {
    fn from(message: &ChatMessage) -> RelayMessage {
        return RelayMessage::new(message.role, &message.content);
    }
}

/// Body accepted by `POST /chat`, and forwarded upstream with `stream`
/// forced on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayRequest {
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    pub messages: Vec<RelayMessage>,
}

impl RelayRequest {
    pub fn new(model: &str, messages: Vec<RelayMessage>) -> RelayRequest {
        return RelayRequest {
            model: model.to_string(),
            stream: Some(true),
            messages,
        };
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

impl ErrorBody {
    pub fn new(error: &str) -> ErrorBody {
        return ErrorBody {
            error: error.to_string(),
        };
    }
}

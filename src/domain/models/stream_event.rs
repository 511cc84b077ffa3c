use serde_derive::Deserialize;
use serde_derive::Serialize;

/// Literal payload that ends a stream independently of transport close.
pub const DONE_SENTINEL: &str = "[DONE]";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamEvent {
    /// Newly produced text since the previous frame.
    Fragment(String),
    /// The sentinel frame was seen.
    Done,
}

#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionDelta {
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionChoice {
    #[serde(default)]
    pub delta: CompletionDelta,
}

/// One `data:` frame of an upstream completion stream.
#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionChunk {
    pub choices: Vec<CompletionChoice>,
}

impl CompletionChunk {
    pub fn fragment(&self) -> Option<&str> {
        return self
            .choices
            .first()
            .and_then(|choice| return choice.delta.content.as_deref())
            .filter(|content| return !content.is_empty());
    }
}

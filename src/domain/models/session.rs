use std::fmt;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        return write!(f, "{}", self.0);
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Streaming,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum SessionOutcome {
    Completed,
    Cancelled,
    Failed,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum GenerationKind {
    Chat,
    Summary,
}

impl GenerationKind {
    pub fn error_message(&self) -> &'static str {
        match self {
            GenerationKind::Chat => return "An error occurred while generating a response.",
            GenerationKind::Summary => {
                return "An error occurred while summarizing the document.";
            }
        }
    }
}

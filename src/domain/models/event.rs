use super::MessageId;
use super::SessionId;
use super::SessionOutcome;

/// Emitted by the session controller for the front end to re-render from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Fragment {
        target: MessageId,
        text: String,
    },
    Failed {
        target: MessageId,
        message: String,
    },
    SessionEnded {
        session: SessionId,
        target: MessageId,
        outcome: SessionOutcome,
    },
}

#[cfg(test)]
#[path = "session_controller_test.rs"]
mod tests;

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::EventStreamDecoder;
use super::Transcript;
use crate::domain::models::ChatMessage;
use crate::domain::models::CompletionSource;
use crate::domain::models::Event;
use crate::domain::models::GenerationKind;
use crate::domain::models::MessageId;
use crate::domain::models::RelayMessage;
use crate::domain::models::RelayRequest;
use crate::domain::models::Role;
use crate::domain::models::SessionId;
use crate::domain::models::SessionOutcome;
use crate::domain::models::SessionState;
use crate::domain::models::StreamEvent;

pub const SUMMARY_TRANSCRIPT_PREFIX: &str =
    "📄 Document uploaded. Please summarize it and organize the key points:\n\n";
pub const SUMMARY_REQUEST_PREFIX: &str = "Summarize the following document:\n\n";

/// Transcript and the id of the one session allowed to write to it. Kept under
/// a single lock so a write and the check that its session is still active
/// can't interleave with a supersession.
struct Shared {
    transcript: Transcript,
    active: Option<SessionId>,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    return shared
        .lock()
        .unwrap_or_else(|poisoned| return poisoned.into_inner());
}

struct Session {
    id: SessionId,
    token: CancellationToken,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SessionHandle {
    pub session: SessionId,
    pub target: MessageId,
}

/// Writes on behalf of one running session, honored only while it's active.
struct SessionContext {
    id: SessionId,
    target: MessageId,
    kind: GenerationKind,
    shared: Arc<Mutex<Shared>>,
    tx: mpsc::UnboundedSender<Event>,
}

impl SessionContext {
    fn append(&self, text: &str) -> bool {
        let mut shared = lock(&self.shared);
        if shared.active != Some(self.id) {
            return false;
        }

        if let Err(err) = shared.transcript.append(self.target, text) {
            tracing::error!(session = %self.id, error = ?err, "Failed to append fragment");
            return false;
        }

        let _ = self.tx.send(Event::Fragment {
            target: self.target,
            text: text.to_string(),
        });

        return true;
    }

    fn fail(&self) {
        let mut shared = lock(&self.shared);
        if shared.active != Some(self.id) {
            return;
        }

        let message = self.kind.error_message();
        if let Err(err) = shared.transcript.fail(self.target, message) {
            tracing::error!(session = %self.id, error = ?err, "Failed to write error message");
            return;
        }

        let _ = self.tx.send(Event::Failed {
            target: self.target,
            message: message.to_string(),
        });
    }

    fn is_active(&self) -> bool {
        return lock(&self.shared).active == Some(self.id);
    }

    /// A session that lost its active slot ends `Cancelled`, whatever it saw.
    fn end(&self, outcome: SessionOutcome) {
        let mut shared = lock(&self.shared);
        let mut outcome = outcome;
        if shared.active == Some(self.id) {
            shared.active = None;
        } else {
            outcome = SessionOutcome::Cancelled;
        }

        tracing::info!(session = %self.id, outcome = %outcome, "Session ended");
        let _ = self.tx.send(Event::SessionEnded {
            session: self.id,
            target: self.target,
            outcome,
        });
    }

    fn apply(&self, events: Vec<StreamEvent>) -> Option<SessionOutcome> {
        for event in events {
            match event {
                StreamEvent::Fragment(text) => {
                    if !self.append(&text) {
                        return Some(SessionOutcome::Cancelled);
                    }
                }
                StreamEvent::Done => {
                    if !self.is_active() {
                        return Some(SessionOutcome::Cancelled);
                    }
                    return Some(SessionOutcome::Completed);
                }
            }
        }

        return None;
    }
}

async fn stream_into(
    source: &dyn CompletionSource,
    request: &RelayRequest,
    ctx: &SessionContext,
) -> SessionOutcome {
    let mut stream = match source.open(request).await {
        Ok(stream) => stream,
        Err(err) => {
            tracing::error!(session = %ctx.id, error = ?err, "Failed to open completion stream");
            ctx.fail();
            return SessionOutcome::Failed;
        }
    };

    let mut decoder = EventStreamDecoder::new();
    while let Some(chunk) = stream.next().await {
        let bytes = match chunk {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::error!(session = %ctx.id, error = ?err, "Completion stream broke");
                ctx.fail();
                return SessionOutcome::Failed;
            }
        };

        if let Some(outcome) = ctx.apply(decoder.feed(&bytes)) {
            return outcome;
        }
    }

    if let Some(outcome) = ctx.apply(decoder.finish()) {
        return outcome;
    }

    tracing::warn!(session = %ctx.id, "Completion stream closed before the sentinel");
    ctx.fail();
    return SessionOutcome::Failed;
}

async fn run_session(
    source: Arc<dyn CompletionSource>,
    request: RelayRequest,
    ctx: SessionContext,
    token: CancellationToken,
) {
    // Cancelling drops the stream, which aborts the underlying connection.
    let outcome = tokio::select! {
        biased;
        _ = token.cancelled() => SessionOutcome::Cancelled,
        outcome = stream_into(source.as_ref(), &request, &ctx) => outcome,
    };

    ctx.end(outcome);
}

/// Runs at most one generation at a time. Starting a new one cancels the
/// previous session before the new one becomes active.
pub struct SessionController {
    source: Arc<dyn CompletionSource>,
    shared: Arc<Mutex<Shared>>,
    session: Option<Session>,
    next_id: u64,
    model: String,
    system_prompt: String,
    tx: mpsc::UnboundedSender<Event>,
}

impl SessionController {
    pub fn new(
        source: Arc<dyn CompletionSource>,
        model: &str,
        system_prompt: &str,
        tx: mpsc::UnboundedSender<Event>,
    ) -> SessionController {
        return SessionController {
            source,
            shared: Arc::new(Mutex::new(Shared {
                transcript: Transcript::new(),
                active: None,
            })),
            session: None,
            next_id: 0,
            model: model.to_string(),
            system_prompt: system_prompt.to_string(),
            tx,
        };
    }

    /// A copy of the transcript as of now.
    pub fn transcript(&self) -> Transcript {
        return lock(&self.shared).transcript.clone();
    }

    pub fn active_session(&self) -> Option<SessionId> {
        return lock(&self.shared).active;
    }

    pub fn state(&self) -> SessionState {
        if self.active_session().is_some() {
            return SessionState::Streaming;
        }

        return SessionState::Idle;
    }

    /// Drives the loading indicator.
    pub fn is_streaming(&self) -> bool {
        return self.state() == SessionState::Streaming;
    }

    /// Starts a chat generation for `text`. Blank input starts nothing.
    pub fn send_message(&mut self, text: &str) -> Option<SessionHandle> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }

        let system_prompt = self.system_prompt.to_string();
        let model = self.model.to_string();

        return Some(self.start(
            ChatMessage::new(Role::User, text),
            GenerationKind::Chat,
            move |transcript, target| {
                let mut messages = vec![];
                if !system_prompt.is_empty() {
                    messages.push(RelayMessage::new(Role::System, &system_prompt));
                }
                messages.extend(transcript.history_before(target));

                return RelayRequest::new(&model, messages);
            },
        ));
    }

    /// Starts a summary of `document`. Only the document itself is sent
    /// upstream, without prior conversation.
    pub fn summarize_document(&mut self, document: &str) -> Option<SessionHandle> {
        if document.trim().is_empty() {
            return None;
        }

        let request = RelayRequest::new(
            &self.model,
            vec![RelayMessage::new(
                Role::User,
                &format!("{SUMMARY_REQUEST_PREFIX}{document}"),
            )],
        );

        return Some(self.start(
            ChatMessage::new(
                Role::User,
                &format!("{SUMMARY_TRANSCRIPT_PREFIX}{document}"),
            ),
            GenerationKind::Summary,
            move |_, _| return request,
        ));
    }

    /// Cancels the in-flight generation, if any. Its entry keeps whatever it
    /// held and receives no error message.
    pub fn cancel(&mut self) -> bool {
        if let Some(session) = self.session.take() {
            let mut shared = lock(&self.shared);
            session.token.cancel();
            if shared.active == Some(session.id) {
                shared.active = None;
                tracing::info!(session = %session.id, "Cancelled session");
                return true;
            }
        }

        return false;
    }

    fn start<F>(&mut self, message: ChatMessage, kind: GenerationKind, build: F) -> SessionHandle
    where
        F: FnOnce(&Transcript, MessageId) -> RelayRequest,
    {
        self.next_id += 1;
        let id = SessionId(self.next_id);
        let token = CancellationToken::new();

        let (target, request) = {
            let mut shared = lock(&self.shared);
            if let Some(previous) = self.session.take() {
                previous.token.cancel();
                tracing::info!(session = %previous.id, superseded_by = %id, "Superseded session");
            }

            let target = shared.transcript.begin_generation(message);
            let request = build(&shared.transcript, target);
            shared.active = Some(id);

            (target, request)
        };

        tracing::debug!(session = %id, target = %target, messages = request.messages.len(), "Starting session");

        let ctx = SessionContext {
            id,
            target,
            kind,
            shared: self.shared.clone(),
            tx: self.tx.clone(),
        };
        tokio::spawn(run_session(
            self.source.clone(),
            request,
            ctx,
            token.clone(),
        ));

        self.session = Some(Session { id, token });

        return SessionHandle {
            session: id,
            target,
        };
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            session.token.cancel();
        }
    }
}

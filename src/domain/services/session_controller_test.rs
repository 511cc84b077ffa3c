use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::bail;
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::channel::mpsc as stream_channel;
use futures::StreamExt;
use test_utils::delta_frame;
use test_utils::done_frame;
use tokio::sync::mpsc;

use super::SessionContext;
use super::SessionController;
use super::Shared;
use super::SUMMARY_REQUEST_PREFIX;
use super::SUMMARY_TRANSCRIPT_PREFIX;
use crate::domain::models::ByteStream;
use crate::domain::models::ChatMessage;
use crate::domain::models::CompletionSource;
use crate::domain::models::Event;
use crate::domain::models::GenerationKind;
use crate::domain::models::RelayMessage;
use crate::domain::models::RelayRequest;
use crate::domain::models::Role;
use crate::domain::models::SessionId;
use crate::domain::models::SessionOutcome;
use crate::domain::models::SessionState;
use crate::domain::models::StreamEvent;
use crate::domain::services::Transcript;

type ChunkSender = stream_channel::UnboundedSender<Result<Bytes, io::Error>>;

/// Hands out pre-queued streams in order and records every request.
#[derive(Default)]
struct ScriptedSource {
    streams: Mutex<VecDeque<Result<ByteStream>>>,
    requests: Mutex<Vec<RelayRequest>>,
}

impl ScriptedSource {
    fn push_stream(&self) -> ChunkSender {
        let (tx, rx) = stream_channel::unbounded::<Result<Bytes, io::Error>>();
        self.streams.lock().unwrap().push_back(Ok(rx.boxed()));
        return tx;
    }

    fn push_error(&self, message: &str) {
        self.streams
            .lock()
            .unwrap()
            .push_back(Err(anyhow::anyhow!(message.to_string())));
    }

    fn requests(&self) -> Vec<RelayRequest> {
        return self.requests.lock().unwrap().clone();
    }
}

#[async_trait]
impl CompletionSource for ScriptedSource {
    async fn open(&self, request: &RelayRequest) -> Result<ByteStream> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(stream) = self.streams.lock().unwrap().pop_front() {
            return stream;
        }

        bail!("No scripted stream left");
    }
}

fn setup() -> (
    Arc<ScriptedSource>,
    SessionController,
    mpsc::UnboundedReceiver<Event>,
) {
    let source = Arc::new(ScriptedSource::default());
    let (tx, rx) = mpsc::unbounded_channel::<Event>();
    let controller = SessionController::new(source.clone(), "gpt-4o-mini", "Be helpful.", tx);

    return (source, controller, rx);
}

fn send(tx: &ChunkSender, frame: &str) {
    let _ = tx.unbounded_send(Ok(Bytes::from(frame.to_string())));
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    return tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed");
}

async fn wait_for_end(rx: &mut mpsc::UnboundedReceiver<Event>, session: SessionId) -> SessionOutcome {
    loop {
        if let Event::SessionEnded {
            session: ended,
            outcome,
            ..
        } = next_event(rx).await
        {
            if ended == session {
                return outcome;
            }
        }
    }
}

#[tokio::test]
async fn it_accumulates_fragments_and_completes() -> Result<()> {
    let (source, mut controller, mut rx) = setup();
    let upstream = source.push_stream();

    let handle = controller.send_message("Hello?").unwrap();
    assert!(controller.is_streaming());
    assert_eq!(controller.state(), SessionState::Streaming);

    send(&upstream, &delta_frame("Hi"));
    send(&upstream, &delta_frame(" there"));
    send(&upstream, done_frame());

    let outcome = wait_for_end(&mut rx, handle.session).await;
    assert_eq!(outcome, SessionOutcome::Completed);
    assert!(!controller.is_streaming());
    assert_eq!(controller.state(), SessionState::Idle);

    let transcript = controller.transcript();
    assert_eq!(transcript.len(), 2);
    assert_eq!(transcript.messages()[0].content, "Hello?");
    assert_eq!(transcript.get(handle.target).unwrap().content, "Hi there");

    return Ok(());
}

#[tokio::test]
async fn it_emits_fragments_in_order() {
    let (source, mut controller, mut rx) = setup();
    let upstream = source.push_stream();
    let handle = controller.send_message("Count").unwrap();

    let expected = ["one ", "two ", "three"];
    send(&upstream, &expected.map(delta_frame).join(""));
    send(&upstream, done_frame());

    let mut received = vec![];
    loop {
        match next_event(&mut rx).await {
            Event::Fragment { target, text } => {
                assert_eq!(target, handle.target);
                received.push(text);
            }
            Event::SessionEnded { outcome, .. } => {
                assert_eq!(outcome, SessionOutcome::Completed);
                break;
            }
            Event::Failed { .. } => panic!("unexpected failure"),
        }
    }

    assert_eq!(received, expected);
    assert_eq!(
        controller.transcript().get(handle.target).unwrap().content,
        "one two three"
    );
}

#[tokio::test]
async fn it_fails_when_stream_ends_without_sentinel() {
    let (source, mut controller, mut rx) = setup();
    let upstream = source.push_stream();
    let handle = controller.send_message("Hello?").unwrap();

    send(&upstream, &delta_frame("partial"));
    drop(upstream);

    let outcome = wait_for_end(&mut rx, handle.session).await;
    assert_eq!(outcome, SessionOutcome::Failed);
    assert_eq!(
        controller.transcript().get(handle.target).unwrap().content,
        GenerationKind::Chat.error_message()
    );
    assert!(!controller.is_streaming());
}

#[tokio::test]
async fn it_completes_on_sentinel_before_transport_close() {
    let (source, mut controller, mut rx) = setup();
    let upstream = source.push_stream();
    let handle = controller.send_message("Hello?").unwrap();

    send(&upstream, &format!("{}{}", delta_frame("done"), done_frame()));

    // The sender is still open, so the transport hasn't closed.
    let outcome = wait_for_end(&mut rx, handle.session).await;
    assert_eq!(outcome, SessionOutcome::Completed);
    assert_eq!(
        controller.transcript().get(handle.target).unwrap().content,
        "done"
    );
    drop(upstream);
}

#[tokio::test]
async fn it_fails_on_mid_stream_transport_error() {
    let (source, mut controller, mut rx) = setup();
    let upstream = source.push_stream();
    let handle = controller.send_message("Hello?").unwrap();

    send(&upstream, &delta_frame("partial"));
    let _ = upstream.unbounded_send(Err(io::Error::new(
        io::ErrorKind::ConnectionReset,
        "connection reset",
    )));

    let outcome = wait_for_end(&mut rx, handle.session).await;
    assert_eq!(outcome, SessionOutcome::Failed);
    assert_eq!(
        controller.transcript().get(handle.target).unwrap().content,
        GenerationKind::Chat.error_message()
    );
}

#[tokio::test]
async fn it_fails_when_stream_cannot_open() {
    let (source, mut controller, mut rx) = setup();
    source.push_error("429 Too Many Requests");
    let handle = controller.send_message("Hello?").unwrap();

    let outcome = wait_for_end(&mut rx, handle.session).await;
    assert_eq!(outcome, SessionOutcome::Failed);
    assert_eq!(
        controller.transcript().get(handle.target).unwrap().content,
        "An error occurred while generating a response."
    );
}

#[tokio::test]
async fn it_keeps_decoding_after_malformed_frame() {
    let (source, mut controller, mut rx) = setup();
    let upstream = source.push_stream();
    let handle = controller.send_message("Hello?").unwrap();

    send(&upstream, &delta_frame("a"));
    send(&upstream, "data: {not json}\n\n");
    send(&upstream, &delta_frame("b"));
    send(&upstream, done_frame());

    let outcome = wait_for_end(&mut rx, handle.session).await;
    assert_eq!(outcome, SessionOutcome::Completed);
    assert_eq!(
        controller.transcript().get(handle.target).unwrap().content,
        "ab"
    );
}

#[tokio::test]
async fn it_never_writes_to_superseded_session() {
    let (source, mut controller, mut rx) = setup();
    let first_upstream = source.push_stream();
    let second_upstream = source.push_stream();

    let first = controller.send_message("First").unwrap();
    send(&first_upstream, &delta_frame("A1"));
    match next_event(&mut rx).await {
        Event::Fragment { target, text } => {
            assert_eq!(target, first.target);
            assert_eq!(text, "A1");
        }
        _ => panic!("expected a fragment"),
    }

    let second = controller.send_message("Second").unwrap();
    assert_eq!(controller.active_session(), Some(second.session));
    let frozen = controller.transcript().get(first.target).unwrap().clone();

    send(&first_upstream, &delta_frame("A2"));
    send(&first_upstream, done_frame());
    send(&second_upstream, &delta_frame("B1"));
    send(&second_upstream, done_frame());

    let mut outcomes = vec![];
    while outcomes.len() < 2 {
        match next_event(&mut rx).await {
            Event::Fragment { target, .. } => assert_eq!(target, second.target),
            Event::Failed { .. } => panic!("unexpected failure"),
            Event::SessionEnded {
                session, outcome, ..
            } => outcomes.push((session, outcome)),
        }
    }

    assert!(outcomes.contains(&(first.session, SessionOutcome::Cancelled)));
    assert!(outcomes.contains(&(second.session, SessionOutcome::Completed)));

    let transcript = controller.transcript();
    assert_eq!(transcript.get(first.target).unwrap(), &frozen);
    assert_eq!(transcript.get(first.target).unwrap().content, "A1");
    assert_eq!(transcript.get(second.target).unwrap().content, "B1");
    assert_eq!(transcript.len(), 4);
}

#[tokio::test]
async fn it_does_not_write_error_into_cancelled_session() {
    let (source, mut controller, mut rx) = setup();
    let upstream = source.push_stream();
    let handle = controller.send_message("Hello?").unwrap();

    send(&upstream, &delta_frame("kept"));
    match next_event(&mut rx).await {
        Event::Fragment { text, .. } => assert_eq!(text, "kept"),
        _ => panic!("expected a fragment"),
    }

    assert!(controller.cancel());
    assert!(!controller.is_streaming());
    assert!(!controller.cancel());

    drop(upstream);
    let outcome = wait_for_end(&mut rx, handle.session).await;
    assert_eq!(outcome, SessionOutcome::Cancelled);
    assert_eq!(
        controller.transcript().get(handle.target).unwrap().content,
        "kept"
    );
}

#[tokio::test]
async fn it_ignores_blank_input() {
    let (source, mut controller, _rx) = setup();

    assert!(controller.send_message("   \n").is_none());
    assert!(controller.summarize_document("  ").is_none());
    assert!(controller.transcript().is_empty());
    assert!(!controller.is_streaming());
    assert!(source.requests().is_empty());
}

#[tokio::test]
async fn it_sends_system_prompt_and_history() {
    let (source, mut controller, mut rx) = setup();
    let first_upstream = source.push_stream();
    let second_upstream = source.push_stream();

    let first = controller.send_message(" What is a loan? ").unwrap();
    send(&first_upstream, &delta_frame("Money lent."));
    send(&first_upstream, done_frame());
    wait_for_end(&mut rx, first.session).await;

    let second = controller.send_message("And interest?").unwrap();
    send(&second_upstream, done_frame());
    wait_for_end(&mut rx, second.session).await;

    let requests = source.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].model, "gpt-4o-mini");
    assert_eq!(requests[0].stream, Some(true));
    assert_eq!(
        requests[0].messages,
        vec![
            RelayMessage::new(Role::System, "Be helpful."),
            RelayMessage::new(Role::User, "What is a loan?"),
        ]
    );
    assert_eq!(
        requests[1].messages,
        vec![
            RelayMessage::new(Role::System, "Be helpful."),
            RelayMessage::new(Role::User, "What is a loan?"),
            RelayMessage::new(Role::Assistant, "Money lent."),
            RelayMessage::new(Role::User, "And interest?"),
        ]
    );
}

#[tokio::test]
async fn it_summarizes_documents() {
    let (source, mut controller, mut rx) = setup();
    let upstream = source.push_stream();

    let handle = controller.summarize_document("Clause 1. Repay by June.").unwrap();
    send(&upstream, &delta_frame("Repayment is due in June."));
    send(&upstream, done_frame());
    assert_eq!(
        wait_for_end(&mut rx, handle.session).await,
        SessionOutcome::Completed
    );

    let transcript = controller.transcript();
    assert_eq!(
        transcript.messages()[0].content,
        format!("{SUMMARY_TRANSCRIPT_PREFIX}Clause 1. Repay by June.")
    );
    assert_eq!(
        transcript.get(handle.target).unwrap().content,
        "Repayment is due in June."
    );

    let requests = source.requests();
    assert_eq!(
        requests[0].messages,
        vec![RelayMessage::new(
            Role::User,
            &format!("{SUMMARY_REQUEST_PREFIX}Clause 1. Repay by June.")
        )]
    );
}

#[tokio::test]
async fn it_uses_summary_error_message() {
    let (source, mut controller, mut rx) = setup();
    source.push_error("upstream down");

    let handle = controller.summarize_document("Some text").unwrap();
    wait_for_end(&mut rx, handle.session).await;

    assert_eq!(
        controller.transcript().get(handle.target).unwrap().content,
        "An error occurred while summarizing the document."
    );
}

#[test]
fn it_cancels_a_superseded_session_that_saw_the_sentinel() {
    let mut transcript = Transcript::new();
    let target = transcript.begin_generation(ChatMessage::new(Role::User, "Hi"));
    let shared = Arc::new(Mutex::new(Shared {
        transcript,
        active: Some(SessionId(2)),
    }));
    let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
    let ctx = SessionContext {
        id: SessionId(1),
        target,
        kind: GenerationKind::Chat,
        shared: shared.clone(),
        tx,
    };

    let outcome = ctx.apply(vec![StreamEvent::Done]);
    assert_eq!(outcome, Some(SessionOutcome::Cancelled));

    ctx.end(SessionOutcome::Completed);
    assert_eq!(
        rx.try_recv().unwrap(),
        Event::SessionEnded {
            session: SessionId(1),
            target,
            outcome: SessionOutcome::Cancelled,
        }
    );
    assert_eq!(shared.lock().unwrap().active, Some(SessionId(2)));
}

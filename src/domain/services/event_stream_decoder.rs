#[cfg(test)]
#[path = "event_stream_decoder_test.rs"]
mod tests;

use crate::domain::models::CompletionChunk;
use crate::domain::models::StreamEvent;
use crate::domain::models::DONE_SENTINEL;

const DATA_FIELD: &str = "data:";

/// Turns an arbitrarily chunked SSE byte stream into completion events.
///
/// Bytes are buffered until a full line is available, so neither a line nor a
/// multi-byte character split across two reads is lost. A blank line
/// dispatches the pending event.
#[derive(Default)]
pub struct EventStreamDecoder {
    buffer: Vec<u8>,
    data_lines: Vec<String>,
    finished: bool,
}

impl EventStreamDecoder {
    pub fn new() -> EventStreamDecoder {
        return EventStreamDecoder::default();
    }

    /// True once the sentinel has been seen. All later input is ignored.
    pub fn is_finished(&self) -> bool {
        return self.finished;
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        let mut events = vec![];
        if self.finished {
            return events;
        }

        // Leftover bytes hold no newline, so only the new chunk needs scanning.
        let mut search_from = self.buffer.len();
        let mut consumed = 0;
        self.buffer.extend_from_slice(chunk);

        while let Some(offset) = self.buffer[search_from..]
            .iter()
            .position(|b| return *b == b'\n')
        {
            let end = search_from + offset;
            let line = String::from_utf8_lossy(&self.buffer[consumed..end]).to_string();
            consumed = end + 1;
            search_from = consumed;

            self.handle_line(line.strip_suffix('\r').unwrap_or(&line), &mut events);
            if self.finished {
                self.buffer.clear();
                return events;
            }
        }

        self.buffer.drain(..consumed);
        return events;
    }

    /// Called when the transport closes. Dispatches an event whose trailing
    /// blank line never arrived.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = vec![];
        if self.finished {
            return events;
        }

        if !self.buffer.is_empty() {
            let raw = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&raw).to_string();
            self.handle_line(line.strip_suffix('\r').unwrap_or(&line), &mut events);
        }
        if !self.finished {
            self.dispatch(&mut events);
        }

        return events;
    }

    fn handle_line(&mut self, line: &str, events: &mut Vec<StreamEvent>) {
        if line.is_empty() {
            self.dispatch(events);
            return;
        }

        // Comments, and fields other than data, carry nothing we render.
        if let Some(value) = line.strip_prefix(DATA_FIELD) {
            let value = value.strip_prefix(' ').unwrap_or(value);
            self.data_lines.push(value.to_string());
        }
    }

    fn dispatch(&mut self, events: &mut Vec<StreamEvent>) {
        if self.data_lines.is_empty() {
            return;
        }

        let data = self.data_lines.join("\n");
        self.data_lines.clear();

        let payload = data.trim();
        if payload.is_empty() {
            return;
        }

        if payload == DONE_SENTINEL {
            self.finished = true;
            events.push(StreamEvent::Done);
            return;
        }

        match serde_json::from_str::<CompletionChunk>(payload) {
            Ok(chunk) => {
                if let Some(text) = chunk.fragment() {
                    events.push(StreamEvent::Fragment(text.to_string()));
                }
            }
            Err(err) => {
                tracing::debug!(error = ?err, payload = payload, "Dropping malformed frame");
            }
        }
    }
}

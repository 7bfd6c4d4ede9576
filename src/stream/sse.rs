//! SSE (Server-Sent Events) frame parser, encoder, and stream utilities.
//!
//! Handles buffering of partial lines across arbitrary chunk boundaries and
//! the field semantics of the
//! [SSE specification](https://html.spec.whatwg.org/multipage/server-sent-events.html).
use super::SseEvent;
use futures_util::Stream;
use memchr::memchr_iter;
use smallvec::SmallVec;

/// Literal `[DONE]` frame that terminates a Chat Completions stream.
pub const DONE_FRAME: &str = "data: [DONE]\n\n";

struct PendingEvents {
    events: SmallVec<[SseEvent; 8]>,
    head: usize,
}

impl PendingEvents {
    #[inline]
    fn new() -> Self {
        Self {
            events: SmallVec::new(),
            head: 0,
        }
    }

    #[inline]
    fn pop_front(&mut self) -> Option<SseEvent> {
        if self.head >= self.events.len() {
            return None;
        }
        let event = std::mem::take(&mut self.events[self.head]);
        self.head += 1;
        if self.head == self.events.len() {
            self.events.clear();
            self.head = 0;
        }
        Some(event)
    }

    #[inline]
    fn extend_from_vec(&mut self, parsed: &mut Vec<SseEvent>) {
        self.events.extend(parsed.drain(..));
    }
}

// ---------------------------------------------------------------------------
// SseParser: incremental SSE line parser
// ---------------------------------------------------------------------------

/// Incremental SSE line parser.
///
/// Feed it raw text chunks (potentially arriving in arbitrary byte
/// boundaries) and it yields fully-assembled [`SseEvent`] frames.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    read_offset: usize,
    fields: FrameFields,
}

#[derive(Debug, Default)]
struct FrameFields {
    event_type: Option<String>,
    data_buffer: String,
    has_data: bool,
    last_event_id: Option<String>,
    retry: Option<u64>,
}

impl SseParser {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw text and return any complete events parsed.
    ///
    /// - `event:` sets the event type for the next frame
    /// - `data:` appends to the data buffer (one leading space stripped);
    ///   multiple `data:` lines are joined with `\n`
    /// - an empty line terminates a frame
    /// - lines starting with `:` are comments
    /// - `id:` and `retry:` are carried on the emitted event
    pub fn feed(&mut self, chunk: &str) -> Vec<SseEvent> {
        let mut out = Vec::new();
        self.feed_into(chunk, &mut out);
        out
    }

    /// Feed raw text and append complete events into a caller-provided buffer.
    pub fn feed_into(&mut self, chunk: &str, out: &mut Vec<SseEvent>) {
        self.buffer.push_str(chunk);
        let mut processed_up_to = self.read_offset;
        let scan_start = processed_up_to;
        for rel_pos in memchr_iter(b'\n', &self.buffer.as_bytes()[scan_start..]) {
            let line_end = scan_start + rel_pos;
            let line = &self.buffer[processed_up_to..line_end];
            self.fields
                .process_line(line.strip_suffix('\r').unwrap_or(line), out);
            processed_up_to = line_end + 1;
        }

        self.read_offset = processed_up_to;
        if self.read_offset == self.buffer.len() {
            self.buffer.clear();
            self.read_offset = 0;
            return;
        }
        let should_compact = self.read_offset > 0
            && (self.read_offset >= self.buffer.len() / 2 || self.read_offset >= 8 * 1024);
        if should_compact {
            self.buffer.drain(..self.read_offset);
            self.read_offset = 0;
        }
    }

    /// Flush a trailing frame that was never terminated by a blank line.
    pub fn finish_into(&mut self, out: &mut Vec<SseEvent>) {
        if self.read_offset < self.buffer.len() {
            let rest = &self.buffer[self.read_offset..];
            self.fields
                .process_line(rest.strip_suffix('\r').unwrap_or(rest), out);
        }
        self.buffer.clear();
        self.read_offset = 0;
        self.fields.process_line("", out);
    }
}

impl FrameFields {
    fn process_line(&mut self, line: &str, events: &mut Vec<SseEvent>) {
        if line.is_empty() {
            if self.has_data {
                events.push(SseEvent {
                    event: self.event_type.take(),
                    data: std::mem::take(&mut self.data_buffer),
                    id: self.last_event_id.clone(),
                    retry: self.retry.take(),
                });
                self.has_data = false;
            }
            return;
        }

        if line.starts_with(':') {
            return;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "data" => {
                if self.has_data {
                    self.data_buffer.push('\n');
                } else {
                    self.has_data = true;
                }
                self.data_buffer.push_str(value);
            }
            "event" => self.event_type = Some(value.to_string()),
            "id" => self.last_event_id = Some(value.to_string()),
            "retry" => self.retry = value.trim().parse().ok(),
            _ => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Encoding helpers
// ---------------------------------------------------------------------------

/// Encode an [`SseEvent`] into SSE wire text.
#[must_use]
pub fn encode_sse_event(event: &SseEvent) -> String {
    let mut out = String::with_capacity(16 + event.data.len());
    if let Some(name) = event.event.as_deref() {
        out.push_str("event: ");
        out.push_str(name);
        out.push('\n');
    }
    for line in event.data.split('\n') {
        out.push_str("data: ");
        out.push_str(line);
        out.push('\n');
    }
    if let Some(id) = event.id.as_deref() {
        out.push_str("id: ");
        out.push_str(id);
        out.push('\n');
    }
    out.push('\n');
    out
}

/// Format a data-only frame (Chat Completions style).
#[must_use]
pub fn data_sse_frame(json: &str) -> String {
    let mut out = String::with_capacity(8 + json.len());
    out.push_str("data: ");
    out.push_str(json);
    out.push_str("\n\n");
    out
}

/// Format a frame with a named event type (Messages and Responses style).
#[must_use]
pub fn named_sse_frame(event_type: &str, json: &str) -> String {
    let mut out = String::with_capacity(17 + event_type.len() + json.len());
    out.push_str("event: ");
    out.push_str(event_type);
    out.push('\n');
    out.push_str("data: ");
    out.push_str(json);
    out.push_str("\n\n");
    out
}

/// True for the Chat Completions `[DONE]` sentinel.
#[must_use]
pub fn is_done_event(event: &SseEvent) -> bool {
    event.data.trim() == "[DONE]"
}

// ---------------------------------------------------------------------------
// Stream utility
// ---------------------------------------------------------------------------

/// Split a byte stream into SSE events using [`SseParser`].
///
/// Multi-byte characters split across chunks are carried over until they
/// complete. A transport error ends the stream after a warning; the caller's
/// transcoder then finalizes whatever was received.
pub fn sse_frame_stream<S, E>(byte_stream: S) -> impl Stream<Item = SseEvent> + Send
where
    S: Stream<Item = Result<bytes::Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    use futures_util::StreamExt;

    struct State<S> {
        stream: std::pin::Pin<Box<S>>,
        parser: SseParser,
        remainder: Vec<u8>,
        parsed: Vec<SseEvent>,
        pending: PendingEvents,
        ended: bool,
    }

    let state = State {
        stream: Box::pin(byte_stream),
        parser: SseParser::new(),
        remainder: Vec::new(),
        parsed: Vec::with_capacity(8),
        pending: PendingEvents::new(),
        ended: false,
    };

    futures_util::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.pending.pop_front() {
                return Some((event, state));
            }
            if state.ended {
                return None;
            }

            match state.stream.as_mut().next().await {
                Some(Ok(bytes)) => {
                    state.remainder.extend_from_slice(&bytes);
                    // hold back only a multi-byte char split across chunks
                    let valid_up_to = match std::str::from_utf8(&state.remainder) {
                        Err(e) if e.error_len().is_none() => e.valid_up_to(),
                        _ => state.remainder.len(),
                    };
                    let tail = state.remainder.split_off(valid_up_to);
                    let text = String::from_utf8_lossy(&state.remainder);
                    state.parser.feed_into(&text, &mut state.parsed);
                    state.remainder = tail;
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "upstream byte stream failed; ending SSE stream");
                    state.ended = true;
                    state.parser.finish_into(&mut state.parsed);
                }
                None => {
                    state.ended = true;
                    if !state.remainder.is_empty() {
                        tracing::debug!(bytes = state.remainder.len(), "dropping incomplete UTF-8 tail");
                        state.remainder.clear();
                    }
                    state.parser.finish_into(&mut state.parsed);
                }
            }
            state.pending.extend_from_vec(&mut state.parsed);
        }
    })
}

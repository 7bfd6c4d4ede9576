//! Streaming: SSE framing, per-protocol wire events, and the transcoder that
//! turns one protocol's event stream into another's.

pub mod accumulator;
pub mod pipeline;
pub mod sse;
pub mod tool_args;
pub mod transcoder;

pub use accumulator::WireAccumulator;
pub use pipeline::{transcode_sse_stream, transcode_stream};
pub use sse::{sse_frame_stream, SseParser};
pub use transcoder::StreamTranscoder;

use crate::error::CanonicalError;
use crate::protocol::anthropic::AnthropicStreamEvent;
use crate::protocol::canonical::WireApi;
use crate::protocol::openai_chat::OpenAiStreamChunk;
use crate::protocol::openai_responses::ResponsesStreamEvent;

/// A parsed SSE frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
    pub retry: Option<u64>,
}

/// Parse the first complete SSE frame in `raw`.
///
/// A frame missing its terminating blank line is still accepted.
#[must_use]
pub fn parse_sse_frame(raw: &str) -> Option<SseEvent> {
    let mut parser = SseParser::new();
    let mut events = Vec::with_capacity(1);
    parser.feed_into(raw, &mut events);
    if events.is_empty() {
        parser.finish_into(&mut events);
    }
    events.into_iter().next()
}

/// Parse the first complete SSE frame in `raw` bytes.
#[must_use]
pub fn parse_sse_frame_bytes(raw: &[u8]) -> Option<SseEvent> {
    parse_sse_frame(std::str::from_utf8(raw).ok()?)
}

/// One decoded event of a protocol's stream.
#[derive(Debug, Clone, PartialEq)]
pub enum WireStreamEvent {
    Anthropic(AnthropicStreamEvent),
    OpenAiChat(OpenAiStreamChunk),
    /// The Chat Completions `data: [DONE]` sentinel.
    OpenAiChatDone,
    Responses(ResponsesStreamEvent),
}

impl WireStreamEvent {
    /// Decode an SSE frame of the given protocol. Frames that do not parse
    /// are logged and skipped.
    #[must_use]
    pub fn decode(api: WireApi, frame: &SseEvent) -> Option<Self> {
        let data = frame.data.trim();
        if data.is_empty() {
            return None;
        }
        let decoded = match api {
            WireApi::Anthropic => {
                serde_json::from_str::<AnthropicStreamEvent>(data).map(WireStreamEvent::Anthropic)
            }
            WireApi::OpenAiChat => {
                if data == "[DONE]" {
                    return Some(WireStreamEvent::OpenAiChatDone);
                }
                serde_json::from_str::<OpenAiStreamChunk>(data).map(WireStreamEvent::OpenAiChat)
            }
            WireApi::OpenAiResponses => {
                serde_json::from_str::<ResponsesStreamEvent>(data).map(WireStreamEvent::Responses)
            }
        };
        match decoded {
            Ok(event) => Some(event),
            Err(e) => {
                tracing::debug!(
                    api = %api,
                    event = ?frame.event,
                    error = %e,
                    "skipping undecodable SSE frame"
                );
                None
            }
        }
    }

    #[must_use]
    pub fn api(&self) -> WireApi {
        match self {
            WireStreamEvent::Anthropic(_) => WireApi::Anthropic,
            WireStreamEvent::OpenAiChat(_) | WireStreamEvent::OpenAiChatDone => WireApi::OpenAiChat,
            WireStreamEvent::Responses(_) => WireApi::OpenAiResponses,
        }
    }

    /// True for events after which the protocol sends nothing more.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        match self {
            WireStreamEvent::Anthropic(event) => matches!(
                event,
                AnthropicStreamEvent::MessageStop {} | AnthropicStreamEvent::Error { .. }
            ),
            WireStreamEvent::OpenAiChat(chunk) => chunk.error.is_some(),
            WireStreamEvent::OpenAiChatDone => true,
            WireStreamEvent::Responses(event) => matches!(
                event,
                ResponsesStreamEvent::ResponseCompleted { .. }
                    | ResponsesStreamEvent::ResponseIncomplete { .. }
                    | ResponsesStreamEvent::ResponseFailed { .. }
                    | ResponsesStreamEvent::Error { .. }
            ),
        }
    }

    /// Value of the SSE `event:` line, if the protocol names its events.
    #[must_use]
    pub fn event_name(&self) -> Option<&'static str> {
        match self {
            WireStreamEvent::Anthropic(event) => Some(event.event_name()),
            WireStreamEvent::Responses(event) => Some(event.event_name()),
            WireStreamEvent::OpenAiChat(_) | WireStreamEvent::OpenAiChatDone => None,
        }
    }

    /// Render as SSE wire text.
    ///
    /// # Errors
    ///
    /// Returns [`CanonicalError::Internal`] if the payload fails to serialize.
    pub fn to_sse(&self) -> Result<String, CanonicalError> {
        let json = match self {
            WireStreamEvent::Anthropic(event) => serde_json::to_string(event),
            WireStreamEvent::OpenAiChat(chunk) => serde_json::to_string(chunk),
            WireStreamEvent::OpenAiChatDone => return Ok(sse::DONE_FRAME.to_string()),
            WireStreamEvent::Responses(event) => serde_json::to_string(event),
        }
        .map_err(|e| CanonicalError::Internal(format!("failed to serialize stream event: {e}")))?;
        Ok(match self.event_name() {
            Some(name) => sse::named_sse_frame(name, &json),
            None => sse::data_sse_frame(&json),
        })
    }
}

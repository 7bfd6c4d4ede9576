//! Protocol-agnostic front for the per-protocol accumulators.

use crate::protocol::anthropic::accumulator::AnthropicAccumulator;
use crate::protocol::canonical::WireApi;
use crate::protocol::openai_chat::accumulator::ChatAccumulator;
use crate::protocol::openai_responses::accumulator::ResponsesAccumulator;
use crate::protocol::usage::UsageSnapshot;
use crate::translate::WireResponse;

use super::WireStreamEvent;

/// Rebuilds one protocol's non-streaming response from that protocol's own
/// stream. Events of any other protocol are ignored.
#[derive(Debug, Clone)]
pub enum WireAccumulator {
    Anthropic(AnthropicAccumulator),
    OpenAiChat(ChatAccumulator),
    Responses(ResponsesAccumulator),
}

impl WireAccumulator {
    #[must_use]
    pub fn new(api: WireApi) -> Self {
        match api {
            WireApi::Anthropic => WireAccumulator::Anthropic(AnthropicAccumulator::new()),
            WireApi::OpenAiChat => WireAccumulator::OpenAiChat(ChatAccumulator::new()),
            WireApi::OpenAiResponses => WireAccumulator::Responses(ResponsesAccumulator::new()),
        }
    }

    #[must_use]
    pub fn api(&self) -> WireApi {
        match self {
            WireAccumulator::Anthropic(_) => WireApi::Anthropic,
            WireAccumulator::OpenAiChat(_) => WireApi::OpenAiChat,
            WireAccumulator::Responses(_) => WireApi::OpenAiResponses,
        }
    }

    pub fn push(&mut self, event: &WireStreamEvent) {
        match (self, event) {
            (WireAccumulator::Anthropic(acc), WireStreamEvent::Anthropic(ev)) => acc.push(ev),
            (WireAccumulator::OpenAiChat(acc), WireStreamEvent::OpenAiChat(chunk)) => acc.push(chunk),
            (WireAccumulator::OpenAiChat(acc), WireStreamEvent::OpenAiChatDone) => acc.push_done(),
            (WireAccumulator::Responses(acc), WireStreamEvent::Responses(ev)) => acc.push(ev),
            (acc, other) => {
                tracing::debug!(
                    accumulator = %acc.api(),
                    event = %other.api(),
                    "event from another protocol ignored by accumulator"
                );
            }
        }
    }

    /// Response assembled from everything observed so far.
    #[must_use]
    pub fn snapshot(&self) -> WireResponse {
        match self {
            WireAccumulator::Anthropic(acc) => WireResponse::Anthropic(acc.snapshot()),
            WireAccumulator::OpenAiChat(acc) => WireResponse::OpenAiChat(acc.snapshot()),
            WireAccumulator::Responses(acc) => WireResponse::Responses(acc.snapshot()),
        }
    }

    /// The completed response once the stream's terminal event was seen.
    /// Each call returns an independent copy.
    #[must_use]
    pub fn final_response(&self) -> Option<WireResponse> {
        match self {
            WireAccumulator::Anthropic(acc) => acc.final_response().map(WireResponse::Anthropic),
            WireAccumulator::OpenAiChat(acc) => acc.final_response().map(WireResponse::OpenAiChat),
            WireAccumulator::Responses(acc) => acc.final_response().map(WireResponse::Responses),
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        match self {
            WireAccumulator::Anthropic(acc) => acc.is_terminal(),
            WireAccumulator::OpenAiChat(acc) => acc.is_terminal(),
            WireAccumulator::Responses(acc) => acc.is_terminal(),
        }
    }

    /// Message of the error event that ended the stream, if any.
    #[must_use]
    pub fn error_message(&self) -> Option<String> {
        match self {
            WireAccumulator::Anthropic(acc) => acc.error().map(|e| e.message.clone()),
            WireAccumulator::OpenAiChat(acc) => acc.error().map(|e| e.message.clone()),
            WireAccumulator::Responses(acc) => acc.error().map(|e| e.message.clone()),
        }
    }

    /// Usage reported by the stream so far, normalized.
    #[must_use]
    pub fn usage(&self) -> UsageSnapshot {
        match self.snapshot() {
            WireResponse::Anthropic(resp) => UsageSnapshot::from(&resp.usage),
            WireResponse::OpenAiChat(resp) => {
                resp.usage.as_ref().map(UsageSnapshot::from).unwrap_or_default()
            }
            WireResponse::Responses(resp) => {
                resp.usage.as_ref().map(UsageSnapshot::from).unwrap_or_default()
            }
        }
    }
}

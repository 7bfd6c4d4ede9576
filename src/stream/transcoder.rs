use std::collections::BTreeSet;
use std::sync::Arc;

use crate::protocol::anthropic::stream::{AnthropicStreamDecoder, AnthropicStreamEncoder};
use crate::protocol::anthropic::{
    AnthropicContentBlock, AnthropicMessageDeltaBody, AnthropicMessageStart, AnthropicStreamEvent,
};
use crate::protocol::canonical::{CanonicalStopReason, CanonicalStreamEvent, WireApi};
use crate::protocol::envelope::RequestEnvelope;
use crate::protocol::mapping::{canonical_stop_to_anthropic, canonical_stop_to_openai};
use crate::protocol::openai_chat::stream::{ChatStreamDecoder, ChatStreamEncoder};
use crate::protocol::openai_chat::{OpenAiDelta, OpenAiStreamChoice, OpenAiStreamChunk};
use crate::protocol::openai_responses::accumulator::ResponsesAccumulator;
use crate::protocol::openai_responses::stream::{ResponsesStreamDecoder, ResponsesStreamEncoder};
use crate::protocol::openai_responses::{
    ResponsesContentPart, ResponsesOutputItem, ResponsesStreamEvent, ResponsesSummaryPart,
};
use crate::protocol::usage::UsageSnapshot;
use crate::translate::WireResponse;

use super::accumulator::WireAccumulator;
use super::tool_args::finalize_tool_arguments;
use super::{SseEvent, WireStreamEvent};

enum SourceDecoder {
    Anthropic(AnthropicStreamDecoder),
    OpenAiChat(ChatStreamDecoder),
    Responses(ResponsesStreamDecoder),
}

impl SourceDecoder {
    fn new(api: WireApi) -> Self {
        match api {
            WireApi::Anthropic => SourceDecoder::Anthropic(AnthropicStreamDecoder::new()),
            WireApi::OpenAiChat => SourceDecoder::OpenAiChat(ChatStreamDecoder::new()),
            WireApi::OpenAiResponses => SourceDecoder::Responses(ResponsesStreamDecoder::new()),
        }
    }

    fn decode_into(&mut self, event: &WireStreamEvent, out: &mut Vec<CanonicalStreamEvent>) {
        match (self, event) {
            (SourceDecoder::Anthropic(d), WireStreamEvent::Anthropic(ev)) => d.decode_into(ev, out),
            (SourceDecoder::OpenAiChat(d), WireStreamEvent::OpenAiChat(chunk)) => {
                d.decode_into(chunk, out);
            }
            (SourceDecoder::OpenAiChat(d), WireStreamEvent::OpenAiChatDone) => d.done_into(out),
            (SourceDecoder::Responses(d), WireStreamEvent::Responses(ev)) => d.decode_into(ev, out),
            _ => {}
        }
    }

    fn finish_into(&mut self, out: &mut Vec<CanonicalStreamEvent>) {
        match self {
            SourceDecoder::Anthropic(d) => d.finish_into(out),
            SourceDecoder::OpenAiChat(d) => d.finish_into(out),
            SourceDecoder::Responses(d) => d.finish_into(out),
        }
    }
}

enum TargetEncoder {
    Anthropic(AnthropicStreamEncoder),
    OpenAiChat(ChatStreamEncoder),
    Responses(ResponsesStreamEncoder),
}

impl TargetEncoder {
    fn new(source: WireApi, target: WireApi, envelope: Arc<RequestEnvelope>) -> Self {
        match target {
            WireApi::Anthropic => TargetEncoder::Anthropic(AnthropicStreamEncoder::new(envelope)),
            WireApi::OpenAiChat => TargetEncoder::OpenAiChat(ChatStreamEncoder::new(envelope)),
            WireApi::OpenAiResponses => {
                let encoder = ResponsesStreamEncoder::new(envelope);
                TargetEncoder::Responses(if source == WireApi::Anthropic {
                    encoder.with_trailing_signatures()
                } else {
                    encoder
                })
            }
        }
    }

    fn encode_into(&mut self, event: &CanonicalStreamEvent, out: &mut Vec<WireStreamEvent>) {
        match self {
            TargetEncoder::Anthropic(e) => e.encode_into(event, out),
            TargetEncoder::OpenAiChat(e) => e.encode_into(event, out),
            TargetEncoder::Responses(e) => e.encode_into(event, out),
        }
    }

    fn finish_into(&mut self, out: &mut Vec<WireStreamEvent>) {
        match self {
            TargetEncoder::Anthropic(e) => e.finish_into(out),
            TargetEncoder::OpenAiChat(e) => e.finish_into(out),
            TargetEncoder::Responses(e) => e.finish_into(out),
        }
    }

    fn is_finished(&self) -> bool {
        match self {
            TargetEncoder::Anthropic(e) => e.is_finished(),
            TargetEncoder::OpenAiChat(e) => e.is_finished(),
            TargetEncoder::Responses(e) => e.is_finished(),
        }
    }
}

/// Bookkeeping for same-protocol streams, which are forwarded unchanged.
#[derive(Debug, Default)]
struct PassthroughState {
    started: bool,
    open_blocks: BTreeSet<usize>,
    responses: OpenResponsesUnits,
}

/// Responses lifecycle units whose closing event has not been forwarded,
/// keyed by `output_index` (and content or summary index).
#[derive(Debug, Default)]
struct OpenResponsesUnits {
    items: BTreeSet<usize>,
    texts: BTreeSet<(usize, usize)>,
    parts: BTreeSet<(usize, usize)>,
    summary_texts: BTreeSet<(usize, usize)>,
    summary_parts: BTreeSet<(usize, usize)>,
    arguments: BTreeSet<usize>,
}

impl OpenResponsesUnits {
    fn track(&mut self, event: &ResponsesStreamEvent) {
        match event {
            ResponsesStreamEvent::OutputItemAdded { output_index, item, .. } => {
                self.items.insert(*output_index);
                if matches!(item, ResponsesOutputItem::FunctionCall { .. }) {
                    self.arguments.insert(*output_index);
                }
            }
            ResponsesStreamEvent::OutputItemDone { output_index, .. } => {
                self.items.remove(output_index);
                self.arguments.remove(output_index);
                self.texts.retain(|(oi, _)| oi != output_index);
                self.parts.retain(|(oi, _)| oi != output_index);
                self.summary_texts.retain(|(oi, _)| oi != output_index);
                self.summary_parts.retain(|(oi, _)| oi != output_index);
            }
            ResponsesStreamEvent::ContentPartAdded {
                output_index,
                content_index,
                ..
            } => {
                self.parts.insert((*output_index, *content_index));
                self.texts.insert((*output_index, *content_index));
            }
            ResponsesStreamEvent::OutputTextDelta {
                output_index,
                content_index,
                ..
            } => {
                self.texts.insert((*output_index, *content_index));
            }
            ResponsesStreamEvent::OutputTextDone {
                output_index,
                content_index,
                ..
            } => {
                self.texts.remove(&(*output_index, *content_index));
            }
            ResponsesStreamEvent::ContentPartDone {
                output_index,
                content_index,
                ..
            } => {
                self.texts.remove(&(*output_index, *content_index));
                self.parts.remove(&(*output_index, *content_index));
            }
            ResponsesStreamEvent::ReasoningSummaryPartAdded {
                output_index,
                summary_index,
                ..
            } => {
                self.summary_parts.insert((*output_index, *summary_index));
                self.summary_texts.insert((*output_index, *summary_index));
            }
            ResponsesStreamEvent::ReasoningSummaryTextDelta {
                output_index,
                summary_index,
                ..
            } => {
                self.summary_texts.insert((*output_index, *summary_index));
            }
            ResponsesStreamEvent::ReasoningSummaryTextDone {
                output_index,
                summary_index,
                ..
            } => {
                self.summary_texts.remove(&(*output_index, *summary_index));
            }
            ResponsesStreamEvent::ReasoningSummaryPartDone {
                output_index,
                summary_index,
                ..
            } => {
                self.summary_texts.remove(&(*output_index, *summary_index));
                self.summary_parts.remove(&(*output_index, *summary_index));
            }
            ResponsesStreamEvent::FunctionCallArgumentsDone { output_index, .. } => {
                self.arguments.remove(output_index);
            }
            _ => {}
        }
    }

    /// Emit the done events still owed for every open unit, in output order,
    /// and return the closed items.
    fn close_into(
        &mut self,
        accumulator: &ResponsesAccumulator,
        sequence_number: &mut u64,
        out: &mut Vec<WireStreamEvent>,
    ) -> Vec<ResponsesOutputItem> {
        let mut indices: BTreeSet<usize> = self.items.clone();
        indices.extend(self.arguments.iter().copied());
        indices.extend(self.texts.iter().chain(&self.parts).map(|(oi, _)| *oi));
        indices.extend(self.summary_texts.iter().chain(&self.summary_parts).map(|(oi, _)| *oi));

        let mut closed = Vec::new();
        for output_index in indices {
            let Some(mut item) = accumulator.item(output_index).cloned() else {
                tracing::debug!(output_index, "open unit without a tracked item; skipped");
                continue;
            };
            let item_id = item.id().to_string();
            match &mut item {
                ResponsesOutputItem::Message { content, status, .. } => {
                    for (_, content_index) in self.texts.iter().filter(|(oi, _)| *oi == output_index) {
                        let text = match content.get(*content_index) {
                            Some(ResponsesContentPart::OutputText { text, .. }) => text.clone(),
                            _ => continue,
                        };
                        push_numbered(
                            out,
                            sequence_number,
                            |sequence_number| ResponsesStreamEvent::OutputTextDone {
                                item_id: item_id.clone(),
                                output_index,
                                content_index: *content_index,
                                text,
                                sequence_number,
                            },
                        );
                    }
                    for (_, content_index) in self.parts.iter().filter(|(oi, _)| *oi == output_index) {
                        let Some(part) = content.get(*content_index).cloned() else {
                            continue;
                        };
                        push_numbered(
                            out,
                            sequence_number,
                            |sequence_number| ResponsesStreamEvent::ContentPartDone {
                                item_id: item_id.clone(),
                                output_index,
                                content_index: *content_index,
                                part,
                                sequence_number,
                            },
                        );
                    }
                    *status = Some("incomplete".to_string());
                }
                ResponsesOutputItem::Reasoning { summary, status, .. } => {
                    for (_, summary_index) in
                        self.summary_texts.iter().filter(|(oi, _)| *oi == output_index)
                    {
                        let Some(ResponsesSummaryPart::SummaryText { text }) = summary.get(*summary_index)
                        else {
                            continue;
                        };
                        push_numbered(
                            out,
                            sequence_number,
                            |sequence_number| ResponsesStreamEvent::ReasoningSummaryTextDone {
                                item_id: item_id.clone(),
                                output_index,
                                summary_index: *summary_index,
                                text: text.clone(),
                                sequence_number,
                            },
                        );
                    }
                    for (_, summary_index) in
                        self.summary_parts.iter().filter(|(oi, _)| *oi == output_index)
                    {
                        let Some(part) = summary.get(*summary_index).cloned() else {
                            continue;
                        };
                        push_numbered(
                            out,
                            sequence_number,
                            |sequence_number| ResponsesStreamEvent::ReasoningSummaryPartDone {
                                item_id: item_id.clone(),
                                output_index,
                                summary_index: *summary_index,
                                part,
                                sequence_number,
                            },
                        );
                    }
                    *status = Some("incomplete".to_string());
                }
                ResponsesOutputItem::FunctionCall { arguments, status, .. } => {
                    if self.arguments.contains(&output_index) {
                        *arguments = finalize_tool_arguments(arguments, None);
                        push_numbered(
                            out,
                            sequence_number,
                            |sequence_number| ResponsesStreamEvent::FunctionCallArgumentsDone {
                                item_id: item_id.clone(),
                                output_index,
                                arguments: arguments.clone(),
                                sequence_number,
                            },
                        );
                    }
                    *status = Some("incomplete".to_string());
                }
                ResponsesOutputItem::FunctionCallOutput { .. } => {}
            }
            if self.items.contains(&output_index) {
                push_numbered(
                    out,
                    sequence_number,
                    |sequence_number| ResponsesStreamEvent::OutputItemDone {
                        output_index,
                        item: item.clone(),
                        sequence_number,
                    },
                );
            }
            closed.push(item);
        }
        *self = Self::default();
        closed
    }
}

enum Mode {
    Passthrough(PassthroughState),
    Transcode {
        decoder: SourceDecoder,
        encoder: TargetEncoder,
        scratch: Vec<CanonicalStreamEvent>,
        usage: UsageSnapshot,
    },
}

/// Converts one backend stream into the client's protocol.
///
/// Each backend event is decoded once into canonical events and re-encoded
/// for the client. Same-protocol pairs forward events unchanged. In both
/// modes an accumulator observes the backend events, and [`finish`] closes
/// a stream that ended without its terminal event.
///
/// [`finish`]: StreamTranscoder::finish
pub struct StreamTranscoder {
    source: WireApi,
    target: WireApi,
    envelope: Arc<RequestEnvelope>,
    mode: Mode,
    accumulator: WireAccumulator,
    finished: bool,
}

impl StreamTranscoder {
    #[must_use]
    pub fn new(source: WireApi, target: WireApi, envelope: Arc<RequestEnvelope>) -> Self {
        let mode = if source == target {
            Mode::Passthrough(PassthroughState::default())
        } else {
            Mode::Transcode {
                decoder: SourceDecoder::new(source),
                encoder: TargetEncoder::new(source, target, Arc::clone(&envelope)),
                scratch: Vec::with_capacity(8),
                usage: UsageSnapshot::default(),
            }
        };
        Self {
            source,
            target,
            envelope,
            mode,
            accumulator: WireAccumulator::new(source),
            finished: false,
        }
    }

    #[must_use]
    pub fn source(&self) -> WireApi {
        self.source
    }

    #[must_use]
    pub fn target(&self) -> WireApi {
        self.target
    }

    #[must_use]
    pub fn envelope(&self) -> &RequestEnvelope {
        &self.envelope
    }

    #[must_use]
    pub fn is_passthrough(&self) -> bool {
        matches!(self.mode, Mode::Passthrough(_))
    }

    /// True once the client stream has been terminated.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Feed one backend event, appending the client events it produces.
    pub fn push(&mut self, event: &WireStreamEvent, out: &mut Vec<WireStreamEvent>) {
        if self.finished {
            tracing::debug!(api = %self.source, "event after stream end ignored");
            return;
        }
        if event.api() != self.source {
            tracing::debug!(
                expected = %self.source,
                got = %event.api(),
                "event from unexpected protocol skipped"
            );
            return;
        }
        self.accumulator.push(event);

        match &mut self.mode {
            Mode::Passthrough(state) => {
                track_passthrough(state, event);
                out.push(event.clone());
                if event.is_terminal() {
                    self.finished = true;
                }
            }
            Mode::Transcode {
                decoder,
                encoder,
                scratch,
                usage,
            } => {
                scratch.clear();
                decoder.decode_into(event, scratch);
                for canonical in scratch.iter() {
                    if let CanonicalStreamEvent::Usage(reported) = canonical {
                        usage.merge(reported);
                    }
                    encoder.encode_into(canonical, out);
                }
                if encoder.is_finished() {
                    self.finished = true;
                }
            }
        }
    }

    /// Decode an SSE frame of the backend protocol and feed it. Frames that
    /// do not decode are skipped.
    pub fn push_frame(&mut self, frame: &SseEvent, out: &mut Vec<WireStreamEvent>) {
        if let Some(event) = WireStreamEvent::decode(self.source, frame) {
            self.push(&event, out);
        }
    }

    /// Close the client stream from whatever state exists.
    ///
    /// A stream that already saw its terminal event produces nothing; calling
    /// it again is a no-op.
    pub fn finish(&mut self, out: &mut Vec<WireStreamEvent>) {
        if self.finished {
            return;
        }
        tracing::warn!(
            source = %self.source,
            target = %self.target,
            request_id = %self.envelope.request_id,
            "backend stream ended without a terminal event; finalizing"
        );
        match &mut self.mode {
            Mode::Passthrough(state) => {
                passthrough_fallback(self.source, state, &self.accumulator, &self.envelope, out);
            }
            Mode::Transcode {
                decoder,
                encoder,
                scratch,
                usage,
            } => {
                scratch.clear();
                decoder.finish_into(scratch);
                for canonical in scratch.iter() {
                    if let CanonicalStreamEvent::Usage(reported) = canonical {
                        usage.merge(reported);
                    }
                    encoder.encode_into(canonical, out);
                }
                encoder.finish_into(out);
            }
        }
        self.finished = true;
    }

    /// Backend response assembled from the events seen so far.
    #[must_use]
    pub fn snapshot(&self) -> WireResponse {
        self.accumulator.snapshot()
    }

    /// Backend response once its terminal event was seen.
    #[must_use]
    pub fn final_response(&self) -> Option<WireResponse> {
        self.accumulator.final_response()
    }

    /// Usage reported by the backend so far, normalized.
    #[must_use]
    pub fn usage(&self) -> UsageSnapshot {
        match &self.mode {
            Mode::Transcode { usage, .. } if !usage.is_empty() => *usage,
            _ => self.accumulator.usage(),
        }
    }
}

fn push_numbered(
    out: &mut Vec<WireStreamEvent>,
    sequence_number: &mut u64,
    build: impl FnOnce(u64) -> ResponsesStreamEvent,
) {
    out.push(WireStreamEvent::Responses(build(*sequence_number)));
    *sequence_number += 1;
}

fn track_passthrough(state: &mut PassthroughState, event: &WireStreamEvent) {
    state.started = true;
    match event {
        WireStreamEvent::Anthropic(AnthropicStreamEvent::ContentBlockStart { index, .. }) => {
            state.open_blocks.insert(*index);
        }
        WireStreamEvent::Anthropic(AnthropicStreamEvent::ContentBlockStop { index }) => {
            state.open_blocks.remove(index);
        }
        WireStreamEvent::Responses(ev) => state.responses.track(ev),
        _ => {}
    }
}

fn passthrough_fallback(
    api: WireApi,
    state: &mut PassthroughState,
    accumulator: &WireAccumulator,
    envelope: &RequestEnvelope,
    out: &mut Vec<WireStreamEvent>,
) {
    let snapshot = accumulator.snapshot();
    match snapshot {
        WireResponse::Anthropic(response) => {
            if !state.started {
                out.push(WireStreamEvent::Anthropic(AnthropicStreamEvent::MessageStart {
                    message: AnthropicMessageStart {
                        id: envelope.anthropic_message_id(),
                        type_: "message".to_string(),
                        role: "assistant".to_string(),
                        model: envelope.model.clone(),
                        content: Vec::new(),
                        stop_reason: None,
                        stop_sequence: None,
                        usage: Default::default(),
                    },
                }));
            }
            for index in std::mem::take(&mut state.open_blocks) {
                out.push(WireStreamEvent::Anthropic(AnthropicStreamEvent::ContentBlockStop {
                    index,
                }));
            }
            if response.stop_reason.is_none() {
                let has_tools = response
                    .content
                    .iter()
                    .any(|block| matches!(block, AnthropicContentBlock::ToolUse { .. }));
                let reason = if has_tools {
                    CanonicalStopReason::ToolCalls
                } else {
                    CanonicalStopReason::EndOfTurn
                };
                out.push(WireStreamEvent::Anthropic(AnthropicStreamEvent::MessageDelta {
                    delta: AnthropicMessageDeltaBody {
                        stop_reason: Some(canonical_stop_to_anthropic(reason).to_string()),
                        stop_sequence: None,
                    },
                    usage: response.usage.clone(),
                }));
            }
            out.push(WireStreamEvent::Anthropic(AnthropicStreamEvent::MessageStop {}));
        }
        WireResponse::OpenAiChat(response) => {
            let has_finish = match accumulator {
                WireAccumulator::OpenAiChat(acc) => acc.has_finish_reason(),
                _ => false,
            };
            if !has_finish {
                let has_tools = response
                    .choices
                    .first()
                    .is_some_and(|choice| choice.message.tool_calls.is_some());
                let reason = if has_tools {
                    CanonicalStopReason::ToolCalls
                } else {
                    CanonicalStopReason::EndOfTurn
                };
                let id = if response.id.is_empty() {
                    envelope.chat_completion_id()
                } else {
                    response.id
                };
                let model = if response.model.is_empty() {
                    envelope.model.clone()
                } else {
                    response.model
                };
                out.push(WireStreamEvent::OpenAiChat(OpenAiStreamChunk {
                    id,
                    object: "chat.completion.chunk".to_string(),
                    created: response.created.or(Some(envelope.created_at)),
                    model,
                    choices: vec![OpenAiStreamChoice {
                        index: 0,
                        delta: OpenAiDelta::default(),
                        finish_reason: Some(canonical_stop_to_openai(reason).to_string()),
                    }],
                    usage: None,
                    error: None,
                }));
            }
            out.push(WireStreamEvent::OpenAiChatDone);
        }
        WireResponse::Responses(mut response) => {
            let mut sequence_number = 0;
            if let WireAccumulator::Responses(acc) = accumulator {
                sequence_number = acc.last_sequence_number().map_or(0, |n| n + 1);
                let closed = state.responses.close_into(acc, &mut sequence_number, out);
                for item in closed {
                    match response.output.iter_mut().find(|existing| existing.id() == item.id()) {
                        Some(existing) => *existing = item,
                        None => response.output.push(item),
                    }
                }
            }
            if response.id.is_empty() {
                response.id.clone_from(&envelope.response_id);
                response.model.clone_from(&envelope.model);
                response.created_at = envelope.created_at;
            }
            response.status = Some("incomplete".to_string());
            out.push(WireStreamEvent::Responses(ResponsesStreamEvent::ResponseIncomplete {
                response,
                sequence_number,
            }));
        }
    }
    tracing::debug!(api = %api, "passthrough stream closed with synthesized terminal");
}

use std::collections::BTreeMap;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::protocol::canonical::{BlockKind, CanonicalStopReason, CanonicalStreamEvent};
use crate::protocol::envelope::RequestEnvelope;
use crate::protocol::error_shapes::{openai_error_type_for_status, status_for_openai_error};
use crate::protocol::mapping::{canonical_stop_to_openai, openai_stop_to_canonical};
use crate::protocol::usage::UsageSnapshot;
use crate::stream::tool_args::{finalize_tool_arguments, is_valid_json};
use crate::stream::WireStreamEvent;

use super::{
    OpenAiDelta, OpenAiErrorBody, OpenAiStreamChoice, OpenAiStreamChunk, OpenAiStreamToolCall,
    OpenAiStreamToolCallFunction,
};

// ---------------------------------------------------------------------------
// Source side: Chat chunks -> canonical events
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct PendingTool {
    id: String,
    name: String,
    arguments: String,
}

/// Stateful Chat Completions stream decoder.
///
/// Chat deltas carry no block structure, so the decoder assigns unit indices
/// itself. Text opens a unit on its first delta and is closed before the
/// first tool fragment. Tool fragments are buffered per tool index and
/// parsed once at the terminal signal; an index whose buffer never parses is
/// dropped.
#[derive(Debug, Default)]
pub struct ChatStreamDecoder {
    started: bool,
    next_index: usize,
    reasoning_block: Option<usize>,
    text_block: Option<usize>,
    tools: BTreeMap<u32, PendingTool>,
    tools_flushed: bool,
    emitted_tools: usize,
    stop_seen: bool,
    done: bool,
}

impl ChatStreamDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode_into(&mut self, chunk: &OpenAiStreamChunk, out: &mut Vec<CanonicalStreamEvent>) {
        if self.done {
            return;
        }
        if let Some(error) = &chunk.error {
            out.push(CanonicalStreamEvent::Error {
                status: status_for_openai_error(
                    error.type_.as_deref(),
                    error.code.as_ref().and_then(Value::as_str),
                ),
                message: error.message.clone(),
            });
            self.done = true;
            return;
        }
        if !self.started {
            self.started = true;
            out.push(CanonicalStreamEvent::MessageStart {
                id: (!chunk.id.is_empty()).then(|| chunk.id.clone()),
                model: (!chunk.model.is_empty()).then(|| chunk.model.clone()),
            });
        }

        // only the first choice is translated
        if let Some(choice) = chunk.choices.iter().find(|c| c.index == 0) {
            self.decode_choice(choice, out);
        }

        if let Some(usage) = &chunk.usage {
            let usage = UsageSnapshot::from(usage);
            if !usage.is_empty() {
                out.push(CanonicalStreamEvent::Usage(usage));
            }
        }
    }

    fn decode_choice(&mut self, choice: &OpenAiStreamChoice, out: &mut Vec<CanonicalStreamEvent>) {
        let delta = &choice.delta;
        if let Some(reasoning) = delta.reasoning_content.as_ref().filter(|r| !r.is_empty()) {
            let index = match self.reasoning_block {
                Some(index) => index,
                None => {
                    let index = self.allocate_index();
                    self.reasoning_block = Some(index);
                    out.push(CanonicalStreamEvent::BlockStart {
                        index,
                        kind: BlockKind::Reasoning,
                    });
                    index
                }
            };
            out.push(CanonicalStreamEvent::ReasoningDelta {
                index,
                text: reasoning.clone(),
            });
        }

        let text = delta
            .content
            .as_deref()
            .filter(|c| !c.is_empty())
            .or_else(|| delta.refusal.as_deref().filter(|r| !r.is_empty()));
        if let Some(text) = text {
            self.close_reasoning(out);
            let index = match self.text_block {
                Some(index) => index,
                None => {
                    let index = self.allocate_index();
                    self.text_block = Some(index);
                    out.push(CanonicalStreamEvent::BlockStart {
                        index,
                        kind: BlockKind::Text,
                    });
                    index
                }
            };
            out.push(CanonicalStreamEvent::TextDelta {
                index,
                text: text.to_string(),
            });
        }

        if let Some(tool_calls) = &delta.tool_calls {
            self.close_reasoning(out);
            self.close_text(out);
            for call in tool_calls {
                self.buffer_tool_fragment(call);
            }
        }

        if let Some(reason) = &choice.finish_reason {
            let mut stop_reason = openai_stop_to_canonical(reason);
            self.flush_tools(out);
            if stop_reason == CanonicalStopReason::ToolCalls && self.emitted_tools == 0 {
                tracing::warn!("tool_calls finish without a usable tool call; reporting end of turn");
                stop_reason = CanonicalStopReason::EndOfTurn;
            }
            self.stop_seen = true;
            out.push(CanonicalStreamEvent::MessageEnd { stop_reason });
        }
    }

    fn buffer_tool_fragment(&mut self, call: &OpenAiStreamToolCall) {
        if self.tools_flushed {
            tracing::debug!(index = call.index, "tool fragment after finish; skipped");
            return;
        }
        let pending = self.tools.entry(call.index).or_default();
        if let Some(id) = call.id.as_ref().filter(|id| !id.is_empty()) {
            pending.id.clone_from(id);
        }
        if let Some(function) = &call.function {
            if let Some(name) = function.name.as_ref().filter(|n| !n.is_empty()) {
                pending.name.clone_from(name);
            }
            if let Some(arguments) = &function.arguments {
                pending.arguments.push_str(arguments);
            }
        }
    }

    /// Parse every buffered tool call once and emit the ones that survive.
    fn flush_tools(&mut self, out: &mut Vec<CanonicalStreamEvent>) {
        if self.tools_flushed {
            return;
        }
        self.tools_flushed = true;
        self.close_reasoning(out);
        self.close_text(out);
        for (tool_index, pending) in std::mem::take(&mut self.tools) {
            let trimmed = pending.arguments.trim();
            let arguments = if trimmed.is_empty() {
                "{}".to_string()
            } else if is_valid_json(trimmed) {
                trimmed.to_string()
            } else {
                tracing::warn!(
                    tool_index,
                    tool = %pending.name,
                    "tool call arguments never became valid JSON; dropping the call"
                );
                continue;
            };
            let index = self.allocate_index();
            let id = if pending.id.is_empty() {
                crate::util::next_call_id()
            } else {
                pending.id
            };
            out.push(CanonicalStreamEvent::ToolCallStart {
                index,
                id,
                name: pending.name,
            });
            out.push(CanonicalStreamEvent::ToolCallArgsDelta {
                index,
                delta: arguments.clone(),
            });
            out.push(CanonicalStreamEvent::ToolCallEnd { index, arguments });
            self.emitted_tools += 1;
        }
    }

    fn close_reasoning(&mut self, out: &mut Vec<CanonicalStreamEvent>) {
        if let Some(index) = self.reasoning_block.take() {
            out.push(CanonicalStreamEvent::BlockStop { index });
        }
    }

    fn close_text(&mut self, out: &mut Vec<CanonicalStreamEvent>) {
        if let Some(index) = self.text_block.take() {
            out.push(CanonicalStreamEvent::BlockStop { index });
        }
    }

    fn allocate_index(&mut self) -> usize {
        let index = self.next_index;
        self.next_index += 1;
        index
    }

    /// Handle the `data: [DONE]` sentinel.
    pub fn done_into(&mut self, out: &mut Vec<CanonicalStreamEvent>) {
        if self.done {
            return;
        }
        self.finish_into(out);
        self.done = true;
        out.push(CanonicalStreamEvent::Done);
    }

    /// Settle buffered state when the source ends, with or without `[DONE]`.
    pub fn finish_into(&mut self, out: &mut Vec<CanonicalStreamEvent>) {
        if self.done {
            return;
        }
        self.flush_tools(out);
        if !self.stop_seen {
            self.stop_seen = true;
            tracing::warn!("chat stream ended without finish_reason; reporting end of turn");
            let stop_reason = if self.emitted_tools > 0 {
                CanonicalStopReason::ToolCalls
            } else {
                CanonicalStopReason::EndOfTurn
            };
            out.push(CanonicalStreamEvent::MessageEnd { stop_reason });
        }
    }
}

// ---------------------------------------------------------------------------
// Target side: canonical events -> Chat chunks
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct ToolSlot {
    ordinal: u32,
    fragments: String,
    sent: bool,
}

/// Stateful Chat Completions stream encoder.
///
/// Tool arguments are held per call and sent as one fragment once the call
/// ends (or at the finish chunk), so clients only assemble validated JSON.
#[derive(Debug)]
pub struct ChatStreamEncoder {
    envelope: Arc<RequestEnvelope>,
    id: String,
    role_sent: bool,
    tools: FxHashMap<usize, ToolSlot>,
    next_ordinal: u32,
    usage: UsageSnapshot,
    finish_sent: bool,
    finished: bool,
}

impl ChatStreamEncoder {
    #[must_use]
    pub fn new(envelope: Arc<RequestEnvelope>) -> Self {
        let id = envelope.chat_completion_id();
        Self {
            envelope,
            id,
            role_sent: false,
            tools: FxHashMap::default(),
            next_ordinal: 0,
            usage: UsageSnapshot::default(),
            finish_sent: false,
            finished: false,
        }
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn encode_into(&mut self, event: &CanonicalStreamEvent, out: &mut Vec<WireStreamEvent>) {
        if self.finished {
            return;
        }
        match event {
            CanonicalStreamEvent::MessageStart { .. }
            | CanonicalStreamEvent::BlockStart { .. }
            | CanonicalStreamEvent::BlockStop { .. } => self.ensure_role(out),
            CanonicalStreamEvent::TextDelta { text, .. } => {
                if text.is_empty() {
                    return;
                }
                self.ensure_role(out);
                out.push(self.chunk(
                    OpenAiDelta {
                        content: Some(text.clone()),
                        ..OpenAiDelta::default()
                    },
                    None,
                ));
            }
            CanonicalStreamEvent::ReasoningDelta { text, .. } => {
                if text.is_empty() {
                    return;
                }
                self.ensure_role(out);
                out.push(self.chunk(
                    OpenAiDelta {
                        reasoning_content: Some(text.clone()),
                        ..OpenAiDelta::default()
                    },
                    None,
                ));
            }
            // Chat has no field for reasoning signatures
            CanonicalStreamEvent::ReasoningSignature { .. } => {}
            CanonicalStreamEvent::ToolCallStart { index, id, name } => {
                self.ensure_role(out);
                let ordinal = self.next_ordinal;
                self.next_ordinal += 1;
                self.tools.insert(
                    *index,
                    ToolSlot {
                        ordinal,
                        fragments: String::new(),
                        sent: false,
                    },
                );
                out.push(self.tool_chunk(OpenAiStreamToolCall {
                    index: ordinal,
                    id: Some(id.clone()),
                    type_: Some("function".to_string()),
                    function: Some(OpenAiStreamToolCallFunction {
                        name: Some(name.clone()),
                        arguments: Some(String::new()),
                    }),
                }));
            }
            CanonicalStreamEvent::ToolCallArgsDelta { index, delta } => {
                match self.tools.get_mut(index) {
                    Some(slot) if !slot.sent => slot.fragments.push_str(delta),
                    _ => tracing::debug!(index, "argument delta for an unknown or closed tool call"),
                }
            }
            CanonicalStreamEvent::ToolCallEnd { index, arguments } => {
                if !self.tools.contains_key(index) {
                    tracing::debug!(index, "tool end for an unknown tool call");
                    return;
                }
                self.send_arguments(*index, arguments, out);
            }
            CanonicalStreamEvent::Usage(usage) => self.usage.merge(usage),
            CanonicalStreamEvent::MessageEnd { stop_reason } => {
                self.send_finish(*stop_reason, out);
            }
            CanonicalStreamEvent::Done => self.finish_into(out),
            CanonicalStreamEvent::Error { status, message } => {
                out.push(WireStreamEvent::OpenAiChat(OpenAiStreamChunk {
                    error: Some(OpenAiErrorBody {
                        message: message.clone(),
                        type_: Some(openai_error_type_for_status(*status).to_string()),
                        code: None,
                    }),
                    ..OpenAiStreamChunk::default()
                }));
                self.finished = true;
            }
        }
    }

    fn ensure_role(&mut self, out: &mut Vec<WireStreamEvent>) {
        if self.role_sent {
            return;
        }
        self.role_sent = true;
        out.push(self.chunk(
            OpenAiDelta {
                role: Some("assistant".to_string()),
                content: Some(String::new()),
                ..OpenAiDelta::default()
            },
            None,
        ));
    }

    fn send_arguments(&mut self, index: usize, arguments: &str, out: &mut Vec<WireStreamEvent>) {
        let Some(slot) = self.tools.get_mut(&index).filter(|slot| !slot.sent) else {
            return;
        };
        slot.sent = true;
        let received = slot.fragments.trim();
        if !received.is_empty() && received != arguments {
            tracing::warn!(index, "received tool arguments replaced by the validated arguments");
        }
        let ordinal = slot.ordinal;
        out.push(self.tool_chunk(arguments_fragment(ordinal, arguments.to_string())));
    }

    /// Send calls whose end never arrived, with whatever arguments validate.
    fn flush_unsent_arguments(&mut self, out: &mut Vec<WireStreamEvent>) {
        let mut unsent: Vec<(u32, usize, String)> = self
            .tools
            .iter()
            .filter(|(_, slot)| !slot.sent)
            .map(|(index, slot)| {
                (slot.ordinal, *index, finalize_tool_arguments(&slot.fragments, None))
            })
            .collect();
        unsent.sort_unstable_by_key(|(ordinal, _, _)| *ordinal);
        for (_, index, arguments) in unsent {
            self.send_arguments(index, &arguments, out);
        }
    }

    fn send_finish(&mut self, stop_reason: CanonicalStopReason, out: &mut Vec<WireStreamEvent>) {
        if self.finish_sent {
            return;
        }
        self.ensure_role(out);
        self.flush_unsent_arguments(out);
        self.finish_sent = true;
        out.push(self.chunk(
            OpenAiDelta::default(),
            Some(canonical_stop_to_openai(stop_reason).to_string()),
        ));
    }

    fn chunk(&self, delta: OpenAiDelta, finish_reason: Option<String>) -> WireStreamEvent {
        WireStreamEvent::OpenAiChat(OpenAiStreamChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: Some(self.envelope.created_at),
            model: self.envelope.model.clone(),
            choices: vec![OpenAiStreamChoice {
                index: 0,
                delta,
                finish_reason,
            }],
            usage: None,
            error: None,
        })
    }

    fn tool_chunk(&self, call: OpenAiStreamToolCall) -> WireStreamEvent {
        self.chunk(
            OpenAiDelta {
                tool_calls: Some(vec![call]),
                ..OpenAiDelta::default()
            },
            None,
        )
    }

    /// Close the stream: finish chunk, optional usage chunk, then `[DONE]`.
    /// Calling it again after the stream is closed is a no-op.
    pub fn finish_into(&mut self, out: &mut Vec<WireStreamEvent>) {
        if self.finished {
            return;
        }
        if !self.finish_sent {
            tracing::warn!("stream ended without a stop reason; reporting stop");
            let fallback = if self.tools.is_empty() {
                CanonicalStopReason::EndOfTurn
            } else {
                CanonicalStopReason::ToolCalls
            };
            self.send_finish(fallback, out);
        }
        if self.envelope.include_usage {
            out.push(WireStreamEvent::OpenAiChat(OpenAiStreamChunk {
                id: self.id.clone(),
                object: "chat.completion.chunk".to_string(),
                created: Some(self.envelope.created_at),
                model: self.envelope.model.clone(),
                choices: Vec::new(),
                usage: Some(self.usage.to_openai()),
                error: None,
            }));
        }
        out.push(WireStreamEvent::OpenAiChatDone);
        self.finished = true;
    }
}

fn arguments_fragment(ordinal: u32, arguments: String) -> OpenAiStreamToolCall {
    OpenAiStreamToolCall {
        index: ordinal,
        id: None,
        type_: None,
        function: Some(OpenAiStreamToolCallFunction {
            name: None,
            arguments: Some(arguments),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chunk(value: Value) -> OpenAiStreamChunk {
        serde_json::from_value(value).unwrap()
    }

    fn tool_fragment(index: u32, id: Option<&str>, name: Option<&str>, args: &str) -> OpenAiStreamChunk {
        let mut call = json!({"index": index, "function": {"arguments": args}});
        if let Some(id) = id {
            call["id"] = json!(id);
            call["type"] = json!("function");
        }
        if let Some(name) = name {
            call["function"]["name"] = json!(name);
        }
        chunk(json!({"id": "chatcmpl-1", "model": "gpt-4o",
            "choices": [{"index": 0, "delta": {"tool_calls": [call]}}]}))
    }

    fn finish(reason: &str) -> OpenAiStreamChunk {
        chunk(json!({"id": "chatcmpl-1", "model": "gpt-4o",
            "choices": [{"index": 0, "delta": {}, "finish_reason": reason}]}))
    }

    #[test]
    fn test_text_unit_is_closed_before_first_tool_fragment() {
        let mut decoder = ChatStreamDecoder::new();
        let mut out = Vec::new();
        decoder.decode_into(
            &chunk(json!({"id": "chatcmpl-1", "model": "gpt-4o",
                "choices": [{"index": 0, "delta": {"role": "assistant", "content": "Let me check"}}]})),
            &mut out,
        );
        decoder.decode_into(&tool_fragment(0, Some("call_1"), Some("weather"), "{\"city\":"), &mut out);
        decoder.decode_into(&tool_fragment(0, None, None, "\"sf\"}"), &mut out);
        decoder.decode_into(&finish("tool_calls"), &mut out);
        decoder.done_into(&mut out);

        assert_eq!(
            out,
            vec![
                CanonicalStreamEvent::MessageStart {
                    id: Some("chatcmpl-1".into()),
                    model: Some("gpt-4o".into()),
                },
                CanonicalStreamEvent::BlockStart { index: 0, kind: BlockKind::Text },
                CanonicalStreamEvent::TextDelta { index: 0, text: "Let me check".into() },
                CanonicalStreamEvent::BlockStop { index: 0 },
                CanonicalStreamEvent::ToolCallStart {
                    index: 1,
                    id: "call_1".into(),
                    name: "weather".into(),
                },
                CanonicalStreamEvent::ToolCallArgsDelta { index: 1, delta: "{\"city\":\"sf\"}".into() },
                CanonicalStreamEvent::ToolCallEnd { index: 1, arguments: "{\"city\":\"sf\"}".into() },
                CanonicalStreamEvent::MessageEnd { stop_reason: CanonicalStopReason::ToolCalls },
                CanonicalStreamEvent::Done,
            ]
        );
    }

    #[test]
    fn test_unparseable_tool_index_is_dropped() {
        let mut decoder = ChatStreamDecoder::new();
        let mut out = Vec::new();
        decoder.decode_into(&tool_fragment(0, Some("call_bad"), Some("f"), "{\"a\":"), &mut out);
        decoder.decode_into(&tool_fragment(1, Some("call_ok"), Some("g"), "{}"), &mut out);
        decoder.decode_into(&finish("tool_calls"), &mut out);

        let starts: Vec<&str> = out
            .iter()
            .filter_map(|e| match e {
                CanonicalStreamEvent::ToolCallStart { id, .. } => Some(id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(starts, vec!["call_ok"]);
    }

    #[test]
    fn test_missing_finish_reason_becomes_end_of_turn() {
        let mut decoder = ChatStreamDecoder::new();
        let mut out = Vec::new();
        decoder.decode_into(
            &chunk(json!({"id": "c", "model": "m",
                "choices": [{"index": 0, "delta": {"content": "hi"}}]})),
            &mut out,
        );
        decoder.finish_into(&mut out);
        assert_eq!(
            out.last(),
            Some(&CanonicalStreamEvent::MessageEnd {
                stop_reason: CanonicalStopReason::EndOfTurn
            })
        );
    }

    #[test]
    fn test_encoder_streams_tool_calls_and_closes_with_done() {
        let mut envelope = RequestEnvelope::for_model(uuid::Uuid::from_u128(9), "gpt-4o", 42);
        envelope.include_usage = true;
        let mut encoder = ChatStreamEncoder::new(Arc::new(envelope));
        let mut out = Vec::new();
        encoder.encode_into(
            &CanonicalStreamEvent::ToolCallStart { index: 3, id: "toolu_1".into(), name: "f".into() },
            &mut out,
        );
        encoder.encode_into(
            &CanonicalStreamEvent::ToolCallEnd { index: 3, arguments: "{\"a\":1}".into() },
            &mut out,
        );
        encoder.encode_into(
            &CanonicalStreamEvent::Usage(UsageSnapshot {
                input_tokens: 5,
                output_tokens: 7,
                ..UsageSnapshot::default()
            }),
            &mut out,
        );
        encoder.encode_into(
            &CanonicalStreamEvent::MessageEnd { stop_reason: CanonicalStopReason::ToolCalls },
            &mut out,
        );
        encoder.encode_into(&CanonicalStreamEvent::Done, &mut out);

        // role, tool start, tool args, finish, usage, [DONE]
        assert_eq!(out.len(), 6);
        let WireStreamEvent::OpenAiChat(args) = &out[2] else {
            panic!("expected chat chunk");
        };
        let call = &args.choices[0].delta.tool_calls.as_ref().unwrap()[0];
        assert_eq!(call.index, 0);
        assert_eq!(
            call.function.as_ref().and_then(|f| f.arguments.as_deref()),
            Some("{\"a\":1}")
        );
        let WireStreamEvent::OpenAiChat(finish) = &out[3] else {
            panic!("expected chat chunk");
        };
        assert_eq!(finish.choices[0].finish_reason.as_deref(), Some("tool_calls"));
        let WireStreamEvent::OpenAiChat(usage) = &out[4] else {
            panic!("expected chat chunk");
        };
        assert_eq!(usage.usage.as_ref().map(|u| u.total_tokens), Some(12));
        assert_eq!(out[5], WireStreamEvent::OpenAiChatDone);

        encoder.finish_into(&mut out);
        assert_eq!(out.len(), 6);
    }

    #[test]
    fn test_encoder_holds_arguments_until_they_validate() {
        let envelope = RequestEnvelope::for_model(uuid::Uuid::from_u128(10), "gpt-4o", 42);
        let mut encoder = ChatStreamEncoder::new(Arc::new(envelope));
        let mut out = Vec::new();
        for ev in [
            CanonicalStreamEvent::ToolCallStart { index: 0, id: "call_1".into(), name: "f".into() },
            CanonicalStreamEvent::ToolCallArgsDelta { index: 0, delta: "{\"loc".into() },
        ] {
            encoder.encode_into(&ev, &mut out);
        }
        let fragments_before_finish = out.len();
        encoder.finish_into(&mut out);

        let arguments: Vec<&str> = out
            .iter()
            .filter_map(|e| match e {
                WireStreamEvent::OpenAiChat(chunk) => chunk.choices.first(),
                _ => None,
            })
            .filter_map(|choice| choice.delta.tool_calls.as_ref())
            .flatten()
            .filter_map(|call| call.function.as_ref()?.arguments.as_deref())
            .filter(|args| !args.is_empty())
            .collect();
        assert_eq!(fragments_before_finish, 2);
        assert_eq!(arguments, vec!["{}"]);
    }
}

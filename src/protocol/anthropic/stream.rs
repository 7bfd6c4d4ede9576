use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::protocol::anthropic::{
    AnthropicContentBlock, AnthropicDelta, AnthropicErrorBody, AnthropicMessageDeltaBody,
    AnthropicMessageStart, AnthropicStreamEvent, AnthropicUsage,
};
use crate::protocol::canonical::{BlockKind, CanonicalStopReason, CanonicalStreamEvent};
use crate::protocol::envelope::RequestEnvelope;
use crate::protocol::error_shapes::{
    anthropic_error_type_for_status, status_for_anthropic_error_type,
};
use crate::protocol::mapping::{anthropic_stop_to_canonical, canonical_stop_to_anthropic};
use crate::protocol::usage::UsageSnapshot;
use crate::stream::tool_args::finalize_tool_arguments;
use crate::stream::WireStreamEvent;

// ---------------------------------------------------------------------------
// Source side: Messages events -> canonical events
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum SourceBlock {
    Text,
    Reasoning,
    Tool { fragments: String, start_input: Value },
    Ignored,
}

/// Stateful Messages stream decoder.
///
/// Records each block's kind on `content_block_start` so the matching
/// `content_block_stop` becomes either a `BlockStop` or a `ToolCallEnd`
/// carrying validated arguments.
#[derive(Debug, Default)]
pub struct AnthropicStreamDecoder {
    blocks: FxHashMap<usize, SourceBlock>,
}

impl AnthropicStreamDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode_into(&mut self, event: &AnthropicStreamEvent, out: &mut Vec<CanonicalStreamEvent>) {
        match event {
            AnthropicStreamEvent::MessageStart { message } => {
                out.push(CanonicalStreamEvent::MessageStart {
                    id: Some(message.id.clone()),
                    model: Some(message.model.clone()),
                });
                let usage = UsageSnapshot::from(&message.usage);
                if !usage.is_empty() {
                    out.push(CanonicalStreamEvent::Usage(usage));
                }
            }
            AnthropicStreamEvent::ContentBlockStart {
                index,
                content_block,
            } => self.start_block(*index, content_block, out),
            AnthropicStreamEvent::ContentBlockDelta { index, delta } => {
                self.apply_delta(*index, delta, out);
            }
            AnthropicStreamEvent::ContentBlockStop { index } => self.stop_block(*index, out),
            AnthropicStreamEvent::MessageDelta { delta, usage } => {
                let usage = UsageSnapshot::from(usage);
                if !usage.is_empty() {
                    out.push(CanonicalStreamEvent::Usage(usage));
                }
                if let Some(reason) = &delta.stop_reason {
                    out.push(CanonicalStreamEvent::MessageEnd {
                        stop_reason: anthropic_stop_to_canonical(reason),
                    });
                }
            }
            AnthropicStreamEvent::MessageStop {} => out.push(CanonicalStreamEvent::Done),
            AnthropicStreamEvent::Error { error } => out.push(CanonicalStreamEvent::Error {
                status: status_for_anthropic_error_type(&error.type_),
                message: error.message.clone(),
            }),
            AnthropicStreamEvent::Ping {} | AnthropicStreamEvent::Unknown => {}
        }
    }

    fn start_block(
        &mut self,
        index: usize,
        block: &AnthropicContentBlock,
        out: &mut Vec<CanonicalStreamEvent>,
    ) {
        let state = match block {
            AnthropicContentBlock::Text { text } => {
                out.push(CanonicalStreamEvent::BlockStart {
                    index,
                    kind: BlockKind::Text,
                });
                if !text.is_empty() {
                    out.push(CanonicalStreamEvent::TextDelta {
                        index,
                        text: text.clone(),
                    });
                }
                SourceBlock::Text
            }
            AnthropicContentBlock::Thinking {
                thinking,
                signature,
            } => {
                out.push(CanonicalStreamEvent::BlockStart {
                    index,
                    kind: BlockKind::Reasoning,
                });
                if let Some(signature) = signature.as_ref().filter(|s| !s.is_empty()) {
                    out.push(CanonicalStreamEvent::ReasoningSignature {
                        index,
                        signature: signature.clone(),
                    });
                }
                if !thinking.is_empty() {
                    out.push(CanonicalStreamEvent::ReasoningDelta {
                        index,
                        text: thinking.clone(),
                    });
                }
                SourceBlock::Reasoning
            }
            AnthropicContentBlock::ToolUse { id, name, input } => {
                out.push(CanonicalStreamEvent::ToolCallStart {
                    index,
                    id: id.clone(),
                    name: name.clone(),
                });
                SourceBlock::Tool {
                    fragments: String::new(),
                    start_input: input.clone(),
                }
            }
            AnthropicContentBlock::RedactedThinking { .. }
            | AnthropicContentBlock::ToolResult { .. } => SourceBlock::Ignored,
        };
        self.blocks.insert(index, state);
    }

    fn apply_delta(
        &mut self,
        index: usize,
        delta: &AnthropicDelta,
        out: &mut Vec<CanonicalStreamEvent>,
    ) {
        match delta {
            AnthropicDelta::TextDelta { text } => out.push(CanonicalStreamEvent::TextDelta {
                index,
                text: text.clone(),
            }),
            AnthropicDelta::ThinkingDelta { thinking } => {
                out.push(CanonicalStreamEvent::ReasoningDelta {
                    index,
                    text: thinking.clone(),
                });
            }
            AnthropicDelta::SignatureDelta { signature } => {
                out.push(CanonicalStreamEvent::ReasoningSignature {
                    index,
                    signature: signature.clone(),
                });
            }
            AnthropicDelta::InputJsonDelta { partial_json } => {
                match self.blocks.get_mut(&index) {
                    Some(SourceBlock::Tool { fragments, .. }) => fragments.push_str(partial_json),
                    _ => {
                        tracing::debug!(index, "input_json_delta outside a tool_use block; skipped");
                        return;
                    }
                }
                if !partial_json.is_empty() {
                    out.push(CanonicalStreamEvent::ToolCallArgsDelta {
                        index,
                        delta: partial_json.clone(),
                    });
                }
            }
        }
    }

    fn stop_block(&mut self, index: usize, out: &mut Vec<CanonicalStreamEvent>) {
        match self.blocks.remove(&index) {
            Some(SourceBlock::Tool {
                fragments,
                start_input,
            }) => out.push(CanonicalStreamEvent::ToolCallEnd {
                index,
                arguments: finalize_tool_arguments(&fragments, Some(&start_input)),
            }),
            Some(SourceBlock::Text | SourceBlock::Reasoning) => {
                out.push(CanonicalStreamEvent::BlockStop { index });
            }
            Some(SourceBlock::Ignored) | None => {}
        }
    }

    /// Close every block the stream left open.
    pub fn finish_into(&mut self, out: &mut Vec<CanonicalStreamEvent>) {
        let mut open: Vec<usize> = self.blocks.keys().copied().collect();
        open.sort_unstable();
        for index in open {
            self.stop_block(index, out);
        }
    }
}

// ---------------------------------------------------------------------------
// Target side: canonical events -> Messages events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TargetKind {
    Text,
    Reasoning,
    Tool,
}

#[derive(Debug, Clone, Copy)]
struct OpenBlock {
    source_index: usize,
    client_index: usize,
    kind: TargetKind,
}

#[derive(Debug, Default)]
struct ToolProgress {
    fragments: String,
    sent: bool,
}

/// Stateful Messages stream encoder.
///
/// Messages blocks are strictly sequential, so the encoder keeps at most one
/// block open and closes it before starting the next. `message_start` is
/// held back until the first content event so it can carry input usage;
/// `message_delta` is deferred to the end of the stream.
///
/// Tool input is sent as one `input_json_delta` when the block closes, so
/// the client only ever assembles validated JSON.
#[derive(Debug)]
pub struct AnthropicStreamEncoder {
    envelope: Arc<RequestEnvelope>,
    started: bool,
    open: Option<OpenBlock>,
    next_index: usize,
    tools: FxHashMap<usize, ToolProgress>,
    stop_reason: Option<CanonicalStopReason>,
    usage: UsageSnapshot,
    finished: bool,
}

impl AnthropicStreamEncoder {
    #[must_use]
    pub fn new(envelope: Arc<RequestEnvelope>) -> Self {
        Self {
            envelope,
            started: false,
            open: None,
            next_index: 0,
            tools: FxHashMap::default(),
            stop_reason: None,
            usage: UsageSnapshot::default(),
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
            CanonicalStreamEvent::MessageStart { .. } => {}
            CanonicalStreamEvent::BlockStart { index, kind } => {
                let kind = match kind {
                    BlockKind::Text => TargetKind::Text,
                    BlockKind::Reasoning => TargetKind::Reasoning,
                };
                self.open_block(*index, kind, out);
            }
            CanonicalStreamEvent::TextDelta { index, text } => {
                if text.is_empty() {
                    return;
                }
                let client_index = self.open_block(*index, TargetKind::Text, out);
                out.push(content_delta(
                    client_index,
                    AnthropicDelta::TextDelta { text: text.clone() },
                ));
            }
            CanonicalStreamEvent::ReasoningDelta { index, text } => {
                if text.is_empty() {
                    return;
                }
                let client_index = self.open_block(*index, TargetKind::Reasoning, out);
                out.push(content_delta(
                    client_index,
                    AnthropicDelta::ThinkingDelta {
                        thinking: text.clone(),
                    },
                ));
            }
            CanonicalStreamEvent::ReasoningSignature { index, signature } => {
                let client_index = self.open_block(*index, TargetKind::Reasoning, out);
                out.push(content_delta(
                    client_index,
                    AnthropicDelta::SignatureDelta {
                        signature: signature.clone(),
                    },
                ));
            }
            CanonicalStreamEvent::BlockStop { index } => {
                if self.open.is_some_and(|open| open.source_index == *index) {
                    self.close_open(out);
                }
            }
            CanonicalStreamEvent::ToolCallStart { index, id, name } => {
                self.ensure_started(out);
                self.close_open(out);
                let client_index = self.allocate_index();
                self.open = Some(OpenBlock {
                    source_index: *index,
                    client_index,
                    kind: TargetKind::Tool,
                });
                self.tools.insert(*index, ToolProgress::default());
                out.push(WireStreamEvent::Anthropic(
                    AnthropicStreamEvent::ContentBlockStart {
                        index: client_index,
                        content_block: AnthropicContentBlock::ToolUse {
                            id: id.clone(),
                            name: name.clone(),
                            input: Value::Object(serde_json::Map::new()),
                        },
                    },
                ));
            }
            CanonicalStreamEvent::ToolCallArgsDelta { index, delta } => {
                let Some(client_index) = self.open_tool_index(*index) else {
                    tracing::debug!(index, "argument delta for a tool block that is not open");
                    return;
                };
                if let Some(progress) = self.tools.get_mut(index) {
                    progress.fragments.push_str(delta);
                } else {
                    tracing::debug!(index, client_index, "argument delta without tool progress");
                }
            }
            CanonicalStreamEvent::ToolCallEnd { index, arguments } => {
                self.end_tool(*index, arguments, out);
            }
            CanonicalStreamEvent::Usage(usage) => self.usage.merge(usage),
            CanonicalStreamEvent::MessageEnd { stop_reason } => {
                self.stop_reason = Some(*stop_reason);
            }
            CanonicalStreamEvent::Done => self.finish_into(out),
            CanonicalStreamEvent::Error { status, message } => {
                self.close_open(out);
                out.push(WireStreamEvent::Anthropic(AnthropicStreamEvent::Error {
                    error: AnthropicErrorBody {
                        type_: anthropic_error_type_for_status(*status).to_string(),
                        message: message.clone(),
                    },
                }));
                self.finished = true;
            }
        }
    }

    fn end_tool(&mut self, index: usize, arguments: &str, out: &mut Vec<WireStreamEvent>) {
        let Some(client_index) = self.open_tool_index(index) else {
            tracing::debug!(index, "tool end for a block that is not open");
            return;
        };
        self.send_tool_input(index, client_index, arguments, out);
        self.close_open(out);
    }

    fn send_tool_input(
        &mut self,
        source_index: usize,
        client_index: usize,
        arguments: &str,
        out: &mut Vec<WireStreamEvent>,
    ) {
        let Some(progress) = self.tools.get_mut(&source_index) else {
            return;
        };
        if progress.sent {
            return;
        }
        progress.sent = true;
        let received = progress.fragments.trim();
        if !received.is_empty() && received != arguments {
            tracing::warn!(
                index = source_index,
                "received tool arguments replaced by the validated arguments"
            );
        }
        out.push(content_delta(
            client_index,
            AnthropicDelta::InputJsonDelta {
                partial_json: arguments.to_string(),
            },
        ));
    }

    fn open_tool_index(&self, source_index: usize) -> Option<usize> {
        self.open
            .filter(|open| open.kind == TargetKind::Tool && open.source_index == source_index)
            .map(|open| open.client_index)
    }

    fn allocate_index(&mut self) -> usize {
        let index = self.next_index;
        self.next_index += 1;
        index
    }

    fn ensure_started(&mut self, out: &mut Vec<WireStreamEvent>) {
        if self.started {
            return;
        }
        self.started = true;
        let usage = AnthropicUsage {
            input_tokens: self.usage.input_tokens,
            output_tokens: 0,
            cache_creation_input_tokens: (self.usage.cache_creation_tokens > 0)
                .then_some(self.usage.cache_creation_tokens),
            cache_read_input_tokens: (self.usage.cache_read_tokens > 0)
                .then_some(self.usage.cache_read_tokens),
        };
        out.push(WireStreamEvent::Anthropic(AnthropicStreamEvent::MessageStart {
            message: AnthropicMessageStart {
                id: self.envelope.anthropic_message_id(),
                type_: "message".to_string(),
                role: "assistant".to_string(),
                model: self.envelope.model.clone(),
                content: Vec::new(),
                stop_reason: None,
                stop_sequence: None,
                usage,
            },
        }));
    }

    /// Make sure a text or reasoning block for `source_index` is open and
    /// return its client index, synthesizing the start when needed.
    fn open_block(
        &mut self,
        source_index: usize,
        kind: TargetKind,
        out: &mut Vec<WireStreamEvent>,
    ) -> usize {
        self.ensure_started(out);
        if let Some(open) = self.open {
            if open.source_index == source_index && open.kind == kind {
                return open.client_index;
            }
        }
        self.close_open(out);
        let client_index = self.allocate_index();
        self.open = Some(OpenBlock {
            source_index,
            client_index,
            kind,
        });
        let content_block = match kind {
            TargetKind::Reasoning => AnthropicContentBlock::Thinking {
                thinking: String::new(),
                signature: None,
            },
            TargetKind::Text | TargetKind::Tool => AnthropicContentBlock::Text {
                text: String::new(),
            },
        };
        out.push(WireStreamEvent::Anthropic(
            AnthropicStreamEvent::ContentBlockStart {
                index: client_index,
                content_block,
            },
        ));
        client_index
    }

    fn close_open(&mut self, out: &mut Vec<WireStreamEvent>) {
        if let Some(open) = self.open {
            if open.kind == TargetKind::Tool {
                let arguments = self
                    .tools
                    .get(&open.source_index)
                    .filter(|progress| !progress.sent)
                    .map(|progress| finalize_tool_arguments(&progress.fragments, None));
                if let Some(arguments) = arguments {
                    self.send_tool_input(open.source_index, open.client_index, &arguments, out);
                }
            }
        }
        if let Some(open) = self.open.take() {
            out.push(WireStreamEvent::Anthropic(
                AnthropicStreamEvent::ContentBlockStop {
                    index: open.client_index,
                },
            ));
        }
    }

    /// Emit whatever the client still needs to see a well-formed message.
    /// Calling it again after the stream is closed is a no-op.
    pub fn finish_into(&mut self, out: &mut Vec<WireStreamEvent>) {
        if self.finished {
            return;
        }
        self.ensure_started(out);
        self.close_open(out);

        let stop_reason = self.stop_reason.unwrap_or_else(|| {
            tracing::warn!("stream ended without a stop reason; reporting end_turn");
            if self.tools.is_empty() {
                CanonicalStopReason::EndOfTurn
            } else {
                CanonicalStopReason::ToolCalls
            }
        });
        out.push(WireStreamEvent::Anthropic(AnthropicStreamEvent::MessageDelta {
            delta: AnthropicMessageDeltaBody {
                stop_reason: Some(canonical_stop_to_anthropic(stop_reason).to_string()),
                stop_sequence: None,
            },
            usage: self.usage.to_anthropic(),
        }));
        out.push(WireStreamEvent::Anthropic(AnthropicStreamEvent::MessageStop {}));
        self.finished = true;
    }
}

fn content_delta(index: usize, delta: AnthropicDelta) -> WireStreamEvent {
    WireStreamEvent::Anthropic(AnthropicStreamEvent::ContentBlockDelta { index, delta })
}

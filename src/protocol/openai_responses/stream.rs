use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::protocol::canonical::{BlockKind, CanonicalStopReason, CanonicalStreamEvent};
use crate::protocol::envelope::RequestEnvelope;
use crate::protocol::error_shapes::{openai_error_type_for_status, status_for_openai_error};
use crate::protocol::mapping::{canonical_stop_to_responses_status, responses_status_to_canonical};
use crate::protocol::usage::UsageSnapshot;
use crate::stream::tool_args::finalize_tool_arguments;
use crate::stream::WireStreamEvent;

use super::response_encoder::response_shell;
use super::{
    ResponsesContentPart, ResponsesIncompleteDetails, ResponsesOutput, ResponsesOutputItem,
    ResponsesStreamEvent, ResponsesSummaryPart,
};

/// Summary group used for reasoning text that arrives before any signature.
pub const DEFAULT_SUMMARY_GROUP: &str = "__default__";

// ---------------------------------------------------------------------------
// Source side: Responses events -> canonical events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum UnitKey {
    Text { output_index: usize, content_index: usize },
    Summary { output_index: usize, summary_index: usize },
}

#[derive(Debug, Default)]
struct SourceTool {
    index: usize,
    fragments: String,
    done_arguments: Option<String>,
}

/// Stateful Responses stream decoder.
///
/// Text parts and summary parts each become a canonical unit; indices are
/// assigned in order of first appearance. Reasoning units stay open until
/// their item completes so the item's `encrypted_content` can be attached
/// as a signature before the unit closes.
#[derive(Debug, Default)]
pub struct ResponsesStreamDecoder {
    next_index: usize,
    units: FxHashMap<UnitKey, usize>,
    open: Vec<(UnitKey, usize)>,
    tools: FxHashMap<usize, SourceTool>,
    saw_tool_calls: bool,
    done: bool,
}

impl ResponsesStreamDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode_into(&mut self, event: &ResponsesStreamEvent, out: &mut Vec<CanonicalStreamEvent>) {
        if self.done {
            return;
        }
        match event {
            ResponsesStreamEvent::ResponseCreated { response, .. } => {
                out.push(CanonicalStreamEvent::MessageStart {
                    id: (!response.id.is_empty()).then(|| response.id.clone()),
                    model: (!response.model.is_empty()).then(|| response.model.clone()),
                });
            }
            ResponsesStreamEvent::OutputItemAdded { output_index, item, .. } => {
                if let ResponsesOutputItem::FunctionCall { call_id, name, .. } = item {
                    self.start_tool(*output_index, call_id, name, out);
                }
            }
            ResponsesStreamEvent::ContentPartAdded {
                output_index,
                content_index,
                ..
            } => {
                self.ensure_unit(
                    UnitKey::Text {
                        output_index: *output_index,
                        content_index: *content_index,
                    },
                    out,
                );
            }
            ResponsesStreamEvent::OutputTextDelta {
                output_index,
                content_index,
                delta,
                ..
            } => {
                let index = self.ensure_unit(
                    UnitKey::Text {
                        output_index: *output_index,
                        content_index: *content_index,
                    },
                    out,
                );
                if !delta.is_empty() {
                    out.push(CanonicalStreamEvent::TextDelta {
                        index,
                        text: delta.clone(),
                    });
                }
            }
            ResponsesStreamEvent::ContentPartDone {
                output_index,
                content_index,
                ..
            } => self.close_unit(
                UnitKey::Text {
                    output_index: *output_index,
                    content_index: *content_index,
                },
                out,
            ),
            ResponsesStreamEvent::ReasoningSummaryPartAdded {
                output_index,
                summary_index,
                ..
            } => {
                self.ensure_unit(
                    UnitKey::Summary {
                        output_index: *output_index,
                        summary_index: *summary_index,
                    },
                    out,
                );
            }
            ResponsesStreamEvent::ReasoningSummaryTextDelta {
                output_index,
                summary_index,
                delta,
                ..
            } => {
                let index = self.ensure_unit(
                    UnitKey::Summary {
                        output_index: *output_index,
                        summary_index: *summary_index,
                    },
                    out,
                );
                if !delta.is_empty() {
                    out.push(CanonicalStreamEvent::ReasoningDelta {
                        index,
                        text: delta.clone(),
                    });
                }
            }
            ResponsesStreamEvent::FunctionCallArgumentsDelta {
                output_index, delta, ..
            } => {
                let Some(tool) = self.tools.get_mut(output_index) else {
                    tracing::debug!(output_index, "argument delta before function_call item; skipped");
                    return;
                };
                tool.fragments.push_str(delta);
                if !delta.is_empty() {
                    out.push(CanonicalStreamEvent::ToolCallArgsDelta {
                        index: tool.index,
                        delta: delta.clone(),
                    });
                }
            }
            ResponsesStreamEvent::FunctionCallArgumentsDone {
                output_index,
                arguments,
                ..
            } => {
                if let Some(tool) = self.tools.get_mut(output_index) {
                    tool.done_arguments = Some(arguments.clone());
                }
            }
            ResponsesStreamEvent::OutputItemDone { output_index, item, .. } => {
                self.complete_item(*output_index, item, out);
            }
            ResponsesStreamEvent::ResponseCompleted { response, .. }
            | ResponsesStreamEvent::ResponseIncomplete { response, .. } => {
                self.finish_into(out);
                if let Some(usage) = &response.usage {
                    out.push(CanonicalStreamEvent::Usage(UsageSnapshot::from(usage)));
                }
                let has_tool_calls = self.saw_tool_calls
                    || response
                        .output
                        .iter()
                        .any(|item| matches!(item, ResponsesOutputItem::FunctionCall { .. }));
                out.push(CanonicalStreamEvent::MessageEnd {
                    stop_reason: responses_status_to_canonical(
                        response.status.as_deref().or(Some(event_status(event))),
                        response.incomplete_details.as_ref().map(|d| d.reason.as_str()),
                        has_tool_calls,
                    ),
                });
                out.push(CanonicalStreamEvent::Done);
                self.done = true;
            }
            ResponsesStreamEvent::ResponseFailed { response, .. } => {
                let (code, message) = response.error.as_ref().map_or((None, "response failed"), |e| {
                    (e.code.as_deref(), e.message.as_str())
                });
                out.push(CanonicalStreamEvent::Error {
                    status: status_for_openai_error(None, code),
                    message: message.to_string(),
                });
                self.done = true;
            }
            ResponsesStreamEvent::Error { code, message, .. } => {
                out.push(CanonicalStreamEvent::Error {
                    status: status_for_openai_error(None, code.as_deref()),
                    message: message.clone(),
                });
                self.done = true;
            }
            ResponsesStreamEvent::ResponseInProgress { .. }
            | ResponsesStreamEvent::OutputTextDone { .. }
            | ResponsesStreamEvent::ReasoningSummaryPartDone { .. }
            | ResponsesStreamEvent::ReasoningSummaryTextDone { .. }
            | ResponsesStreamEvent::Unknown => {}
        }
    }

    fn allocate_index(&mut self) -> usize {
        let index = self.next_index;
        self.next_index += 1;
        index
    }

    fn ensure_unit(&mut self, key: UnitKey, out: &mut Vec<CanonicalStreamEvent>) -> usize {
        if let Some(index) = self.units.get(&key) {
            return *index;
        }
        let index = self.allocate_index();
        self.units.insert(key, index);
        self.open.push((key, index));
        let kind = match key {
            UnitKey::Text { .. } => BlockKind::Text,
            UnitKey::Summary { .. } => BlockKind::Reasoning,
        };
        out.push(CanonicalStreamEvent::BlockStart { index, kind });
        index
    }

    fn close_unit(&mut self, key: UnitKey, out: &mut Vec<CanonicalStreamEvent>) {
        if let Some(pos) = self.open.iter().position(|(k, _)| *k == key) {
            let (_, index) = self.open.remove(pos);
            out.push(CanonicalStreamEvent::BlockStop { index });
        }
    }

    fn start_tool(
        &mut self,
        output_index: usize,
        call_id: &str,
        name: &str,
        out: &mut Vec<CanonicalStreamEvent>,
    ) {
        if self.tools.contains_key(&output_index) {
            return;
        }
        let index = self.allocate_index();
        self.saw_tool_calls = true;
        self.tools.insert(
            output_index,
            SourceTool {
                index,
                ..SourceTool::default()
            },
        );
        out.push(CanonicalStreamEvent::ToolCallStart {
            index,
            id: call_id.to_string(),
            name: name.to_string(),
        });
    }

    fn complete_item(
        &mut self,
        output_index: usize,
        item: &ResponsesOutputItem,
        out: &mut Vec<CanonicalStreamEvent>,
    ) {
        match item {
            ResponsesOutputItem::Message { content, .. } => {
                // text carried only by the completed item
                for (content_index, part) in content.iter().enumerate() {
                    let key = UnitKey::Text {
                        output_index,
                        content_index,
                    };
                    if self.units.contains_key(&key) {
                        continue;
                    }
                    let text = match part {
                        ResponsesContentPart::OutputText { text, .. } => text,
                        ResponsesContentPart::Refusal { refusal } => refusal,
                    };
                    let index = self.ensure_unit(key, out);
                    if !text.is_empty() {
                        out.push(CanonicalStreamEvent::TextDelta {
                            index,
                            text: text.clone(),
                        });
                    }
                }
                self.close_units_of(output_index, out);
            }
            ResponsesOutputItem::Reasoning {
                summary,
                encrypted_content,
                ..
            } => {
                for (summary_index, ResponsesSummaryPart::SummaryText { text }) in
                    summary.iter().enumerate()
                {
                    let key = UnitKey::Summary {
                        output_index,
                        summary_index,
                    };
                    if self.units.contains_key(&key) {
                        continue;
                    }
                    let index = self.ensure_unit(key, out);
                    if !text.is_empty() {
                        out.push(CanonicalStreamEvent::ReasoningDelta {
                            index,
                            text: text.clone(),
                        });
                    }
                }
                if let Some(signature) = encrypted_content.as_ref().filter(|s| !s.is_empty()) {
                    let last_open = self
                        .open
                        .iter()
                        .rev()
                        .find(|(key, _)| {
                            matches!(key, UnitKey::Summary { output_index: oi, .. } if *oi == output_index)
                        })
                        .map(|(_, index)| *index);
                    let index = match last_open {
                        Some(index) => index,
                        None => self.ensure_unit(
                            UnitKey::Summary {
                                output_index,
                                summary_index: summary.len(),
                            },
                            out,
                        ),
                    };
                    out.push(CanonicalStreamEvent::ReasoningSignature {
                        index,
                        signature: signature.clone(),
                    });
                }
                self.close_units_of(output_index, out);
            }
            ResponsesOutputItem::FunctionCall {
                call_id,
                name,
                arguments,
                ..
            } => {
                self.start_tool(output_index, call_id, name, out);
                if let Some(tool) = self.tools.remove(&output_index) {
                    let candidate = tool
                        .done_arguments
                        .filter(|a| !a.trim().is_empty())
                        .or_else(|| (!arguments.trim().is_empty()).then(|| arguments.clone()))
                        .unwrap_or(tool.fragments);
                    out.push(CanonicalStreamEvent::ToolCallEnd {
                        index: tool.index,
                        arguments: finalize_tool_arguments(&candidate, None),
                    });
                }
            }
            ResponsesOutputItem::FunctionCallOutput { .. } => {}
        }
    }

    fn close_units_of(&mut self, output_index: usize, out: &mut Vec<CanonicalStreamEvent>) {
        let mut remaining = Vec::with_capacity(self.open.len());
        for (key, index) in std::mem::take(&mut self.open) {
            let belongs = match key {
                UnitKey::Text { output_index: oi, .. } | UnitKey::Summary { output_index: oi, .. } => {
                    oi == output_index
                }
            };
            if belongs {
                out.push(CanonicalStreamEvent::BlockStop { index });
            } else {
                remaining.push((key, index));
            }
        }
        self.open = remaining;
    }

    /// Close units and tool calls the stream left open.
    pub fn finish_into(&mut self, out: &mut Vec<CanonicalStreamEvent>) {
        if self.done {
            return;
        }
        for (_, index) in std::mem::take(&mut self.open) {
            out.push(CanonicalStreamEvent::BlockStop { index });
        }
        let mut tools: Vec<SourceTool> = self.tools.drain().map(|(_, tool)| tool).collect();
        tools.sort_unstable_by_key(|tool| tool.index);
        for tool in tools {
            let candidate = tool.done_arguments.unwrap_or(tool.fragments);
            out.push(CanonicalStreamEvent::ToolCallEnd {
                index: tool.index,
                arguments: finalize_tool_arguments(&candidate, None),
            });
        }
    }
}

fn event_status(event: &ResponsesStreamEvent) -> &'static str {
    match event {
        ResponsesStreamEvent::ResponseIncomplete { .. } => "incomplete",
        _ => "completed",
    }
}

// ---------------------------------------------------------------------------
// Target side: canonical events -> Responses events
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct SummaryGroup {
    key: String,
    text: String,
    done: bool,
}

#[derive(Debug)]
struct ReasoningItem {
    source_index: usize,
    output_index: usize,
    item_id: String,
    groups: Vec<SummaryGroup>,
    signature: Option<String>,
    done: bool,
}

#[derive(Debug)]
struct MessageItem {
    source_index: usize,
    output_index: usize,
    item_id: String,
    text: String,
    part_added: bool,
    text_done: bool,
    part_done: bool,
    item_done: bool,
}

#[derive(Debug)]
struct ToolItem {
    source_index: usize,
    output_index: usize,
    item_id: String,
    call_id: String,
    name: String,
    streamed: String,
    done: bool,
}

/// Stateful Responses stream encoder.
///
/// Every emitted event gets the next `sequence_number`, starting at 0.
/// Each output unit tracks which lifecycle events it has already emitted,
/// so finalization only fills in what is missing and can run exactly once
/// whether the source terminated cleanly or was cut off.
///
/// Reasoning is one output item per stream. Its summary is split into
/// groups keyed by the signature of the source block
/// ([`DEFAULT_SUMMARY_GROUP`] when the block has none). Sources that send a
/// block's signature after its text need [`Self::with_trailing_signatures`].
#[derive(Debug)]
pub struct ResponsesStreamEncoder {
    envelope: Arc<RequestEnvelope>,
    sequence: u64,
    started: bool,
    next_output_index: usize,
    block_signatures: FxHashMap<usize, String>,
    trailing_signatures: bool,
    pending_reasoning: FxHashMap<usize, String>,
    reasoning: Option<ReasoningItem>,
    message: Option<MessageItem>,
    tools: FxHashMap<usize, ToolItem>,
    tool_order: Vec<usize>,
    completed: Vec<(usize, ResponsesOutputItem)>,
    usage: UsageSnapshot,
    stop_reason: Option<CanonicalStopReason>,
    finished: bool,
}

impl ResponsesStreamEncoder {
    #[must_use]
    pub fn new(envelope: Arc<RequestEnvelope>) -> Self {
        Self {
            envelope,
            sequence: 0,
            started: false,
            next_output_index: 0,
            block_signatures: FxHashMap::default(),
            trailing_signatures: false,
            pending_reasoning: FxHashMap::default(),
            reasoning: None,
            message: None,
            tools: FxHashMap::default(),
            tool_order: Vec::new(),
            completed: Vec::new(),
            usage: UsageSnapshot::default(),
            stop_reason: None,
            finished: false,
        }
    }

    /// Hold each source block's reasoning text until the block closes, so
    /// the summary group is chosen once its signature is known. Messages
    /// streams send `signature_delta` after the thinking text.
    #[must_use]
    pub fn with_trailing_signatures(mut self) -> Self {
        self.trailing_signatures = true;
        self
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Sequence number the next emitted event will carry.
    #[must_use]
    pub fn next_sequence_number(&self) -> u64 {
        self.sequence
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.sequence;
        self.sequence += 1;
        seq
    }

    fn push(&mut self, out: &mut Vec<WireStreamEvent>, build: impl FnOnce(u64) -> ResponsesStreamEvent) {
        let seq = self.next_seq();
        out.push(WireStreamEvent::Responses(build(seq)));
    }

    fn allocate_output_index(&mut self) -> usize {
        let index = self.next_output_index;
        self.next_output_index += 1;
        index
    }

    pub fn encode_into(&mut self, event: &CanonicalStreamEvent, out: &mut Vec<WireStreamEvent>) {
        if self.finished {
            return;
        }
        match event {
            CanonicalStreamEvent::MessageStart { .. } | CanonicalStreamEvent::BlockStart { .. } => {
                self.ensure_started(out);
            }
            CanonicalStreamEvent::BlockStop { index } => {
                self.ensure_started(out);
                self.flush_pending_reasoning(*index, out);
            }
            CanonicalStreamEvent::TextDelta { index, text } => {
                if !text.is_empty() {
                    self.text_delta(*index, text, out);
                }
            }
            CanonicalStreamEvent::ReasoningDelta { index, text } => {
                if text.is_empty() {
                    return;
                }
                if self.trailing_signatures {
                    self.ensure_reasoning_item(*index, out);
                    self.pending_reasoning
                        .entry(*index)
                        .or_default()
                        .push_str(text);
                } else {
                    self.reasoning_delta(*index, text, out);
                }
            }
            CanonicalStreamEvent::ReasoningSignature { index, signature } => {
                self.block_signatures
                    .entry(*index)
                    .or_default()
                    .push_str(signature);
                if let Some(full) = self.block_signatures.get(index).cloned() {
                    self.ensure_reasoning_item(*index, out);
                    if let Some(reasoning) = self.reasoning.as_mut() {
                        reasoning.signature = Some(full);
                    }
                }
            }
            CanonicalStreamEvent::ToolCallStart { index, id, name } => {
                self.tool_start(*index, id, name, out);
            }
            CanonicalStreamEvent::ToolCallArgsDelta { index, delta } => {
                let Some(tool) = self.tools.get_mut(index).filter(|t| !t.done) else {
                    tracing::debug!(index, "argument delta for an unknown tool call");
                    return;
                };
                tool.streamed.push_str(delta);
                let item_id = tool.item_id.clone();
                let output_index = tool.output_index;
                let delta = delta.clone();
                self.push(out, |sequence_number| {
                    ResponsesStreamEvent::FunctionCallArgumentsDelta {
                        item_id,
                        output_index,
                        delta,
                        sequence_number,
                    }
                });
            }
            CanonicalStreamEvent::ToolCallEnd { index, arguments } => {
                self.tool_end(*index, arguments, out);
            }
            CanonicalStreamEvent::Usage(usage) => self.usage.merge(usage),
            CanonicalStreamEvent::MessageEnd { stop_reason } => {
                self.stop_reason = Some(*stop_reason);
            }
            CanonicalStreamEvent::Done => self.finish_into(out),
            CanonicalStreamEvent::Error { status, message } => {
                let code = Some(openai_error_type_for_status(*status).to_string());
                let message = message.clone();
                self.push(out, |sequence_number| ResponsesStreamEvent::Error {
                    code,
                    message,
                    param: None,
                    sequence_number,
                });
                self.finished = true;
            }
        }
    }

    fn ensure_started(&mut self, out: &mut Vec<WireStreamEvent>) {
        if self.started {
            return;
        }
        self.started = true;
        let shell = response_shell(&self.envelope, "in_progress");
        let created = shell.clone();
        self.push(out, |sequence_number| ResponsesStreamEvent::ResponseCreated {
            response: created,
            sequence_number,
        });
        self.push(out, |sequence_number| ResponsesStreamEvent::ResponseInProgress {
            response: shell,
            sequence_number,
        });
    }

    fn text_delta(&mut self, source_index: usize, text: &str, out: &mut Vec<WireStreamEvent>) {
        self.ensure_message_part(source_index, out);
        let Some(message) = self.message.as_mut() else {
            return;
        };
        message.text.push_str(text);
        let item_id = message.item_id.clone();
        let output_index = message.output_index;
        let delta = text.to_string();
        self.push(out, |sequence_number| ResponsesStreamEvent::OutputTextDelta {
            item_id,
            output_index,
            content_index: 0,
            delta,
            sequence_number,
        });
    }

    fn ensure_message_part(&mut self, source_index: usize, out: &mut Vec<WireStreamEvent>) {
        self.ensure_started(out);
        if self.message.is_none() {
            let output_index = self.allocate_output_index();
            let item_id = self.envelope.item_id("msg", 0);
            self.message = Some(MessageItem {
                source_index,
                output_index,
                item_id: item_id.clone(),
                text: String::new(),
                part_added: false,
                text_done: false,
                part_done: false,
                item_done: false,
            });
            self.push(out, |sequence_number| ResponsesStreamEvent::OutputItemAdded {
                output_index,
                item: ResponsesOutputItem::Message {
                    id: item_id,
                    status: Some("in_progress".to_string()),
                    role: "assistant".to_string(),
                    content: Vec::new(),
                },
                sequence_number,
            });
        }
        let Some(message) = self.message.as_mut() else {
            return;
        };
        if message.part_added {
            return;
        }
        message.part_added = true;
        let item_id = message.item_id.clone();
        let output_index = message.output_index;
        self.push(out, |sequence_number| ResponsesStreamEvent::ContentPartAdded {
            item_id,
            output_index,
            content_index: 0,
            part: ResponsesContentPart::output_text(String::new()),
            sequence_number,
        });
    }

    fn ensure_reasoning_item(&mut self, source_index: usize, out: &mut Vec<WireStreamEvent>) {
        self.ensure_started(out);
        if self.reasoning.is_some() {
            return;
        }
        let output_index = self.allocate_output_index();
        let item_id = self.envelope.item_id("rs", 0);
        self.reasoning = Some(ReasoningItem {
            source_index,
            output_index,
            item_id: item_id.clone(),
            groups: Vec::new(),
            signature: None,
            done: false,
        });
        self.push(out, |sequence_number| ResponsesStreamEvent::OutputItemAdded {
            output_index,
            item: ResponsesOutputItem::Reasoning {
                id: item_id,
                summary: Vec::new(),
                encrypted_content: None,
                status: None,
            },
            sequence_number,
        });
    }

    fn flush_pending_reasoning(&mut self, source_index: usize, out: &mut Vec<WireStreamEvent>) {
        if let Some(text) = self.pending_reasoning.remove(&source_index) {
            self.reasoning_delta(source_index, &text, out);
        }
    }

    fn reasoning_delta(&mut self, source_index: usize, text: &str, out: &mut Vec<WireStreamEvent>) {
        self.ensure_reasoning_item(source_index, out);
        let key = self
            .block_signatures
            .get(&source_index)
            .cloned()
            .unwrap_or_else(|| DEFAULT_SUMMARY_GROUP.to_string());
        let Some(reasoning) = self.reasoning.as_mut() else {
            return;
        };
        let item_id = reasoning.item_id.clone();
        let output_index = reasoning.output_index;
        let summary_index = match reasoning.groups.iter().position(|g| g.key == key) {
            Some(position) => position,
            None => {
                reasoning.groups.push(SummaryGroup {
                    key,
                    text: String::new(),
                    done: false,
                });
                let summary_index = reasoning.groups.len() - 1;
                let added_item_id = item_id.clone();
                self.push(out, |sequence_number| {
                    ResponsesStreamEvent::ReasoningSummaryPartAdded {
                        item_id: added_item_id,
                        output_index,
                        summary_index,
                        part: ResponsesSummaryPart::SummaryText {
                            text: String::new(),
                        },
                        sequence_number,
                    }
                });
                summary_index
            }
        };
        if let Some(group) = self
            .reasoning
            .as_mut()
            .and_then(|r| r.groups.get_mut(summary_index))
        {
            group.text.push_str(text);
        }
        let delta = text.to_string();
        self.push(out, |sequence_number| {
            ResponsesStreamEvent::ReasoningSummaryTextDelta {
                item_id,
                output_index,
                summary_index,
                delta,
                sequence_number,
            }
        });
    }

    fn tool_start(&mut self, source_index: usize, call_id: &str, name: &str, out: &mut Vec<WireStreamEvent>) {
        self.ensure_started(out);
        if self.tools.contains_key(&source_index) {
            tracing::debug!(source_index, "duplicate tool start; ignored");
            return;
        }
        let output_index = self.allocate_output_index();
        let item_id = self.envelope.item_id("fc", self.tool_order.len());
        self.tool_order.push(source_index);
        self.tools.insert(
            source_index,
            ToolItem {
                source_index,
                output_index,
                item_id: item_id.clone(),
                call_id: call_id.to_string(),
                name: name.to_string(),
                streamed: String::new(),
                done: false,
            },
        );
        let item = ResponsesOutputItem::FunctionCall {
            id: item_id,
            status: Some("in_progress".to_string()),
            call_id: call_id.to_string(),
            name: name.to_string(),
            arguments: String::new(),
        };
        self.push(out, |sequence_number| ResponsesStreamEvent::OutputItemAdded {
            output_index,
            item,
            sequence_number,
        });
    }

    fn tool_end(&mut self, source_index: usize, arguments: &str, out: &mut Vec<WireStreamEvent>) {
        let Some(tool) = self.tools.get(&source_index).filter(|t| !t.done) else {
            tracing::debug!(source_index, "tool end for an unknown tool call");
            return;
        };
        if tool.streamed.is_empty() {
            let item_id = tool.item_id.clone();
            let output_index = tool.output_index;
            let delta = arguments.to_string();
            self.push(out, |sequence_number| {
                ResponsesStreamEvent::FunctionCallArgumentsDelta {
                    item_id,
                    output_index,
                    delta,
                    sequence_number,
                }
            });
        } else if tool.streamed.trim() != arguments {
            tracing::warn!(source_index, "streamed tool arguments differ from the validated final arguments");
        }
        self.complete_tool(source_index, arguments.to_string(), out);
    }

    fn complete_tool(&mut self, source_index: usize, arguments: String, out: &mut Vec<WireStreamEvent>) {
        let Some(tool) = self.tools.get_mut(&source_index) else {
            return;
        };
        tool.done = true;
        let item_id = tool.item_id.clone();
        let output_index = tool.output_index;
        let item = ResponsesOutputItem::FunctionCall {
            id: tool.item_id.clone(),
            status: Some("completed".to_string()),
            call_id: tool.call_id.clone(),
            name: tool.name.clone(),
            arguments: arguments.clone(),
        };
        let source_index = tool.source_index;
        self.push(out, |sequence_number| {
            ResponsesStreamEvent::FunctionCallArgumentsDone {
                item_id,
                output_index,
                arguments,
                sequence_number,
            }
        });
        let done_item = item.clone();
        self.push(out, |sequence_number| ResponsesStreamEvent::OutputItemDone {
            output_index,
            item: done_item,
            sequence_number,
        });
        self.completed.push((source_index, item));
    }

    fn finalize_reasoning(&mut self, out: &mut Vec<WireStreamEvent>) {
        let Some(mut reasoning) = self.reasoning.take() else {
            return;
        };
        if reasoning.done {
            self.reasoning = Some(reasoning);
            return;
        }
        let item_id = reasoning.item_id.clone();
        let output_index = reasoning.output_index;
        for (summary_index, group) in reasoning.groups.iter_mut().enumerate() {
            if group.done {
                continue;
            }
            group.done = true;
            let text = group.text.clone();
            let part_text = group.text.clone();
            let text_item_id = item_id.clone();
            self.push(out, |sequence_number| {
                ResponsesStreamEvent::ReasoningSummaryTextDone {
                    item_id: text_item_id,
                    output_index,
                    summary_index,
                    text,
                    sequence_number,
                }
            });
            let part_item_id = item_id.clone();
            self.push(out, |sequence_number| {
                ResponsesStreamEvent::ReasoningSummaryPartDone {
                    item_id: part_item_id,
                    output_index,
                    summary_index,
                    part: ResponsesSummaryPart::SummaryText { text: part_text },
                    sequence_number,
                }
            });
        }
        reasoning.done = true;
        let item = ResponsesOutputItem::Reasoning {
            id: item_id,
            summary: reasoning
                .groups
                .iter()
                .map(|g| ResponsesSummaryPart::SummaryText {
                    text: g.text.clone(),
                })
                .collect(),
            encrypted_content: reasoning.signature.clone(),
            status: None,
        };
        let done_item = item.clone();
        self.push(out, |sequence_number| ResponsesStreamEvent::OutputItemDone {
            output_index,
            item: done_item,
            sequence_number,
        });
        self.completed.push((reasoning.source_index, item));
        self.reasoning = Some(reasoning);
    }

    fn finalize_message(&mut self, status: &str, out: &mut Vec<WireStreamEvent>) {
        let Some(mut message) = self.message.take() else {
            return;
        };
        let item_id = message.item_id.clone();
        let output_index = message.output_index;
        if message.part_added && !message.text_done {
            message.text_done = true;
            let text = message.text.clone();
            let event_item_id = item_id.clone();
            self.push(out, |sequence_number| ResponsesStreamEvent::OutputTextDone {
                item_id: event_item_id,
                output_index,
                content_index: 0,
                text,
                sequence_number,
            });
        }
        if message.part_added && !message.part_done {
            message.part_done = true;
            let part = ResponsesContentPart::output_text(message.text.clone());
            let event_item_id = item_id.clone();
            self.push(out, |sequence_number| ResponsesStreamEvent::ContentPartDone {
                item_id: event_item_id,
                output_index,
                content_index: 0,
                part,
                sequence_number,
            });
        }
        if !message.item_done {
            message.item_done = true;
            let item = ResponsesOutputItem::Message {
                id: item_id,
                status: Some(status.to_string()),
                role: "assistant".to_string(),
                content: vec![ResponsesContentPart::output_text(message.text.clone())],
            };
            let done_item = item.clone();
            self.push(out, |sequence_number| ResponsesStreamEvent::OutputItemDone {
                output_index,
                item: done_item,
                sequence_number,
            });
            self.completed.push((message.source_index, item));
        }
        self.message = Some(message);
    }

    fn finalize_tools(&mut self, out: &mut Vec<WireStreamEvent>) {
        for source_index in self.tool_order.clone() {
            let Some(tool) = self.tools.get(&source_index).filter(|t| !t.done) else {
                continue;
            };
            let arguments = finalize_tool_arguments(&tool.streamed, None);
            if tool.streamed.trim().is_empty() {
                let item_id = tool.item_id.clone();
                let output_index = tool.output_index;
                let delta = arguments.clone();
                self.push(out, |sequence_number| {
                    ResponsesStreamEvent::FunctionCallArgumentsDelta {
                        item_id,
                        output_index,
                        delta,
                        sequence_number,
                    }
                });
            }
            self.complete_tool(source_index, arguments, out);
        }
    }

    /// Emit every missing lifecycle event and the terminal response event.
    /// Calling it again after the stream is closed is a no-op.
    pub fn finish_into(&mut self, out: &mut Vec<WireStreamEvent>) {
        if self.finished {
            return;
        }
        self.ensure_started(out);

        let (status, incomplete_reason) = match self.stop_reason {
            Some(reason) => canonical_stop_to_responses_status(reason),
            None => {
                tracing::warn!("stream ended without a stop reason; reporting incomplete");
                ("incomplete", None)
            }
        };

        let mut pending: Vec<usize> = self.pending_reasoning.keys().copied().collect();
        pending.sort_unstable();
        for source_index in pending {
            self.flush_pending_reasoning(source_index, out);
        }
        self.finalize_reasoning(out);
        self.finalize_message(status, out);
        self.finalize_tools(out);

        let mut response = self.current_response(status);
        response.incomplete_details = incomplete_reason.map(|reason| ResponsesIncompleteDetails {
            reason: reason.to_string(),
        });
        if status == "completed" {
            self.push(out, |sequence_number| ResponsesStreamEvent::ResponseCompleted {
                response,
                sequence_number,
            });
        } else {
            self.push(out, |sequence_number| ResponsesStreamEvent::ResponseIncomplete {
                response,
                sequence_number,
            });
        }
        self.finished = true;
    }

    /// Response object with every completed item, ordered by source index.
    fn current_response(&self, status: &str) -> ResponsesOutput {
        let mut completed = self.completed.clone();
        completed.sort_by_key(|(source_index, _)| *source_index);
        let mut response = response_shell(&self.envelope, status);
        response.output = completed.into_iter().map(|(_, item)| item).collect();
        response.usage = Some(self.usage.to_responses());
        response
    }
}

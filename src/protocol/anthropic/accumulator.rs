use std::collections::BTreeMap;

use serde_json::Value;

use crate::protocol::anthropic::{
    AnthropicContentBlock, AnthropicDelta, AnthropicErrorBody, AnthropicResponse,
    AnthropicStreamEvent, AnthropicUsage,
};

#[derive(Debug, Clone)]
enum BlockState {
    Text(String),
    Thinking {
        text: String,
        signature: Option<String>,
    },
    RedactedThinking(String),
    ToolUse {
        id: String,
        name: String,
        start_input: Value,
        partial_json: String,
    },
}

/// Rebuilds a Messages response from its own event stream.
#[derive(Debug, Clone, Default)]
pub struct AnthropicAccumulator {
    id: String,
    model: String,
    blocks: BTreeMap<usize, BlockState>,
    stop_reason: Option<String>,
    stop_sequence: Option<String>,
    usage: AnthropicUsage,
    error: Option<AnthropicErrorBody>,
    terminal: bool,
}

impl AnthropicAccumulator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: &AnthropicStreamEvent) {
        match event {
            AnthropicStreamEvent::MessageStart { message } => {
                self.id.clone_from(&message.id);
                self.model.clone_from(&message.model);
                self.usage = message.usage.clone();
            }
            AnthropicStreamEvent::ContentBlockStart {
                index,
                content_block,
            } => {
                let state = match content_block {
                    AnthropicContentBlock::Text { text } => BlockState::Text(text.clone()),
                    AnthropicContentBlock::Thinking {
                        thinking,
                        signature,
                    } => BlockState::Thinking {
                        text: thinking.clone(),
                        signature: signature.clone().filter(|s| !s.is_empty()),
                    },
                    AnthropicContentBlock::RedactedThinking { data } => {
                        BlockState::RedactedThinking(data.clone())
                    }
                    AnthropicContentBlock::ToolUse { id, name, input } => BlockState::ToolUse {
                        id: id.clone(),
                        name: name.clone(),
                        start_input: input.clone(),
                        partial_json: String::new(),
                    },
                    AnthropicContentBlock::ToolResult { .. } => return,
                };
                self.blocks.insert(*index, state);
            }
            AnthropicStreamEvent::ContentBlockDelta { index, delta } => {
                self.apply_delta(*index, delta);
            }
            AnthropicStreamEvent::MessageDelta { delta, usage } => {
                if delta.stop_reason.is_some() {
                    self.stop_reason.clone_from(&delta.stop_reason);
                }
                if delta.stop_sequence.is_some() {
                    self.stop_sequence.clone_from(&delta.stop_sequence);
                }
                merge_usage(&mut self.usage, usage);
            }
            AnthropicStreamEvent::MessageStop {} => self.terminal = true,
            AnthropicStreamEvent::Error { error } => {
                self.error = Some(error.clone());
                self.terminal = true;
            }
            AnthropicStreamEvent::ContentBlockStop { .. }
            | AnthropicStreamEvent::Ping {}
            | AnthropicStreamEvent::Unknown => {}
        }
    }

    fn apply_delta(&mut self, index: usize, delta: &AnthropicDelta) {
        // a delta for an unseen block opens it with the matching kind
        let block = self.blocks.entry(index).or_insert_with(|| match delta {
            AnthropicDelta::TextDelta { .. } => BlockState::Text(String::new()),
            AnthropicDelta::ThinkingDelta { .. } | AnthropicDelta::SignatureDelta { .. } => {
                BlockState::Thinking {
                    text: String::new(),
                    signature: None,
                }
            }
            AnthropicDelta::InputJsonDelta { .. } => BlockState::ToolUse {
                id: String::new(),
                name: String::new(),
                start_input: Value::Object(serde_json::Map::new()),
                partial_json: String::new(),
            },
        });
        match (block, delta) {
            (BlockState::Text(text), AnthropicDelta::TextDelta { text: more }) => {
                text.push_str(more);
            }
            (BlockState::Thinking { text, .. }, AnthropicDelta::ThinkingDelta { thinking }) => {
                text.push_str(thinking);
            }
            (BlockState::Thinking { signature, .. }, AnthropicDelta::SignatureDelta { signature: sig }) => {
                signature.get_or_insert_with(String::new).push_str(sig);
            }
            (
                BlockState::ToolUse { partial_json, .. },
                AnthropicDelta::InputJsonDelta { partial_json: more },
            ) => partial_json.push_str(more),
            (_, other) => {
                tracing::debug!(index, delta = ?other, "delta does not match block kind; ignored");
            }
        }
    }

    /// Response assembled from everything observed so far.
    #[must_use]
    pub fn snapshot(&self) -> AnthropicResponse {
        let content = self
            .blocks
            .values()
            .map(|block| match block {
                BlockState::Text(text) => AnthropicContentBlock::Text { text: text.clone() },
                BlockState::Thinking { text, signature } => AnthropicContentBlock::Thinking {
                    thinking: text.clone(),
                    signature: signature.clone(),
                },
                BlockState::RedactedThinking(data) => {
                    AnthropicContentBlock::RedactedThinking { data: data.clone() }
                }
                BlockState::ToolUse {
                    id,
                    name,
                    start_input,
                    partial_json,
                } => AnthropicContentBlock::ToolUse {
                    id: id.clone(),
                    name: name.clone(),
                    input: tool_input(start_input, partial_json),
                },
            })
            .collect();

        AnthropicResponse {
            id: self.id.clone(),
            type_: "message".to_string(),
            role: "assistant".to_string(),
            model: self.model.clone(),
            content,
            stop_reason: self.stop_reason.clone(),
            stop_sequence: self.stop_sequence.clone(),
            usage: self.usage.clone(),
        }
    }

    /// The completed response, once `message_stop` (or an error) was seen.
    /// Each call returns an independent copy.
    #[must_use]
    pub fn final_response(&self) -> Option<AnthropicResponse> {
        self.terminal.then(|| self.snapshot())
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    /// The `error` event that ended the stream, if any.
    #[must_use]
    pub fn error(&self) -> Option<&AnthropicErrorBody> {
        self.error.as_ref()
    }
}

fn tool_input(start_input: &Value, partial_json: &str) -> Value {
    if partial_json.trim().is_empty() {
        return start_input.clone();
    }
    match serde_json::from_str::<Value>(partial_json) {
        Ok(value @ Value::Object(_)) => value,
        Ok(_) | Err(_) => start_input.clone(),
    }
}

fn merge_usage(current: &mut AnthropicUsage, later: &AnthropicUsage) {
    if later.input_tokens > 0 {
        current.input_tokens = later.input_tokens;
    }
    if later.output_tokens > 0 {
        current.output_tokens = later.output_tokens;
    }
    if later.cache_creation_input_tokens.is_some() {
        current.cache_creation_input_tokens = later.cache_creation_input_tokens;
    }
    if later.cache_read_input_tokens.is_some() {
        current.cache_read_input_tokens = later.cache_read_input_tokens;
    }
}

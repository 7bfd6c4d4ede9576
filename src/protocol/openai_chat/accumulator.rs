use std::collections::BTreeMap;

use serde_json::Value;

use super::{
    OpenAiChatResponse, OpenAiChoice, OpenAiErrorBody, OpenAiMessage, OpenAiStreamChunk,
    OpenAiToolCall, OpenAiToolCallFunction, OpenAiUsage,
};

#[derive(Debug, Clone, Default)]
struct ToolCallState {
    id: String,
    name: String,
    arguments: String,
}

#[derive(Debug, Clone, Default)]
struct ChoiceState {
    content: String,
    reasoning: String,
    refusal: Option<String>,
    tool_calls: BTreeMap<u32, ToolCallState>,
    finish_reason: Option<String>,
}

/// Rebuilds a Chat Completions response from its chunk stream.
#[derive(Debug, Clone, Default)]
pub struct ChatAccumulator {
    id: String,
    model: String,
    created: Option<u64>,
    choices: BTreeMap<u32, ChoiceState>,
    usage: Option<OpenAiUsage>,
    error: Option<OpenAiErrorBody>,
    terminal: bool,
}

impl ChatAccumulator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &OpenAiStreamChunk) {
        if let Some(error) = &chunk.error {
            self.error = Some(error.clone());
            self.terminal = true;
            return;
        }
        if self.id.is_empty() && !chunk.id.is_empty() {
            self.id.clone_from(&chunk.id);
        }
        if self.model.is_empty() && !chunk.model.is_empty() {
            self.model.clone_from(&chunk.model);
        }
        if self.created.is_none() {
            self.created = chunk.created;
        }
        for choice in &chunk.choices {
            let state = self.choices.entry(choice.index).or_default();
            let delta = &choice.delta;
            if let Some(content) = &delta.content {
                state.content.push_str(content);
            }
            if let Some(reasoning) = &delta.reasoning_content {
                state.reasoning.push_str(reasoning);
            }
            if let Some(refusal) = &delta.refusal {
                state.refusal.get_or_insert_with(String::new).push_str(refusal);
            }
            for call in delta.tool_calls.iter().flatten() {
                let tool = state.tool_calls.entry(call.index).or_default();
                if let Some(id) = call.id.as_ref().filter(|id| !id.is_empty()) {
                    tool.id.clone_from(id);
                }
                if let Some(function) = &call.function {
                    if let Some(name) = function.name.as_ref().filter(|n| !n.is_empty()) {
                        tool.name.clone_from(name);
                    }
                    if let Some(arguments) = &function.arguments {
                        tool.arguments.push_str(arguments);
                    }
                }
            }
            if choice.finish_reason.is_some() {
                state.finish_reason.clone_from(&choice.finish_reason);
            }
        }
        if chunk.usage.is_some() {
            self.usage.clone_from(&chunk.usage);
        }
    }

    /// Record the `[DONE]` sentinel.
    pub fn push_done(&mut self) {
        self.terminal = true;
    }

    #[must_use]
    pub fn snapshot(&self) -> OpenAiChatResponse {
        let choices = self
            .choices
            .iter()
            .map(|(index, state)| {
                let tool_calls: Vec<OpenAiToolCall> = state
                    .tool_calls
                    .values()
                    .map(|tool| OpenAiToolCall {
                        id: tool.id.clone(),
                        type_: "function".to_string(),
                        function: OpenAiToolCallFunction {
                            name: tool.name.clone(),
                            arguments: tool.arguments.clone(),
                        },
                    })
                    .collect();
                let content = if state.content.is_empty() && !tool_calls.is_empty() {
                    None
                } else {
                    Some(Value::String(state.content.clone()))
                };
                OpenAiChoice {
                    index: *index,
                    message: OpenAiMessage {
                        role: "assistant".to_string(),
                        content,
                        reasoning_content: (!state.reasoning.is_empty())
                            .then(|| state.reasoning.clone()),
                        tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                        refusal: state.refusal.clone(),
                        ..OpenAiMessage::default()
                    },
                    finish_reason: state.finish_reason.clone(),
                }
            })
            .collect();

        OpenAiChatResponse {
            id: self.id.clone(),
            object: "chat.completion".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices,
            usage: self.usage.clone(),
        }
    }

    /// The completed response once `[DONE]` (or an error) was seen.
    /// Each call returns an independent copy.
    #[must_use]
    pub fn final_response(&self) -> Option<OpenAiChatResponse> {
        self.terminal.then(|| self.snapshot())
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    /// True once the first choice carried a `finish_reason`.
    #[must_use]
    pub fn has_finish_reason(&self) -> bool {
        self.choices
            .get(&0)
            .is_some_and(|choice| choice.finish_reason.is_some())
    }

    #[must_use]
    pub fn error(&self) -> Option<&OpenAiErrorBody> {
        self.error.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chunk(value: Value) -> OpenAiStreamChunk {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_rebuilds_content_and_tool_calls() {
        let mut acc = ChatAccumulator::new();
        acc.push(&chunk(json!({"id": "chatcmpl-1", "created": 7, "model": "gpt-4o",
            "choices": [{"index": 0, "delta": {"role": "assistant", "content": "Hel"}}]})));
        acc.push(&chunk(json!({"id": "chatcmpl-1", "model": "gpt-4o",
            "choices": [{"index": 0, "delta": {"content": "lo"}}]})));
        acc.push(&chunk(json!({"id": "chatcmpl-1", "model": "gpt-4o",
            "choices": [{"index": 0, "delta": {"tool_calls": [{"index": 0, "id": "call_1",
                "type": "function", "function": {"name": "f", "arguments": "{\"a\""}}]}}]})));
        acc.push(&chunk(json!({"id": "chatcmpl-1", "model": "gpt-4o",
            "choices": [{"index": 0, "delta": {"tool_calls": [{"index": 0,
                "function": {"arguments": ":1}"}}]}, "finish_reason": "tool_calls"}]})));
        acc.push(&chunk(json!({"id": "chatcmpl-1", "model": "gpt-4o", "choices": [],
            "usage": {"prompt_tokens": 3, "completion_tokens": 4, "total_tokens": 7}})));
        assert!(acc.final_response().is_none());
        acc.push_done();

        let response = acc.final_response().unwrap();
        assert_eq!(response.created, Some(7));
        let message = &response.choices[0].message;
        assert_eq!(message.content, Some(Value::String("Hello".into())));
        let calls = message.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].function.arguments, "{\"a\":1}");
        assert_eq!(response.choices[0].finish_reason.as_deref(), Some("tool_calls"));
        assert_eq!(response.usage.map(|u| u.total_tokens), Some(7));
    }

    #[test]
    fn test_final_response_is_a_defensive_copy() {
        let mut acc = ChatAccumulator::new();
        acc.push(&chunk(json!({"id": "c", "model": "m",
            "choices": [{"index": 0, "delta": {"content": "x"}, "finish_reason": "stop"}]})));
        acc.push_done();
        let mut first = acc.final_response().unwrap();
        first.choices.clear();
        assert_eq!(acc.final_response().unwrap().choices.len(), 1);
    }
}

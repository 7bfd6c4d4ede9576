use serde_json::Value;

use crate::error::CanonicalError;
use crate::protocol::canonical::{CanonicalPart, CanonicalResponse, CanonicalStopReason};
use crate::protocol::mapping::openai_stop_to_canonical;
use crate::protocol::usage::UsageSnapshot;
use crate::util::raw_arguments_or_empty;

use super::OpenAiChatResponse;

/// Decode a Chat Completions response into a canonical response.
///
/// Only the first choice is read. A `stop` finish that nevertheless carries
/// tool calls is reported as a tool-call stop.
///
/// # Errors
///
/// Returns [`CanonicalError`] when the response has no choices.
pub fn decode_openai_chat_response(
    response: &OpenAiChatResponse,
) -> Result<CanonicalResponse, CanonicalError> {
    let choice = response.choices.first().ok_or_else(|| {
        CanonicalError::Translation("Chat Completions response has no choices".to_string())
    })?;
    let message = &choice.message;

    let mut content: Vec<CanonicalPart> = Vec::new();
    if let Some(reasoning) = message.reasoning_content.as_ref().filter(|r| !r.is_empty()) {
        content.push(CanonicalPart::Reasoning {
            text: reasoning.clone(),
            signature: None,
        });
    }
    if let Some(refusal) = &message.refusal {
        content.push(CanonicalPart::Refusal(refusal.clone()));
    }
    match &message.content {
        Some(Value::String(text)) if !text.is_empty() => {
            content.push(CanonicalPart::Text(text.clone()));
        }
        Some(Value::Array(parts)) => {
            for part in parts {
                if part.get("type").and_then(Value::as_str) != Some("text") {
                    continue;
                }
                if let Some(text) = part.get("text").and_then(Value::as_str) {
                    content.push(CanonicalPart::Text(text.to_string()));
                }
            }
        }
        _ => {}
    }

    let mut has_tool_calls = false;
    for call in message.tool_calls.iter().flatten() {
        has_tool_calls = true;
        content.push(CanonicalPart::ToolCall {
            id: call.id.clone(),
            name: call.function.name.clone(),
            arguments: raw_arguments_or_empty(
                call.function.arguments.clone(),
                "Chat Completions response tool call",
            ),
        });
    }

    let mut stop_reason = choice
        .finish_reason
        .as_deref()
        .map_or(CanonicalStopReason::EndOfTurn, openai_stop_to_canonical);
    if has_tool_calls && stop_reason == CanonicalStopReason::EndOfTurn {
        stop_reason = CanonicalStopReason::ToolCalls;
    }

    Ok(CanonicalResponse {
        id: response.id.clone(),
        model: response.model.clone(),
        content,
        stop_reason,
        usage: response
            .usage
            .as_ref()
            .map(UsageSnapshot::from)
            .unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_tool_call_response_with_cache_usage() {
        let response: OpenAiChatResponse = serde_json::from_value(json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "created": 1,
            "model": "gpt-4o",
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1", "type": "function",
                        "function": {"name": "weather", "arguments": "{\"city\":\"sf\"}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {
                "prompt_tokens": 30, "completion_tokens": 9, "total_tokens": 39,
                "prompt_tokens_details": {"cached_tokens": 20}
            }
        }))
        .unwrap();

        let canonical = decode_openai_chat_response(&response).unwrap();
        assert_eq!(canonical.stop_reason, CanonicalStopReason::ToolCalls);
        assert!(matches!(
            &canonical.content[0],
            CanonicalPart::ToolCall { name, arguments, .. }
                if name == "weather" && arguments.get() == "{\"city\":\"sf\"}"
        ));
        assert_eq!(canonical.usage.input_tokens, 30);
        assert_eq!(canonical.usage.cache_read_tokens, 20);
    }

    #[test]
    fn test_empty_choices_is_an_error() {
        let response: OpenAiChatResponse = serde_json::from_value(json!({
            "id": "x", "object": "chat.completion", "model": "m", "choices": []
        }))
        .unwrap();
        assert!(decode_openai_chat_response(&response).is_err());
    }
}

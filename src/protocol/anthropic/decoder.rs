use serde_json::Value;

use crate::error::CanonicalError;
use crate::protocol::anthropic::{AnthropicRequest, AnthropicThinkingConfig, AnthropicTool};
use crate::protocol::canonical::{
    provider_extensions_from_map, CanonicalMessage, CanonicalPart, CanonicalRequest, CanonicalRole,
    CanonicalToolChoice, CanonicalToolFunction, CanonicalToolSpec, GenerationParams,
    ReasoningConfig, WireApi,
};
use crate::protocol::mapping::{anthropic_role_to_canonical, build_data_uri};
use crate::util::raw_value_from_string;

/// Parse a Messages API request into canonical form.
///
/// A user turn that mixes `tool_result` blocks with other content is split
/// into a tool turn followed by a user turn, which is the shape the
/// Chat-style protocols require.
///
/// # Errors
///
/// Returns [`CanonicalError`] when content blocks cannot be translated into
/// canonical parts.
pub fn decode_anthropic_request(
    request: &AnthropicRequest,
    request_id: uuid::Uuid,
) -> Result<CanonicalRequest, CanonicalError> {
    let mut messages = Vec::with_capacity(request.messages.len());
    for msg in &request.messages {
        let role = anthropic_role_to_canonical(&msg.role);
        let parts = decode_content_value(&msg.content)?;
        push_decoded_turn(&mut messages, role, parts);
    }

    let mut extra = request.extra.clone();
    let metadata = request.metadata.clone();
    let user = metadata
        .as_ref()
        .and_then(|m| m.get("user_id"))
        .and_then(Value::as_str)
        .map(ToString::to_string);
    let parallel_tool_calls = request
        .tool_choice
        .as_ref()
        .and_then(|choice| choice.get("disable_parallel_tool_use"))
        .and_then(Value::as_bool)
        .map(|disabled| !disabled);
    // kept for same-protocol forwarding only
    extra.remove("anthropic_version");

    let mut canonical = CanonicalRequest::empty(request_id, WireApi::Anthropic, request.model.clone());
    canonical.stream = request.stream.unwrap_or(false);
    canonical.include_usage = true;
    canonical.system_prompt = decode_system_prompt(request.system.as_ref());
    canonical.messages = messages;
    canonical.tools = decode_anthropic_tools(request.tools.as_deref()).into();
    canonical.tool_choice = request
        .tool_choice
        .as_ref()
        .map_or(CanonicalToolChoice::Auto, decode_tool_choice);
    canonical.generation = GenerationParams {
        max_tokens: Some(request.max_tokens),
        temperature: request.temperature,
        top_p: request.top_p,
        top_k: request.top_k,
        stop: request.stop_sequences.clone(),
        ..GenerationParams::default()
    };
    canonical.reasoning = match request.thinking {
        Some(AnthropicThinkingConfig::Enabled { budget_tokens }) => Some(ReasoningConfig {
            effort: None,
            summary: Some("auto".to_string()),
            budget_tokens: Some(budget_tokens),
        }),
        Some(AnthropicThinkingConfig::Disabled) | None => None,
    };
    canonical.metadata = metadata;
    canonical.user = user;
    canonical.parallel_tool_calls = parallel_tool_calls;
    canonical.provider_extensions = provider_extensions_from_map(extra);
    Ok(canonical)
}

fn push_decoded_turn(
    messages: &mut Vec<CanonicalMessage>,
    role: CanonicalRole,
    parts: Vec<CanonicalPart>,
) {
    if role != CanonicalRole::User {
        messages.push(CanonicalMessage::new(role, parts));
        return;
    }

    let (tool_results, rest): (Vec<_>, Vec<_>) = parts
        .into_iter()
        .partition(|part| matches!(part, CanonicalPart::ToolResult { .. }));
    for result in tool_results {
        let mut message = CanonicalMessage::new(CanonicalRole::Tool, vec![result]);
        if let Some(CanonicalPart::ToolResult { tool_call_id, .. }) = message.parts.first() {
            message.tool_call_id = Some(tool_call_id.clone());
        }
        messages.push(message);
    }
    if !rest.is_empty() {
        messages.push(CanonicalMessage::new(CanonicalRole::User, rest));
    }
}

/// Decode a content value (string or array of blocks) into canonical parts.
pub(crate) fn decode_content_value(content: &Value) -> Result<Vec<CanonicalPart>, CanonicalError> {
    let blocks = match content {
        Value::String(s) => return Ok(vec![CanonicalPart::Text(s.clone())]),
        Value::Array(blocks) => blocks,
        _ => return Ok(Vec::new()),
    };

    let mut parts = Vec::with_capacity(blocks.len());
    for block in blocks {
        let block_type = block.get("type").and_then(Value::as_str).unwrap_or("text");
        match block_type {
            "text" => {
                let text = str_field(block, "text");
                parts.push(CanonicalPart::Text(text));
            }
            "image" => {
                if let Some(part) = decode_image_block(block) {
                    parts.push(part);
                }
            }
            "tool_use" => {
                let input = block
                    .get("input")
                    .cloned()
                    .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
                let arguments = serde_json::to_string(&input).map_err(|e| {
                    CanonicalError::Translation(format!("tool_use input is not serializable: {e}"))
                })?;
                parts.push(CanonicalPart::ToolCall {
                    id: str_field(block, "id"),
                    name: str_field(block, "name"),
                    arguments: raw_value_from_string(arguments, "Messages tool_use input")?,
                });
            }
            "tool_result" => {
                parts.push(CanonicalPart::ToolResult {
                    tool_call_id: str_field(block, "tool_use_id"),
                    content: flatten_tool_result_content(block.get("content")),
                });
            }
            "thinking" => {
                parts.push(CanonicalPart::Reasoning {
                    text: str_field(block, "thinking"),
                    signature: block
                        .get("signature")
                        .and_then(Value::as_str)
                        .filter(|s| !s.is_empty())
                        .map(ToString::to_string),
                });
            }
            other => {
                tracing::debug!(block_type = other, "skipping unsupported content block");
            }
        }
    }
    Ok(parts)
}

#[inline]
fn str_field(block: &Value, key: &str) -> String {
    block
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string()
}

fn decode_image_block(block: &Value) -> Option<CanonicalPart> {
    let source = block.get("source")?;
    let url = match source.get("type").and_then(Value::as_str) {
        Some("base64") => {
            let media_type = source.get("media_type").and_then(Value::as_str)?;
            let data = source.get("data").and_then(Value::as_str)?;
            build_data_uri(media_type, data)
        }
        Some("url") => source.get("url").and_then(Value::as_str)?.to_string(),
        _ => return None,
    };
    Some(CanonicalPart::ImageUrl { url, detail: None })
}

/// Tool results carry text; image blocks inside them become a placeholder.
fn flatten_tool_result_content(content: Option<&Value>) -> String {
    match content {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(items)) => {
            let mut texts = Vec::with_capacity(items.len());
            for item in items {
                match item.get("type").and_then(Value::as_str) {
                    Some("text") => {
                        if let Some(text) = item.get("text").and_then(Value::as_str) {
                            texts.push(text.to_string());
                        }
                    }
                    Some("image") => texts.push(crate::protocol::mapping::IMAGE_PLACEHOLDER.into()),
                    _ => {}
                }
            }
            texts.join("\n")
        }
        Some(other) => other.to_string(),
    }
}

fn decode_system_prompt(system: Option<&Value>) -> Option<String> {
    match system? {
        Value::String(s) => Some(s.clone()),
        Value::Array(blocks) => {
            let texts: Vec<&str> = blocks
                .iter()
                .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|block| block.get("text").and_then(Value::as_str))
                .collect();
            if texts.is_empty() {
                None
            } else {
                Some(texts.join("\n"))
            }
        }
        _ => None,
    }
}

fn decode_anthropic_tools(tools: Option<&[AnthropicTool]>) -> Vec<CanonicalToolSpec> {
    tools
        .map(|items| {
            items
                .iter()
                .map(|tool| CanonicalToolSpec {
                    function: CanonicalToolFunction {
                        name: tool.name.clone(),
                        description: tool.description.clone(),
                        parameters: tool.input_schema.clone(),
                    },
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Decode `tool_choice` JSON to canonical form.
fn decode_tool_choice(v: &Value) -> CanonicalToolChoice {
    match v.get("type").and_then(Value::as_str) {
        Some("none") => CanonicalToolChoice::None,
        Some("any") => CanonicalToolChoice::Required,
        Some("tool") => {
            let name = v.get("name").and_then(Value::as_str).unwrap_or("");
            CanonicalToolChoice::Specific(name.to_string())
        }
        _ => CanonicalToolChoice::Auto,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::anthropic::AnthropicMessage;

    fn request(messages: Vec<AnthropicMessage>) -> AnthropicRequest {
        serde_json::from_value(serde_json::json!({
            "model": "claude-sonnet-4-5",
            "max_tokens": 256,
            "messages": messages,
        }))
        .unwrap()
    }

    #[test]
    fn test_decode_basic_request() {
        let req: AnthropicRequest = serde_json::from_value(serde_json::json!({
            "model": "claude-sonnet-4-5",
            "max_tokens": 256,
            "system": [{"type": "text", "text": "You are helpful"}],
            "messages": [{"role": "user", "content": "Hello"}],
            "tools": [{
                "name": "get_weather",
                "description": "Get weather by city",
                "input_schema": {"type": "object", "properties": {"city": {"type": "string"}}}
            }],
            "tool_choice": {"type": "auto", "disable_parallel_tool_use": true},
            "stream": true,
            "temperature": 0.3,
            "top_k": 40,
            "stop_sequences": ["stop"],
            "thinking": {"type": "enabled", "budget_tokens": 4096},
            "metadata": {"user_id": "u-1"}
        }))
        .unwrap();

        let canonical = decode_anthropic_request(&req, uuid::Uuid::from_u128(1)).unwrap();
        assert_eq!(canonical.client_api, WireApi::Anthropic);
        assert!(canonical.stream);
        assert_eq!(canonical.system_prompt.as_deref(), Some("You are helpful"));
        assert_eq!(canonical.tools[0].function.name, "get_weather");
        assert_eq!(canonical.generation.max_tokens, Some(256));
        assert_eq!(canonical.generation.top_k, Some(40));
        assert_eq!(canonical.generation.stop, Some(vec!["stop".to_string()]));
        assert_eq!(canonical.parallel_tool_calls, Some(false));
        assert_eq!(canonical.user.as_deref(), Some("u-1"));
        assert_eq!(
            canonical.reasoning.as_ref().and_then(|r| r.budget_tokens),
            Some(4096)
        );
    }

    #[test]
    fn test_decode_user_tool_result_maps_to_tool_role() {
        let req = request(vec![AnthropicMessage {
            role: "user".to_string(),
            content: serde_json::json!([{
                "type": "tool_result",
                "tool_use_id": "call_1",
                "content": "{\"ok\":true}"
            }]),
        }]);

        let canonical = decode_anthropic_request(&req, uuid::Uuid::from_u128(1)).unwrap();
        assert_eq!(canonical.messages.len(), 1);
        assert_eq!(canonical.messages[0].role, CanonicalRole::Tool);
        assert_eq!(canonical.messages[0].tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn test_mixed_tool_result_and_text_splits_turn() {
        let req = request(vec![AnthropicMessage {
            role: "user".to_string(),
            content: serde_json::json!([
                {"type": "tool_result", "tool_use_id": "call_1", "content": [{"type": "text", "text": "72F"}]},
                {"type": "text", "text": "and tomorrow?"}
            ]),
        }]);

        let canonical = decode_anthropic_request(&req, uuid::Uuid::from_u128(1)).unwrap();
        assert_eq!(canonical.messages.len(), 2);
        assert_eq!(canonical.messages[0].role, CanonicalRole::Tool);
        assert_eq!(canonical.messages[1].role, CanonicalRole::User);
        assert_eq!(canonical.messages[1].text(), "and tomorrow?");
    }

    #[test]
    fn test_base64_image_becomes_data_uri() {
        let req = request(vec![AnthropicMessage {
            role: "user".to_string(),
            content: serde_json::json!([{
                "type": "image",
                "source": {"type": "base64", "media_type": "image/png", "data": "AAAA"}
            }]),
        }]);

        let canonical = decode_anthropic_request(&req, uuid::Uuid::from_u128(1)).unwrap();
        assert!(matches!(
            canonical.messages[0].parts.first(),
            Some(CanonicalPart::ImageUrl { url, .. }) if url == "data:image/png;base64,AAAA"
        ));
    }

    #[test]
    fn test_thinking_block_keeps_signature() {
        let req = request(vec![AnthropicMessage {
            role: "assistant".to_string(),
            content: serde_json::json!([
                {"type": "thinking", "thinking": "hmm", "signature": "sig-1"},
                {"type": "text", "text": "done"}
            ]),
        }]);

        let canonical = decode_anthropic_request(&req, uuid::Uuid::from_u128(1)).unwrap();
        assert!(matches!(
            canonical.messages[0].parts.first(),
            Some(CanonicalPart::Reasoning { text, signature: Some(sig) }) if text == "hmm" && sig == "sig-1"
        ));
    }
}

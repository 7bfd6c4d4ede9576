use serde_json::Value;

use crate::error::CanonicalError;
use crate::protocol::canonical::{
    provider_extensions_from_map, CanonicalMessage, CanonicalPart, CanonicalRequest,
    CanonicalRole, CanonicalToolChoice, CanonicalToolFunction, CanonicalToolSpec,
    GenerationParams, ReasoningConfig, WireApi,
};
use crate::protocol::mapping::openai_role_to_canonical;
use crate::util::raw_arguments_or_empty;

use super::{OpenAiChatRequest, OpenAiMessage, OpenAiStop, OpenAiTool, OpenAiToolChoice};

/// Decode a Chat Completions wire request into the canonical IR.
///
/// System and developer turns are lifted into `system_prompt`. Unrecognized
/// top-level keys (`logprobs`, `logit_bias`, `response_format`, ...) stay in
/// the provider extensions, where the parameter mapper inspects them.
///
/// # Errors
///
/// Returns [`CanonicalError`] when any message payload cannot be decoded.
pub fn decode_openai_chat_request(
    request: &OpenAiChatRequest,
    request_id: uuid::Uuid,
) -> Result<CanonicalRequest, CanonicalError> {
    let mut system_parts: Vec<String> = Vec::new();
    let mut messages: Vec<CanonicalMessage> = Vec::with_capacity(request.messages.len());
    for msg in &request.messages {
        let role = openai_role_to_canonical(&msg.role);
        if role == CanonicalRole::System {
            if let Some(text) = extract_text_content(msg.content.as_ref()) {
                system_parts.push(text);
            }
            continue;
        }
        messages.push(decode_message(role, msg));
    }

    let mut canonical =
        CanonicalRequest::empty(request_id, WireApi::OpenAiChat, request.model.clone());
    canonical.stream = request.stream.unwrap_or(false);
    canonical.include_usage = request
        .stream_options
        .as_ref()
        .and_then(|opts| opts.include_usage)
        .unwrap_or(false);
    canonical.system_prompt = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n"))
    };
    canonical.messages = messages;
    canonical.tools = decode_tools(request.tools.as_deref()).into();
    canonical.tool_choice = decode_tool_choice(request.tool_choice.as_ref());
    canonical.generation = GenerationParams {
        temperature: request.temperature,
        max_tokens: request.max_completion_tokens.or(request.max_tokens),
        top_p: request.top_p,
        top_k: None,
        frequency_penalty: request.frequency_penalty,
        presence_penalty: request.presence_penalty,
        n: request.n,
        stop: decode_stop(request.stop.as_ref()),
        seed: request.seed,
    };
    canonical.reasoning = request.reasoning_effort.as_ref().map(|effort| ReasoningConfig {
        effort: Some(effort.clone()),
        summary: None,
        budget_tokens: None,
    });
    canonical.metadata = request.metadata.clone();
    canonical.parallel_tool_calls = request.parallel_tool_calls;
    canonical.user = request.user.clone();

    let mut extra = request.extra.clone();
    // some clients send Messages-style `top_k` to Chat endpoints
    if let Some(top_k) = extra.remove("top_k").as_ref().and_then(Value::as_u64) {
        canonical.generation.top_k = Some(top_k);
    }
    canonical.provider_extensions = provider_extensions_from_map(extra);
    Ok(canonical)
}

/// Extract plain text from a message `content` field.
pub(crate) fn extract_text_content(content: Option<&Value>) -> Option<String> {
    match content {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Array(arr)) => {
            let mut text = String::new();
            for part in arr {
                if part.get("type").and_then(Value::as_str) != Some("text") {
                    continue;
                }
                if let Some(content) = part.get("text").and_then(Value::as_str) {
                    text.push_str(content);
                }
            }
            if text.is_empty() {
                None
            } else {
                Some(text)
            }
        }
        None | Some(_) => None,
    }
}

fn decode_message(role: CanonicalRole, msg: &OpenAiMessage) -> CanonicalMessage {
    if role == CanonicalRole::Tool {
        let tool_call_id = msg.tool_call_id.clone().unwrap_or_default();
        let mut message = CanonicalMessage::new(
            role,
            vec![CanonicalPart::ToolResult {
                tool_call_id,
                content: extract_text_content(msg.content.as_ref()).unwrap_or_default(),
            }],
        );
        message.name.clone_from(&msg.name);
        message.tool_call_id.clone_from(&msg.tool_call_id);
        return message;
    }

    let mut parts: Vec<CanonicalPart> = Vec::with_capacity(
        usize::from(msg.refusal.is_some())
            + usize::from(msg.reasoning_content.is_some())
            + msg.tool_calls.as_ref().map_or(0, Vec::len)
            + match &msg.content {
                Some(Value::Array(arr)) => arr.len(),
                _ => 1,
            },
    );

    if let Some(reasoning) = msg.reasoning_content.as_ref().filter(|r| !r.is_empty()) {
        parts.push(CanonicalPart::Reasoning {
            text: reasoning.clone(),
            signature: None,
        });
    }

    if let Some(ref refusal) = msg.refusal {
        parts.push(CanonicalPart::Refusal(refusal.clone()));
    }

    match &msg.content {
        Some(Value::String(s)) => {
            if !s.is_empty() {
                parts.push(CanonicalPart::Text(s.clone()));
            }
        }
        Some(Value::Array(arr)) => {
            for part in arr {
                match part.get("type").and_then(Value::as_str) {
                    Some("text") => {
                        if let Some(t) = part.get("text").and_then(Value::as_str) {
                            parts.push(CanonicalPart::Text(t.to_string()));
                        }
                    }
                    Some("image_url") => {
                        if let Some(img) = part.get("image_url") {
                            let url = match img {
                                Value::String(url) => url.clone(),
                                _ => img
                                    .get("url")
                                    .and_then(Value::as_str)
                                    .unwrap_or("")
                                    .to_string(),
                            };
                            let detail = img
                                .get("detail")
                                .and_then(Value::as_str)
                                .map(ToString::to_string);
                            parts.push(CanonicalPart::ImageUrl { url, detail });
                        }
                    }
                    other => {
                        tracing::debug!(part_type = ?other, "skipping unsupported content part");
                    }
                }
            }
        }
        _ => {}
    }

    if let Some(ref tool_calls) = msg.tool_calls {
        for tc in tool_calls {
            parts.push(CanonicalPart::ToolCall {
                id: tc.id.clone(),
                name: tc.function.name.clone(),
                arguments: raw_arguments_or_empty(
                    tc.function.arguments.clone(),
                    "Chat Completions tool call",
                ),
            });
        }
    }

    let mut message = CanonicalMessage::new(role, parts);
    message.name.clone_from(&msg.name);
    message
}

fn decode_tools(tools: Option<&[OpenAiTool]>) -> Vec<CanonicalToolSpec> {
    let Some(tools) = tools else {
        return Vec::new();
    };
    tools
        .iter()
        .filter(|tool| tool.type_ == "function")
        .map(|tool| CanonicalToolSpec {
            function: CanonicalToolFunction {
                name: tool.function.name.clone(),
                description: tool.function.description.clone(),
                parameters: tool
                    .function
                    .parameters
                    .clone()
                    .unwrap_or_else(|| Value::Object(serde_json::Map::new())),
            },
        })
        .collect()
}

fn decode_tool_choice(val: Option<&OpenAiToolChoice>) -> CanonicalToolChoice {
    match val {
        None => CanonicalToolChoice::Auto,
        Some(OpenAiToolChoice::Mode(mode)) => match mode.as_str() {
            "none" => CanonicalToolChoice::None,
            "required" => CanonicalToolChoice::Required,
            _ => CanonicalToolChoice::Auto,
        },
        Some(OpenAiToolChoice::Function(call)) => {
            CanonicalToolChoice::Specific(call.function.name.clone())
        }
    }
}

fn decode_stop(val: Option<&OpenAiStop>) -> Option<Vec<String>> {
    match val {
        None => None,
        Some(OpenAiStop::Single(s)) => Some(vec![s.clone()]),
        Some(OpenAiStop::Multi(items)) if items.is_empty() => None,
        Some(OpenAiStop::Multi(items)) => Some(items.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_request(messages: &[Value]) -> OpenAiChatRequest {
        serde_json::from_value(json!({
            "model": "gpt-4o",
            "messages": messages,
        }))
        .unwrap()
    }

    #[test]
    fn test_simple_user_message() {
        let req = make_request(&[json!({"role": "user", "content": "Hello"})]);
        let canon = decode_openai_chat_request(&req, uuid::Uuid::nil()).unwrap();
        assert_eq!(canon.client_api, WireApi::OpenAiChat);
        assert_eq!(canon.messages.len(), 1);
        assert!(matches!(&canon.messages[0].parts[0], CanonicalPart::Text(t) if t == "Hello"));
    }

    #[test]
    fn test_system_and_developer_extraction() {
        let req = make_request(&[
            json!({"role": "system", "content": "You are helpful."}),
            json!({"role": "developer", "content": "Answer in French."}),
            json!({"role": "user", "content": "Hi"}),
        ]);
        let canon = decode_openai_chat_request(&req, uuid::Uuid::nil()).unwrap();
        assert_eq!(
            canon.system_prompt.as_deref(),
            Some("You are helpful.\nAnswer in French.")
        );
        assert_eq!(canon.messages.len(), 1);
    }

    #[test]
    fn test_tool_choice_specific() {
        let req: OpenAiChatRequest = serde_json::from_value(json!({
            "model": "gpt-4o",
            "messages": [],
            "tool_choice": {"type": "function", "function": {"name": "get_weather"}}
        }))
        .unwrap();
        let canon = decode_openai_chat_request(&req, uuid::Uuid::nil()).unwrap();
        assert_eq!(
            canon.tool_choice,
            CanonicalToolChoice::Specific("get_weather".to_string())
        );
    }

    #[test]
    fn test_tool_message() {
        let req = make_request(&[json!({
            "role": "tool",
            "content": "result data",
            "tool_call_id": "call_123"
        })]);
        let canon = decode_openai_chat_request(&req, uuid::Uuid::nil()).unwrap();
        assert!(matches!(
            &canon.messages[0].parts[0],
            CanonicalPart::ToolResult { tool_call_id, content }
                if tool_call_id == "call_123" && content == "result data"
        ));
    }

    #[test]
    fn test_assistant_tool_calls_with_broken_arguments_are_not_fatal() {
        let req = make_request(&[json!({
            "role": "assistant",
            "content": null,
            "tool_calls": [{
                "id": "call_abc",
                "type": "function",
                "function": {"name": "get_weather", "arguments": "{\"location\":"}
            }]
        })]);
        let canon = decode_openai_chat_request(&req, uuid::Uuid::nil()).unwrap();
        assert!(matches!(
            &canon.messages[0].parts[0],
            CanonicalPart::ToolCall { id, arguments, .. }
                if id == "call_abc" && arguments.get() == "{}"
        ));
    }

    #[test]
    fn test_multipart_content() {
        let req = make_request(&[json!({
            "role": "user",
            "content": [
                {"type": "text", "text": "Describe this:"},
                {"type": "image_url", "image_url": {"url": "https://example.com/img.png", "detail": "high"}}
            ]
        })]);
        let canon = decode_openai_chat_request(&req, uuid::Uuid::nil()).unwrap();
        assert_eq!(canon.messages[0].parts.len(), 2);
        assert!(matches!(
            &canon.messages[0].parts[1],
            CanonicalPart::ImageUrl { url, detail }
                if url == "https://example.com/img.png" && detail.as_deref() == Some("high")
        ));
    }

    #[test]
    fn test_generation_params_and_extensions() {
        let req: OpenAiChatRequest = serde_json::from_value(json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "Hi"}],
            "temperature": 0.7,
            "max_tokens": 100,
            "top_p": 0.9,
            "n": 2,
            "seed": 7,
            "stop": ["END", "STOP"],
            "stream": true,
            "stream_options": {"include_usage": true},
            "reasoning_effort": "high",
            "logit_bias": {"50256": -100}
        }))
        .unwrap();
        let canon = decode_openai_chat_request(&req, uuid::Uuid::nil()).unwrap();
        assert_eq!(canon.generation.temperature, Some(0.7));
        assert_eq!(canon.generation.max_tokens, Some(100));
        assert_eq!(canon.generation.n, Some(2));
        assert_eq!(canon.generation.seed, Some(7));
        assert_eq!(
            canon.generation.stop,
            Some(vec!["END".to_string(), "STOP".to_string()])
        );
        assert!(canon.stream && canon.include_usage);
        assert_eq!(
            canon.reasoning.as_ref().and_then(|r| r.effort.as_deref()),
            Some("high")
        );
        assert!(canon.provider_extensions_ref().contains_key("logit_bias"));
    }
}

use serde_json::Value;

use crate::error::CanonicalError;
use crate::protocol::canonical::{
    provider_extensions_to_map, CanonicalMessage, CanonicalPart, CanonicalRequest, CanonicalRole,
    CanonicalToolChoice, CanonicalToolSpec,
};
use crate::protocol::mapping::canonical_role_to_openai;

use super::{
    OpenAiChatRequest, OpenAiMessage, OpenAiStop, OpenAiStreamOptions, OpenAiTool,
    OpenAiToolCall, OpenAiToolCallFunction, OpenAiToolChoice, OpenAiToolChoiceFunction,
    OpenAiToolChoiceFunctionCall, OpenAiToolFunction,
};

/// Encode a canonical request into the Chat Completions wire format.
///
/// Streaming requests always ask the backend for a trailing usage chunk.
///
/// # Errors
///
/// Returns [`CanonicalError`] when any canonical message cannot be encoded.
pub fn encode_openai_chat_request(
    canonical: &CanonicalRequest,
) -> Result<OpenAiChatRequest, CanonicalError> {
    let mut messages: Vec<OpenAiMessage> = Vec::with_capacity(
        canonical.messages.len() + usize::from(canonical.system_prompt.is_some()),
    );

    if let Some(ref system) = canonical.system_prompt {
        messages.push(OpenAiMessage {
            role: "system".to_string(),
            content: Some(Value::String(system.clone())),
            ..OpenAiMessage::default()
        });
    }
    for msg in &canonical.messages {
        encode_message(msg, &mut messages);
    }

    let has_tools = !canonical.tools.is_empty();
    let tools = has_tools.then(|| canonical.tools.iter().map(encode_tool).collect());
    let tool_choice = encode_tool_choice(&canonical.tool_choice, &canonical.tools);

    let stop = canonical.generation.stop.as_ref().map(|stops| match stops.as_slice() {
        [single] => OpenAiStop::Single(single.clone()),
        _ => OpenAiStop::Multi(stops.clone()),
    });

    Ok(OpenAiChatRequest {
        model: canonical.model.clone(),
        messages,
        tools,
        tool_choice,
        parallel_tool_calls: canonical.parallel_tool_calls.filter(|_| has_tools),
        stream: canonical.stream.then_some(true),
        stream_options: canonical.stream.then_some(OpenAiStreamOptions {
            include_usage: Some(true),
        }),
        temperature: canonical.generation.temperature,
        max_tokens: canonical.generation.max_tokens,
        max_completion_tokens: None,
        top_p: canonical.generation.top_p,
        frequency_penalty: canonical.generation.frequency_penalty,
        presence_penalty: canonical.generation.presence_penalty,
        n: canonical.generation.n,
        stop,
        seed: canonical.generation.seed,
        reasoning_effort: canonical
            .reasoning
            .as_ref()
            .and_then(|r| r.effort_or_from_budget()),
        metadata: canonical.metadata.clone(),
        user: canonical.user.clone(),
        extra: provider_extensions_to_map(&canonical.provider_extensions),
    })
}

/// One canonical message may become several Chat messages: every tool
/// result is its own `tool` turn.
fn encode_message(msg: &CanonicalMessage, out: &mut Vec<OpenAiMessage>) {
    let mut text_parts: Vec<&str> = Vec::new();
    let mut image_parts: Vec<Value> = Vec::new();
    let mut tool_calls: Vec<OpenAiToolCall> = Vec::new();
    let mut reasoning = String::new();
    let mut refusal: Option<String> = None;

    for part in &msg.parts {
        match part {
            CanonicalPart::Text(t) => text_parts.push(t),
            CanonicalPart::ImageUrl { url, detail } => {
                let mut img_obj = serde_json::json!({"url": url});
                if let Some(d) = detail {
                    img_obj["detail"] = Value::String(d.clone());
                }
                image_parts.push(serde_json::json!({
                    "type": "image_url",
                    "image_url": img_obj,
                }));
            }
            CanonicalPart::ToolCall {
                id,
                name,
                arguments,
            } => tool_calls.push(OpenAiToolCall {
                id: id.clone(),
                type_: "function".to_string(),
                function: OpenAiToolCallFunction {
                    name: name.clone(),
                    arguments: arguments.get().to_string(),
                },
            }),
            CanonicalPart::ToolResult {
                tool_call_id,
                content,
            } => out.push(OpenAiMessage {
                role: "tool".to_string(),
                content: Some(Value::String(content.clone())),
                tool_call_id: Some(tool_call_id.clone()),
                ..OpenAiMessage::default()
            }),
            CanonicalPart::Reasoning { text, .. } => reasoning.push_str(text),
            CanonicalPart::Refusal(r) => refusal = Some(r.clone()),
        }
    }

    if msg.role == CanonicalRole::Tool {
        return;
    }

    let content = if !image_parts.is_empty() {
        let mut arr: Vec<Value> = text_parts
            .iter()
            .map(|t| serde_json::json!({"type": "text", "text": t}))
            .collect();
        arr.extend(image_parts);
        Some(Value::Array(arr))
    } else if text_parts.is_empty() {
        None
    } else {
        Some(Value::String(text_parts.concat()))
    };

    if content.is_none() && tool_calls.is_empty() && refusal.is_none() && reasoning.is_empty() {
        return;
    }

    out.push(OpenAiMessage {
        role: canonical_role_to_openai(msg.role).to_string(),
        content,
        reasoning_content: (msg.role == CanonicalRole::Assistant && !reasoning.is_empty())
            .then_some(reasoning),
        name: msg.name.clone(),
        tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
        tool_call_id: None,
        refusal,
    });
}

fn encode_tool(spec: &CanonicalToolSpec) -> OpenAiTool {
    OpenAiTool {
        type_: "function".to_string(),
        function: OpenAiToolFunction {
            name: spec.function.name.clone(),
            description: spec.function.description.clone(),
            parameters: Some(spec.function.parameters.clone()),
        },
    }
}

fn encode_tool_choice(
    choice: &CanonicalToolChoice,
    tools: &[CanonicalToolSpec],
) -> Option<OpenAiToolChoice> {
    if tools.is_empty() {
        return None;
    }
    Some(match choice {
        CanonicalToolChoice::Auto => OpenAiToolChoice::Mode("auto".to_string()),
        CanonicalToolChoice::None => OpenAiToolChoice::Mode("none".to_string()),
        CanonicalToolChoice::Required => OpenAiToolChoice::Mode("required".to_string()),
        CanonicalToolChoice::Specific(name) => {
            OpenAiToolChoice::Function(OpenAiToolChoiceFunctionCall {
                type_: "function".to_string(),
                function: OpenAiToolChoiceFunction { name: name.clone() },
            })
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::canonical::WireApi;
    use crate::protocol::openai_chat::decoder::decode_openai_chat_request;
    use crate::util::raw_value_from_string;

    fn make_canonical_request(messages: Vec<CanonicalMessage>) -> CanonicalRequest {
        let mut req = CanonicalRequest::empty(uuid::Uuid::nil(), WireApi::Anthropic, "gpt-4o".into());
        req.messages = messages;
        req
    }

    #[test]
    fn test_roundtrip_simple() {
        let wire: OpenAiChatRequest = serde_json::from_value(serde_json::json!({
            "model": "gpt-4o",
            "messages": [
                {"role": "system", "content": "Be concise."},
                {"role": "user", "content": "What is 2+2?"},
            ]
        }))
        .unwrap();

        let canonical = decode_openai_chat_request(&wire, uuid::Uuid::nil()).unwrap();
        let re_encoded = encode_openai_chat_request(&canonical).unwrap();

        assert_eq!(re_encoded.model, "gpt-4o");
        assert_eq!(re_encoded.messages.len(), 2);
        assert_eq!(re_encoded.messages[0].role, "system");
        assert_eq!(
            re_encoded.messages[0].content,
            Some(Value::String("Be concise.".to_string()))
        );
        assert_eq!(re_encoded.messages[1].role, "user");
    }

    #[test]
    fn test_encode_tool_calls() {
        let msg = CanonicalMessage::new(
            CanonicalRole::Assistant,
            vec![CanonicalPart::ToolCall {
                id: "call_1".to_string(),
                name: "my_func".to_string(),
                arguments: raw_value_from_string("{\"x\":1}".to_string(), "test").unwrap(),
            }],
        );
        let wire = encode_openai_chat_request(&make_canonical_request(vec![msg])).unwrap();
        let tc = wire.messages[0].tool_calls.as_ref().unwrap();
        assert_eq!(tc[0].id, "call_1");
        assert_eq!(tc[0].function.name, "my_func");
        assert_eq!(tc[0].function.arguments, "{\"x\":1}");
        assert_eq!(wire.messages[0].content, None);
    }

    #[test]
    fn test_user_turn_with_results_splits_into_tool_messages() {
        let msg = CanonicalMessage::new(
            CanonicalRole::User,
            vec![
                CanonicalPart::ToolResult {
                    tool_call_id: "call_1".to_string(),
                    content: "42".to_string(),
                },
                CanonicalPart::ToolResult {
                    tool_call_id: "call_2".to_string(),
                    content: "43".to_string(),
                },
                CanonicalPart::Text("thanks".to_string()),
            ],
        );
        let wire = encode_openai_chat_request(&make_canonical_request(vec![msg])).unwrap();
        let roles: Vec<&str> = wire.messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["tool", "tool", "user"]);
        assert_eq!(wire.messages[1].tool_call_id.as_deref(), Some("call_2"));
    }

    #[test]
    fn test_streaming_requests_usage_and_thinking_budget_maps_to_effort() {
        let mut req = make_canonical_request(vec![CanonicalMessage::new(
            CanonicalRole::User,
            vec![CanonicalPart::Text("hi".into())],
        )]);
        req.stream = true;
        req.reasoning = Some(crate::protocol::canonical::ReasoningConfig {
            budget_tokens: Some(16_000),
            ..Default::default()
        });
        let wire = encode_openai_chat_request(&req).unwrap();
        assert_eq!(
            wire.stream_options.and_then(|o| o.include_usage),
            Some(true)
        );
        assert_eq!(wire.reasoning_effort.as_deref(), Some("high"));
    }
}

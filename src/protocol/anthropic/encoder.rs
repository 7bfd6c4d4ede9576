use serde_json::{json, Value};

use crate::error::CanonicalError;
use crate::protocol::anthropic::{
    AnthropicMessage, AnthropicRequest, AnthropicThinkingConfig, AnthropicTool,
};
use crate::protocol::canonical::{
    provider_extensions_to_map, CanonicalPart, CanonicalRequest, CanonicalRole,
    CanonicalToolChoice, CanonicalToolSpec,
};
use crate::protocol::mapping::{canonical_role_to_anthropic, split_data_uri};

/// Used when neither the client nor the translator supplied `max_tokens`.
pub const DEFAULT_MAX_TOKENS: u64 = 4096;

/// Smallest thinking budget the Messages API accepts.
const MIN_THINKING_BUDGET: u64 = 1024;

/// Encode a canonical request into the Messages API wire format.
///
/// System-role turns are folded into the top-level `system` field, and
/// consecutive turns that land on the same Messages role are merged so tool
/// results follow the assistant turn that requested them.
///
/// # Errors
///
/// Returns [`CanonicalError`] when a canonical part cannot be encoded.
pub fn encode_anthropic_request(
    canonical: &CanonicalRequest,
) -> Result<AnthropicRequest, CanonicalError> {
    let mut system_texts: Vec<String> = canonical.system_prompt.iter().cloned().collect();
    let mut messages: Vec<AnthropicMessage> = Vec::with_capacity(canonical.messages.len());
    for msg in &canonical.messages {
        if msg.role == CanonicalRole::System {
            let text = msg.text();
            if !text.is_empty() {
                system_texts.push(text);
            }
            continue;
        }

        let role = canonical_role_to_anthropic(msg.role);
        let mut blocks = encode_parts(msg.role, &msg.parts)?;
        if blocks.is_empty() {
            continue;
        }
        match messages.last_mut() {
            Some(prev) if prev.role == role => {
                if let Value::Array(existing) = &mut prev.content {
                    if blocks.first().and_then(|b| b.get("type")).and_then(Value::as_str)
                        == Some("tool_result")
                    {
                        // tool results stay ahead of any text in the merged turn
                        let split = existing
                            .iter()
                            .position(|b| b.get("type").and_then(Value::as_str) != Some("tool_result"))
                            .unwrap_or(existing.len());
                        let tail: Vec<Value> = existing.drain(split..).collect();
                        existing.append(&mut blocks);
                        existing.extend(tail);
                    } else {
                        existing.append(&mut blocks);
                    }
                }
            }
            _ => messages.push(AnthropicMessage {
                role: role.to_string(),
                content: Value::Array(blocks),
            }),
        }
    }

    let tools = if canonical.tools.is_empty() {
        None
    } else {
        Some(
            canonical
                .tools
                .iter()
                .map(|t| AnthropicTool {
                    name: t.function.name.clone(),
                    description: t.function.description.clone(),
                    input_schema: t.function.parameters.clone(),
                })
                .collect(),
        )
    };

    let tool_choice = encode_tool_choice(
        &canonical.tool_choice,
        &canonical.tools,
        canonical.parallel_tool_calls,
    );
    let max_tokens = canonical.generation.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS);
    let thinking = canonical
        .reasoning
        .as_ref()
        .and_then(|r| r.budget_or_from_effort())
        .and_then(|budget| thinking_for_budget(budget, max_tokens));

    let metadata = canonical.user.as_ref().map(|user| {
        let mut map = serde_json::Map::new();
        map.insert("user_id".to_string(), Value::String(user.clone()));
        map
    });

    let system = if system_texts.is_empty() {
        None
    } else {
        Some(Value::String(system_texts.join("\n\n")))
    };

    Ok(AnthropicRequest {
        model: canonical.model.clone(),
        max_tokens,
        system,
        messages,
        tools,
        tool_choice,
        stream: canonical.stream.then_some(true),
        temperature: canonical.generation.temperature,
        top_p: canonical.generation.top_p,
        top_k: canonical.generation.top_k,
        stop_sequences: canonical.generation.stop.clone(),
        thinking,
        metadata,
        extra: provider_extensions_to_map(&canonical.provider_extensions),
    })
}

fn thinking_for_budget(budget: u64, max_tokens: u64) -> Option<AnthropicThinkingConfig> {
    if max_tokens <= MIN_THINKING_BUDGET {
        tracing::debug!(max_tokens, "max_tokens too small for extended thinking; omitting");
        return None;
    }
    let budget_tokens = budget.clamp(MIN_THINKING_BUDGET, max_tokens - 1);
    Some(AnthropicThinkingConfig::Enabled { budget_tokens })
}

/// Encode canonical parts into Messages content blocks.
fn encode_parts(role: CanonicalRole, parts: &[CanonicalPart]) -> Result<Vec<Value>, CanonicalError> {
    let mut blocks = Vec::with_capacity(parts.len());
    // tool_result blocks must come first in a user turn
    if matches!(role, CanonicalRole::User | CanonicalRole::Tool) {
        for part in parts {
            if matches!(part, CanonicalPart::ToolResult { .. }) {
                encode_part(part, &mut blocks)?;
            }
        }
        for part in parts {
            if !matches!(part, CanonicalPart::ToolResult { .. }) {
                encode_part(part, &mut blocks)?;
            }
        }
    } else {
        for part in parts {
            encode_part(part, &mut blocks)?;
        }
    }
    Ok(blocks)
}

fn encode_part(part: &CanonicalPart, blocks: &mut Vec<Value>) -> Result<(), CanonicalError> {
    match part {
        CanonicalPart::Text(text) | CanonicalPart::Refusal(text) => {
            if !text.is_empty() {
                blocks.push(json!({"type": "text", "text": text}));
            }
        }
        CanonicalPart::Reasoning { text, signature } => match signature {
            Some(signature) => blocks.push(json!({
                "type": "thinking",
                "thinking": text,
                "signature": signature,
            })),
            None => {
                tracing::debug!("dropping unsigned reasoning from Messages history");
            }
        },
        CanonicalPart::ToolCall {
            id,
            name,
            arguments,
        } => {
            let input: Value = serde_json::from_str(arguments.get()).map_err(|e| {
                CanonicalError::Translation(format!("tool call `{name}` arguments: {e}"))
            })?;
            let input = if input.is_object() { input } else { json!({}) };
            blocks.push(json!({
                "type": "tool_use",
                "id": id,
                "name": name,
                "input": input,
            }));
        }
        CanonicalPart::ToolResult {
            tool_call_id,
            content,
        } => {
            blocks.push(json!({
                "type": "tool_result",
                "tool_use_id": tool_call_id,
                "content": content,
            }));
        }
        CanonicalPart::ImageUrl { url, .. } => {
            let source = match split_data_uri(url) {
                Some((media_type, data)) => json!({
                    "type": "base64",
                    "media_type": media_type,
                    "data": data,
                }),
                None => json!({"type": "url", "url": url}),
            };
            blocks.push(json!({"type": "image", "source": source}));
        }
    }
    Ok(())
}

fn encode_tool_choice(
    choice: &CanonicalToolChoice,
    tools: &[CanonicalToolSpec],
    parallel_tool_calls: Option<bool>,
) -> Option<Value> {
    if tools.is_empty() {
        return None;
    }
    let mut value = match choice {
        CanonicalToolChoice::Auto => json!({"type": "auto"}),
        CanonicalToolChoice::None => json!({"type": "none"}),
        CanonicalToolChoice::Required => json!({"type": "any"}),
        CanonicalToolChoice::Specific(name) => json!({"type": "tool", "name": name}),
    };
    if parallel_tool_calls == Some(false) && !matches!(choice, CanonicalToolChoice::None) {
        value["disable_parallel_tool_use"] = Value::Bool(true);
    }
    Some(value)
}

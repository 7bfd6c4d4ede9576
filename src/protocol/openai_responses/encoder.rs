use serde_json::{json, Value};

use crate::error::CanonicalError;
use crate::protocol::canonical::{
    provider_extensions_to_map, CanonicalMessage, CanonicalPart, CanonicalRequest, CanonicalRole,
    CanonicalToolChoice,
};

use super::decoder::BUILTIN_TOOLS_KEY;
use super::{ResponsesReasoning, ResponsesRequest, ResponsesTool};

/// Encode a canonical request into a Responses API request.
///
/// Reasoning from earlier turns is not replayed: Responses only accepts
/// reasoning items it issued itself.
///
/// # Errors
///
/// Returns [`CanonicalError`] when the request cannot be represented.
pub fn encode_responses_request(
    canonical: &CanonicalRequest,
) -> Result<ResponsesRequest, CanonicalError> {
    let mut extra = provider_extensions_to_map(&canonical.provider_extensions);

    let mut tools: Vec<ResponsesTool> = canonical
        .tools
        .iter()
        .map(|t| ResponsesTool::Function {
            name: t.function.name.clone(),
            description: t.function.description.clone(),
            parameters: Some(t.function.parameters.clone()),
            strict: None,
        })
        .collect();
    if let Some(Value::Array(builtins)) = extra.remove(BUILTIN_TOOLS_KEY) {
        tools.extend(builtins.into_iter().filter_map(restore_builtin_tool));
    }

    let previous_response_id = extra
        .remove("previous_response_id")
        .and_then(|v| v.as_str().map(ToString::to_string));
    let store = extra.remove("store").and_then(|v| v.as_bool());

    let items: Vec<Value> = canonical.messages.iter().flat_map(encode_message).collect();

    let reasoning = canonical.reasoning.as_ref().and_then(|r| {
        let effort = r.effort_or_from_budget();
        (effort.is_some() || r.summary.is_some()).then(|| ResponsesReasoning {
            effort,
            summary: r.summary.clone(),
        })
    });

    let has_tools = !tools.is_empty();
    Ok(ResponsesRequest {
        model: canonical.model.clone(),
        input: Value::Array(items),
        instructions: canonical.system_prompt.clone(),
        tool_choice: has_tools.then(|| encode_tool_choice(&canonical.tool_choice)),
        tools: has_tools.then_some(tools),
        parallel_tool_calls: canonical.parallel_tool_calls.filter(|_| has_tools),
        previous_response_id,
        store,
        stream: canonical.stream.then_some(true),
        temperature: canonical.generation.temperature,
        max_output_tokens: canonical.generation.max_tokens,
        top_p: canonical.generation.top_p,
        reasoning,
        metadata: canonical.metadata.clone(),
        user: canonical.user.clone(),
        extra,
    })
}

fn restore_builtin_tool(entry: Value) -> Option<ResponsesTool> {
    let Value::Object(mut fields) = entry else {
        return None;
    };
    let tool_type = fields.remove("type")?;
    match tool_type.as_str()? {
        "web_search" => Some(ResponsesTool::WebSearch { extra: fields }),
        "file_search" => Some(ResponsesTool::FileSearch { extra: fields }),
        other => {
            tracing::debug!(tool_type = other, "unknown built-in tool; dropped");
            None
        }
    }
}

pub(crate) fn encode_tool_choice(choice: &CanonicalToolChoice) -> Value {
    match choice {
        CanonicalToolChoice::Auto => Value::String("auto".into()),
        CanonicalToolChoice::None => Value::String("none".into()),
        CanonicalToolChoice::Required => Value::String("required".into()),
        CanonicalToolChoice::Specific(name) => json!({"type": "function", "name": name}),
    }
}

/// One canonical message becomes one message item plus a `function_call`
/// or `function_call_output` item per tool part.
fn encode_message(msg: &CanonicalMessage) -> Vec<Value> {
    let assistant = msg.role == CanonicalRole::Assistant;
    let role = match msg.role {
        CanonicalRole::Assistant => "assistant",
        CanonicalRole::System => "developer",
        CanonicalRole::User | CanonicalRole::Tool => "user",
    };

    let mut items = Vec::new();
    let mut content: Vec<Value> = Vec::new();
    for part in &msg.parts {
        match part {
            CanonicalPart::Text(text) => {
                let kind = if assistant { "output_text" } else { "input_text" };
                content.push(json!({"type": kind, "text": text}));
            }
            CanonicalPart::Refusal(refusal) if assistant => {
                content.push(json!({"type": "refusal", "refusal": refusal}));
            }
            CanonicalPart::Refusal(refusal) => {
                content.push(json!({"type": "input_text", "text": refusal}));
            }
            CanonicalPart::ImageUrl { url, detail } => {
                let mut image = json!({"type": "input_image", "image_url": url});
                if let Some(detail) = detail {
                    image["detail"] = Value::String(detail.clone());
                }
                content.push(image);
            }
            CanonicalPart::ToolCall {
                id,
                name,
                arguments,
            } => items.push(json!({
                "type": "function_call",
                "call_id": id,
                "name": name,
                "arguments": arguments.get(),
            })),
            CanonicalPart::ToolResult {
                tool_call_id,
                content: output,
            } => items.push(json!({
                "type": "function_call_output",
                "call_id": tool_call_id,
                "output": output,
            })),
            CanonicalPart::Reasoning { .. } => {
                tracing::debug!("reasoning from history is not replayed to Responses");
            }
        }
    }

    if !content.is_empty() {
        items.insert(
            0,
            json!({"type": "message", "role": role, "content": content}),
        );
    }
    items
}

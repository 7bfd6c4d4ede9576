use serde_json::Value;

use crate::error::CanonicalError;
use crate::protocol::canonical::{
    provider_extensions_from_map, CanonicalMessage, CanonicalPart, CanonicalRequest,
    CanonicalRole, CanonicalToolChoice, CanonicalToolFunction, CanonicalToolSpec,
    GenerationParams, ReasoningConfig, WireApi,
};
use crate::util::raw_value_from_string;

use super::{ResponsesRequest, ResponsesTool};

/// Extension key under which built-in (non-function) tools are carried.
pub const BUILTIN_TOOLS_KEY: &str = "responses_builtin_tools";

/// Decode a Responses API request into the canonical IR.
///
/// Sampling keys the Responses API has no field for (`n`, `stop`, `seed`,
/// penalties, `top_k`) are lifted out of the flattened extras into
/// [`GenerationParams`] so the parameter mapper can judge them.
///
/// # Errors
///
/// Returns [`CanonicalError`] when `input` has an unsupported shape or a
/// `function_call` item carries arguments that are not JSON.
pub fn decode_responses_request(
    request: &ResponsesRequest,
    request_id: uuid::Uuid,
) -> Result<CanonicalRequest, CanonicalError> {
    let mut extra = request.extra.clone();
    let tools = decode_tools(request.tools.as_deref(), &mut extra);
    if let Some(previous) = &request.previous_response_id {
        extra.insert(
            "previous_response_id".into(),
            Value::String(previous.clone()),
        );
    }
    if let Some(store) = request.store {
        extra.insert("store".into(), Value::Bool(store));
    }

    let mut canonical =
        CanonicalRequest::empty(request_id, WireApi::OpenAiResponses, request.model.clone());
    canonical.stream = request.stream.unwrap_or(false);
    canonical.include_usage = true;
    canonical.system_prompt = request.instructions.clone();
    canonical.messages = decode_input(&request.input)?;
    canonical.tools = tools.into();
    canonical.tool_choice = decode_tool_choice(request.tool_choice.as_ref());
    canonical.generation = GenerationParams {
        temperature: request.temperature,
        max_tokens: request.max_output_tokens,
        top_p: request.top_p,
        top_k: extra.remove("top_k").as_ref().and_then(Value::as_u64),
        frequency_penalty: extra.remove("frequency_penalty").as_ref().and_then(Value::as_f64),
        presence_penalty: extra.remove("presence_penalty").as_ref().and_then(Value::as_f64),
        n: extra
            .remove("n")
            .as_ref()
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok()),
        stop: extra.remove("stop").as_ref().and_then(decode_stop),
        seed: extra.remove("seed").as_ref().and_then(Value::as_i64),
    };
    canonical.reasoning = request.reasoning.as_ref().map(|r| ReasoningConfig {
        effort: r.effort.clone(),
        summary: r.summary.clone(),
        budget_tokens: None,
    });
    canonical.metadata = request.metadata.clone();
    canonical.parallel_tool_calls = request.parallel_tool_calls;
    canonical.user = request.user.clone();
    canonical.provider_extensions = provider_extensions_from_map(extra);
    Ok(canonical)
}

fn decode_stop(value: &Value) -> Option<Vec<String>> {
    match value {
        Value::String(s) => Some(vec![s.clone()]),
        Value::Array(items) => Some(
            items
                .iter()
                .filter_map(Value::as_str)
                .map(ToString::to_string)
                .collect(),
        ),
        _ => None,
    }
}

fn decode_tools(
    tools: Option<&[ResponsesTool]>,
    extra: &mut serde_json::Map<String, Value>,
) -> Vec<CanonicalToolSpec> {
    let Some(tools) = tools else {
        return Vec::new();
    };
    let mut specs = Vec::with_capacity(tools.len());
    let mut builtin = Vec::new();
    for tool in tools {
        match tool {
            ResponsesTool::Function {
                name,
                description,
                parameters,
                ..
            } => specs.push(CanonicalToolSpec {
                function: CanonicalToolFunction {
                    name: name.clone(),
                    description: description.clone(),
                    parameters: parameters
                        .clone()
                        .unwrap_or_else(|| Value::Object(serde_json::Map::new())),
                },
            }),
            ResponsesTool::WebSearch { extra: fields } => {
                builtin.push(builtin_tool_entry("web_search", fields));
            }
            ResponsesTool::FileSearch { extra: fields } => {
                builtin.push(builtin_tool_entry("file_search", fields));
            }
        }
    }
    if !builtin.is_empty() {
        extra.insert(BUILTIN_TOOLS_KEY.into(), Value::Array(builtin));
    }
    specs
}

fn builtin_tool_entry(tool_type: &str, fields: &serde_json::Map<String, Value>) -> Value {
    let mut entry = fields.clone();
    entry.insert("type".into(), Value::String(tool_type.into()));
    Value::Object(entry)
}

fn decode_tool_choice(tool_choice: Option<&Value>) -> CanonicalToolChoice {
    match tool_choice {
        Some(Value::String(mode)) => match mode.as_str() {
            "none" => CanonicalToolChoice::None,
            "required" => CanonicalToolChoice::Required,
            _ => CanonicalToolChoice::Auto,
        },
        Some(Value::Object(obj)) => {
            let name = obj
                .get("name")
                .or_else(|| obj.get("function").and_then(|f| f.get("name")))
                .and_then(Value::as_str)
                .filter(|name| !name.is_empty());
            if let Some(name) = name {
                return CanonicalToolChoice::Specific(name.to_string());
            }
            match obj.get("type").and_then(Value::as_str) {
                Some("none") => CanonicalToolChoice::None,
                Some("required") => CanonicalToolChoice::Required,
                Some("allowed_tools") => match obj.get("mode").and_then(Value::as_str) {
                    Some("none") => CanonicalToolChoice::None,
                    Some("required") => CanonicalToolChoice::Required,
                    _ => CanonicalToolChoice::Auto,
                },
                _ => CanonicalToolChoice::Auto,
            }
        }
        _ => CanonicalToolChoice::Auto,
    }
}

/// `input` is either a bare string (one user turn) or an array of items.
fn decode_input(input: &Value) -> Result<Vec<CanonicalMessage>, CanonicalError> {
    match input {
        Value::String(text) => Ok(vec![CanonicalMessage::new(
            CanonicalRole::User,
            vec![CanonicalPart::Text(text.clone())],
        )]),
        Value::Array(items) => items.iter().map(decode_input_item).collect(),
        _ => Err(CanonicalError::InvalidRequest(
            "Responses API `input` must be a string or array".into(),
        )),
    }
}

fn decode_input_item(item: &Value) -> Result<CanonicalMessage, CanonicalError> {
    let item_type = item.get("type").and_then(Value::as_str).unwrap_or("message");
    let str_field = |key: &str| {
        item.get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };

    match item_type {
        "message" => {
            let role = match item.get("role").and_then(Value::as_str) {
                Some("assistant") => CanonicalRole::Assistant,
                Some("system" | "developer") => CanonicalRole::System,
                _ => CanonicalRole::User,
            };
            Ok(CanonicalMessage::new(
                role,
                decode_message_parts(item.get("content")),
            ))
        }
        "function_call" => {
            let call_id = item
                .get("call_id")
                .or_else(|| item.get("id"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let arguments = match item.get("arguments") {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => "{}".to_string(),
            };
            let arguments = raw_value_from_string(arguments, "Responses function_call arguments")
                .map_err(|e| {
                    CanonicalError::InvalidRequest(format!(
                        "Responses function_call arguments must be valid JSON: {e}"
                    ))
                })?;
            Ok(CanonicalMessage::new(
                CanonicalRole::Assistant,
                vec![CanonicalPart::ToolCall {
                    id: call_id,
                    name: str_field("name"),
                    arguments,
                }],
            ))
        }
        "function_call_output" => {
            let call_id = str_field("call_id");
            let output = match item.get("output") {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Array(parts)) => parts
                    .iter()
                    .filter_map(|p| p.get("text").and_then(Value::as_str))
                    .collect(),
                _ => String::new(),
            };
            let mut message = CanonicalMessage::new(
                CanonicalRole::Tool,
                vec![CanonicalPart::ToolResult {
                    tool_call_id: call_id.clone(),
                    content: output,
                }],
            );
            message.tool_call_id = Some(call_id);
            Ok(message)
        }
        "reasoning" => {
            let text: String = item
                .get("summary")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n");
            let signature = item
                .get("encrypted_content")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(ToString::to_string);
            Ok(CanonicalMessage::new(
                CanonicalRole::Assistant,
                vec![CanonicalPart::Reasoning { text, signature }],
            ))
        }
        other => Err(CanonicalError::InvalidRequest(format!(
            "Unknown Responses API input item type: {other}"
        ))),
    }
}

fn decode_message_parts(content: Option<&Value>) -> Vec<CanonicalPart> {
    match content {
        Some(Value::String(text)) => vec![CanonicalPart::Text(text.clone())],
        Some(Value::Array(parts)) => parts.iter().filter_map(decode_content_part).collect(),
        _ => Vec::new(),
    }
}

fn decode_content_part(part: &Value) -> Option<CanonicalPart> {
    match part.get("type").and_then(Value::as_str).unwrap_or("input_text") {
        "refusal" => part
            .get("refusal")
            .and_then(Value::as_str)
            .map(|r| CanonicalPart::Refusal(r.to_string())),
        "input_image" => {
            let (url, detail) = match part.get("image_url") {
                Some(Value::String(url)) => (url.clone(), part.get("detail")),
                Some(obj @ Value::Object(_)) => (
                    obj.get("url")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    obj.get("detail"),
                ),
                _ => (String::new(), None),
            };
            if url.is_empty() {
                tracing::debug!("input_image without image_url; skipped");
                return None;
            }
            Some(CanonicalPart::ImageUrl {
                url,
                detail: detail.and_then(Value::as_str).map(ToString::to_string),
            })
        }
        _ => part
            .get("text")
            .and_then(Value::as_str)
            .map(|text| CanonicalPart::Text(text.to_string())),
    }
}

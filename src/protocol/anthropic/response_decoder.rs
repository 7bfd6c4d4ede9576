use crate::error::CanonicalError;
use crate::protocol::anthropic::{AnthropicContentBlock, AnthropicResponse};
use crate::protocol::canonical::{CanonicalPart, CanonicalResponse, CanonicalStopReason};
use crate::protocol::mapping::anthropic_stop_to_canonical;
use crate::protocol::usage::UsageSnapshot;

/// Decode a Messages API response into canonical form.
///
/// # Errors
///
/// Returns [`CanonicalError`] when tool payloads cannot be serialized into
/// canonical raw JSON arguments.
pub fn decode_anthropic_response(
    response: &AnthropicResponse,
) -> Result<CanonicalResponse, CanonicalError> {
    let mut content = Vec::with_capacity(response.content.len());
    for block in &response.content {
        match block {
            AnthropicContentBlock::Text { text } => {
                content.push(CanonicalPart::Text(text.clone()));
            }
            AnthropicContentBlock::Thinking {
                thinking,
                signature,
            } => {
                content.push(CanonicalPart::Reasoning {
                    text: thinking.clone(),
                    signature: signature.clone(),
                });
            }
            AnthropicContentBlock::RedactedThinking { .. } => {
                tracing::debug!("skipping redacted_thinking block");
            }
            AnthropicContentBlock::ToolUse { id, name, input } => {
                let raw = serde_json::value::to_raw_value(input).map_err(|e| {
                    CanonicalError::Translation(format!(
                        "Failed to convert tool_use input to RawValue: {e}"
                    ))
                })?;
                content.push(CanonicalPart::ToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    arguments: raw,
                });
            }
            AnthropicContentBlock::ToolResult {
                tool_use_id,
                content: result_content,
                ..
            } => {
                let text = match result_content {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                content.push(CanonicalPart::ToolResult {
                    tool_call_id: tool_use_id.clone(),
                    content: text,
                });
            }
        }
    }

    let stop_reason = response
        .stop_reason
        .as_deref()
        .map_or(CanonicalStopReason::EndOfTurn, anthropic_stop_to_canonical);

    Ok(CanonicalResponse {
        id: response.id.clone(),
        model: response.model.clone(),
        content,
        stop_reason,
        usage: UsageSnapshot::from(&response.usage),
    })
}

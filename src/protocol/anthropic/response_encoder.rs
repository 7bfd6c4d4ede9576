use crate::error::CanonicalError;
use crate::protocol::anthropic::{AnthropicContentBlock, AnthropicResponse};
use crate::protocol::canonical::{CanonicalPart, CanonicalResponse};
use crate::protocol::envelope::RequestEnvelope;
use crate::protocol::mapping::{canonical_stop_to_anthropic, IMAGE_PLACEHOLDER};

/// Encode a canonical response into the Messages API wire format.
///
/// The model and (when the backend id is foreign) the message id come from
/// the request envelope.
///
/// # Errors
///
/// Returns [`CanonicalError`] when the response cannot be represented.
pub fn encode_anthropic_response(
    canonical: &CanonicalResponse,
    envelope: &RequestEnvelope,
) -> Result<AnthropicResponse, CanonicalError> {
    let mut content = Vec::with_capacity(canonical.content.len());
    for part in &canonical.content {
        match part {
            CanonicalPart::Reasoning { text, signature } => {
                content.push(AnthropicContentBlock::Thinking {
                    thinking: text.clone(),
                    signature: signature.clone(),
                });
            }
            CanonicalPart::ToolCall {
                id,
                name,
                arguments,
            } => {
                let input = match serde_json::from_str::<serde_json::Value>(arguments.get()) {
                    Ok(value) if value.is_object() => value,
                    Ok(_) | Err(_) => {
                        tracing::warn!(tool = %name, "tool arguments are not a JSON object; sending {{}}");
                        serde_json::json!({})
                    }
                };
                content.push(AnthropicContentBlock::ToolUse {
                    id: id.clone(),
                    name: name.clone(),
                    input,
                });
            }
            CanonicalPart::ToolResult {
                tool_call_id,
                content: result_content,
            } => {
                content.push(AnthropicContentBlock::ToolResult {
                    tool_use_id: tool_call_id.clone(),
                    content: serde_json::Value::String(result_content.clone()),
                    is_error: None,
                });
            }
            CanonicalPart::ImageUrl { .. } => {
                content.push(AnthropicContentBlock::Text {
                    text: IMAGE_PLACEHOLDER.to_string(),
                });
            }
            CanonicalPart::Text(text) | CanonicalPart::Refusal(text) => {
                content.push(AnthropicContentBlock::Text { text: text.clone() });
            }
        }
    }

    let id = if canonical.id.starts_with("msg_") {
        canonical.id.clone()
    } else {
        envelope.anthropic_message_id()
    };

    Ok(AnthropicResponse {
        id,
        type_: "message".to_string(),
        role: "assistant".to_string(),
        model: envelope.model.clone(),
        content,
        stop_reason: Some(canonical_stop_to_anthropic(canonical.stop_reason).to_string()),
        stop_sequence: None,
        usage: canonical.usage.to_anthropic(),
    })
}

use serde_json::Value;

use crate::error::CanonicalError;
use crate::protocol::canonical::{CanonicalPart, CanonicalResponse};
use crate::protocol::envelope::RequestEnvelope;
use crate::protocol::mapping::{canonical_stop_to_openai, IMAGE_PLACEHOLDER};
use crate::stream::tool_args::is_valid_json;

use super::{
    OpenAiChatResponse, OpenAiChoice, OpenAiMessage, OpenAiToolCall, OpenAiToolCallFunction,
};

/// Encode a canonical response into the Chat Completions wire format.
///
/// # Errors
///
/// Returns [`CanonicalError`] when the response cannot be represented.
pub fn encode_openai_chat_response(
    canonical: &CanonicalResponse,
    envelope: &RequestEnvelope,
) -> Result<OpenAiChatResponse, CanonicalError> {
    let mut text = String::new();
    let mut reasoning = String::new();
    let mut refusal: Option<String> = None;
    let mut tool_calls: Vec<OpenAiToolCall> = Vec::new();

    for part in &canonical.content {
        match part {
            CanonicalPart::Text(t) => text.push_str(t),
            CanonicalPart::Reasoning { text: r, .. } => reasoning.push_str(r),
            CanonicalPart::Refusal(r) => refusal = Some(r.clone()),
            CanonicalPart::ImageUrl { .. } => text.push_str(IMAGE_PLACEHOLDER),
            CanonicalPart::ToolCall {
                id,
                name,
                arguments,
            } => {
                let arguments = if is_valid_json(arguments.get()) {
                    arguments.get().to_string()
                } else {
                    tracing::warn!(tool = %name, "tool arguments are not valid JSON; sending {{}}");
                    "{}".to_string()
                };
                tool_calls.push(OpenAiToolCall {
                    id: id.clone(),
                    type_: "function".to_string(),
                    function: OpenAiToolCallFunction {
                        name: name.clone(),
                        arguments,
                    },
                });
            }
            CanonicalPart::ToolResult { .. } => {}
        }
    }

    let content = if text.is_empty() && !tool_calls.is_empty() {
        None
    } else {
        Some(Value::String(text))
    };

    let id = if canonical.id.starts_with("chatcmpl-") {
        canonical.id.clone()
    } else {
        envelope.chat_completion_id()
    };

    Ok(OpenAiChatResponse {
        id,
        object: "chat.completion".to_string(),
        created: Some(envelope.created_at),
        model: envelope.model.clone(),
        choices: vec![OpenAiChoice {
            index: 0,
            message: OpenAiMessage {
                role: "assistant".to_string(),
                content,
                reasoning_content: (!reasoning.is_empty()).then_some(reasoning),
                tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                refusal,
                ..OpenAiMessage::default()
            },
            finish_reason: Some(canonical_stop_to_openai(canonical.stop_reason).to_string()),
        }],
        usage: Some(canonical.usage.to_openai()),
    })
}

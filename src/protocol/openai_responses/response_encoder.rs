use crate::error::CanonicalError;
use crate::protocol::canonical::{CanonicalPart, CanonicalResponse};
use crate::protocol::envelope::RequestEnvelope;
use crate::protocol::mapping::{canonical_stop_to_responses_status, IMAGE_PLACEHOLDER};
use crate::stream::tool_args::is_valid_json;

use super::encoder::encode_tool_choice;
use super::{
    ResponsesContentPart, ResponsesIncompleteDetails, ResponsesOutput, ResponsesOutputItem,
    ResponsesReasoning, ResponsesSummaryPart, ResponsesTool,
};

/// Response object carrying the request-level fields from `envelope`, with
/// no output yet. Shared by the one-shot encoder and the stream encoder.
#[must_use]
pub fn response_shell(envelope: &RequestEnvelope, status: &str) -> ResponsesOutput {
    let tools: Vec<ResponsesTool> = envelope
        .tools
        .iter()
        .map(|t| ResponsesTool::Function {
            name: t.function.name.clone(),
            description: t.function.description.clone(),
            parameters: Some(t.function.parameters.clone()),
            strict: None,
        })
        .collect();
    let tool_choice = (!tools.is_empty()).then(|| encode_tool_choice(&envelope.tool_choice));
    ResponsesOutput {
        id: envelope.response_id.clone(),
        object: "response".to_string(),
        created_at: envelope.created_at,
        model: envelope.model.clone(),
        status: Some(status.to_string()),
        output: Vec::new(),
        usage: None,
        incomplete_details: None,
        error: None,
        instructions: envelope.instructions.clone(),
        tools,
        tool_choice,
        parallel_tool_calls: envelope.parallel_tool_calls,
        reasoning: envelope.reasoning.as_ref().map(|r| ResponsesReasoning {
            effort: r.effort_or_from_budget(),
            summary: r.summary.clone(),
        }),
        metadata: envelope.metadata.clone(),
        temperature: envelope.temperature,
        top_p: envelope.top_p,
        max_output_tokens: envelope.max_output_tokens,
        extra: serde_json::Map::new(),
    }
}

/// Encode a canonical response into a Responses API response object.
///
/// Output order is reasoning, then the assistant message, then function
/// calls, matching what the stream encoder produces.
///
/// # Errors
///
/// Returns [`CanonicalError`] when the response cannot be represented.
pub fn encode_responses_output(
    canonical: &CanonicalResponse,
    envelope: &RequestEnvelope,
) -> Result<ResponsesOutput, CanonicalError> {
    let mut reasoning_items = Vec::new();
    let mut message_parts: Vec<ResponsesContentPart> = Vec::new();
    let mut calls = Vec::new();

    for part in &canonical.content {
        match part {
            CanonicalPart::Reasoning { text, signature } => {
                reasoning_items.push(ResponsesOutputItem::Reasoning {
                    id: envelope.item_id("rs", reasoning_items.len()),
                    summary: vec![ResponsesSummaryPart::SummaryText { text: text.clone() }],
                    encrypted_content: signature.clone(),
                    status: None,
                });
            }
            CanonicalPart::Text(text) => {
                message_parts.push(ResponsesContentPart::output_text(text.clone()));
            }
            CanonicalPart::ImageUrl { .. } => {
                message_parts.push(ResponsesContentPart::output_text(
                    IMAGE_PLACEHOLDER.to_string(),
                ));
            }
            CanonicalPart::Refusal(refusal) => {
                message_parts.push(ResponsesContentPart::Refusal {
                    refusal: refusal.clone(),
                });
            }
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
                calls.push(ResponsesOutputItem::FunctionCall {
                    id: envelope.item_id("fc", calls.len()),
                    status: Some("completed".to_string()),
                    call_id: id.clone(),
                    name: name.clone(),
                    arguments,
                });
            }
            CanonicalPart::ToolResult { .. } => {}
        }
    }

    let (status, incomplete_reason) = canonical_stop_to_responses_status(canonical.stop_reason);
    let mut output = response_shell(envelope, status);
    if canonical.id.starts_with("resp_") {
        output.id.clone_from(&canonical.id);
    }
    output.output = reasoning_items;
    if !message_parts.is_empty() {
        output.output.push(ResponsesOutputItem::Message {
            id: envelope.item_id("msg", 0),
            status: Some(status.to_string()),
            role: "assistant".to_string(),
            content: message_parts,
        });
    }
    output.output.extend(calls);
    output.incomplete_details = incomplete_reason.map(|reason| ResponsesIncompleteDetails {
        reason: reason.to_string(),
    });
    output.usage = Some(canonical.usage.to_responses());
    Ok(output)
}

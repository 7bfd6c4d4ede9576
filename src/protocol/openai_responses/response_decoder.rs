use crate::error::CanonicalError;
use crate::protocol::canonical::{CanonicalPart, CanonicalResponse};
use crate::protocol::mapping::responses_status_to_canonical;
use crate::protocol::usage::UsageSnapshot;
use crate::util::raw_arguments_or_empty;

use super::{ResponsesContentPart, ResponsesOutput, ResponsesOutputItem, ResponsesSummaryPart};

/// Decode a Responses API response object into a canonical response.
///
/// # Errors
///
/// Returns [`CanonicalError`] when the response reports a failure.
pub fn decode_responses_output(
    output: &ResponsesOutput,
) -> Result<CanonicalResponse, CanonicalError> {
    if output.status.as_deref() == Some("failed") {
        let message = output
            .error
            .as_ref()
            .map_or_else(|| "response failed".to_string(), |e| e.message.clone());
        return Err(CanonicalError::Upstream {
            status: 500,
            message,
        });
    }

    let mut content = Vec::new();
    let mut has_tool_calls = false;
    for item in &output.output {
        match item {
            ResponsesOutputItem::Reasoning {
                summary,
                encrypted_content,
                ..
            } => {
                let text = summary
                    .iter()
                    .map(|ResponsesSummaryPart::SummaryText { text }| text.as_str())
                    .collect::<Vec<_>>()
                    .join("\n");
                content.push(CanonicalPart::Reasoning {
                    text,
                    signature: encrypted_content.clone().filter(|s| !s.is_empty()),
                });
            }
            ResponsesOutputItem::Message { content: parts, .. } => {
                for part in parts {
                    content.push(match part {
                        ResponsesContentPart::OutputText { text, .. } => {
                            CanonicalPart::Text(text.clone())
                        }
                        ResponsesContentPart::Refusal { refusal } => {
                            CanonicalPart::Refusal(refusal.clone())
                        }
                    });
                }
            }
            ResponsesOutputItem::FunctionCall {
                call_id,
                name,
                arguments,
                ..
            } => {
                has_tool_calls = true;
                content.push(CanonicalPart::ToolCall {
                    id: call_id.clone(),
                    name: name.clone(),
                    arguments: raw_arguments_or_empty(
                        arguments.clone(),
                        "Responses function_call output",
                    ),
                });
            }
            ResponsesOutputItem::FunctionCallOutput {
                call_id, output, ..
            } => content.push(CanonicalPart::ToolResult {
                tool_call_id: call_id.clone(),
                content: output.clone(),
            }),
        }
    }

    Ok(CanonicalResponse {
        id: output.id.clone(),
        model: output.model.clone(),
        content,
        stop_reason: responses_status_to_canonical(
            output.status.as_deref(),
            output.incomplete_details.as_ref().map(|d| d.reason.as_str()),
            has_tool_calls,
        ),
        usage: output
            .usage
            .as_ref()
            .map(UsageSnapshot::from)
            .unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::canonical::CanonicalStopReason;
    use serde_json::json;

    #[test]
    fn test_decode_reasoning_text_and_tool_call() {
        let output: ResponsesOutput = serde_json::from_value(json!({
            "id": "resp_1", "object": "response", "created_at": 1, "model": "o3",
            "status": "completed",
            "output": [
                {"type": "reasoning", "id": "rs_1", "encrypted_content": "sig",
                 "summary": [{"type": "summary_text", "text": "step"}]},
                {"type": "message", "id": "msg_1", "role": "assistant",
                 "content": [{"type": "output_text", "text": "ok", "annotations": []}]},
                {"type": "function_call", "id": "fc_1", "call_id": "call_1",
                 "name": "f", "arguments": "{\"a\":1}"}
            ],
            "usage": {"input_tokens": 9, "output_tokens": 3, "total_tokens": 12,
                "output_tokens_details": {"reasoning_tokens": 2}}
        }))
        .unwrap();
        let canonical = decode_responses_output(&output).unwrap();
        assert_eq!(canonical.stop_reason, CanonicalStopReason::ToolCalls);
        assert_eq!(canonical.content.len(), 3);
        assert!(matches!(
            &canonical.content[0],
            CanonicalPart::Reasoning { signature: Some(s), .. } if s == "sig"
        ));
        assert_eq!(canonical.usage.reasoning_tokens, 2);
    }

    #[test]
    fn test_incomplete_max_tokens() {
        let output: ResponsesOutput = serde_json::from_value(json!({
            "id": "resp_1", "object": "response", "model": "o3", "status": "incomplete",
            "incomplete_details": {"reason": "max_output_tokens"}, "output": []
        }))
        .unwrap();
        assert_eq!(
            decode_responses_output(&output).unwrap().stop_reason,
            CanonicalStopReason::MaxTokens
        );
    }
}

use super::canonical::{CanonicalRole, CanonicalStopReason};

// ---------------------------------------------------------------------------
// Role mappings
// ---------------------------------------------------------------------------

#[must_use]
pub fn canonical_role_to_openai(role: CanonicalRole) -> &'static str {
    match role {
        CanonicalRole::System => "system",
        CanonicalRole::User => "user",
        CanonicalRole::Assistant => "assistant",
        CanonicalRole::Tool => "tool",
    }
}

#[must_use]
pub fn openai_role_to_canonical(s: &str) -> CanonicalRole {
    match s {
        "system" | "developer" => CanonicalRole::System,
        "assistant" => CanonicalRole::Assistant,
        "tool" | "function" => CanonicalRole::Tool,
        _ => CanonicalRole::User,
    }
}

#[must_use]
pub fn canonical_role_to_anthropic(role: CanonicalRole) -> &'static str {
    match role {
        // system is top-level; tool results travel inside user turns
        CanonicalRole::System | CanonicalRole::User | CanonicalRole::Tool => "user",
        CanonicalRole::Assistant => "assistant",
    }
}

#[must_use]
pub fn anthropic_role_to_canonical(s: &str) -> CanonicalRole {
    match s {
        "assistant" => CanonicalRole::Assistant,
        _ => CanonicalRole::User,
    }
}

// ---------------------------------------------------------------------------
// Stop reason mappings
// ---------------------------------------------------------------------------

#[must_use]
pub fn canonical_stop_to_openai(reason: CanonicalStopReason) -> &'static str {
    match reason {
        CanonicalStopReason::EndOfTurn | CanonicalStopReason::StopSequence => "stop",
        CanonicalStopReason::ToolCalls => "tool_calls",
        CanonicalStopReason::MaxTokens => "length",
        CanonicalStopReason::ContentFilter => "content_filter",
    }
}

#[must_use]
pub fn openai_stop_to_canonical(s: &str) -> CanonicalStopReason {
    match s {
        "tool_calls" | "function_call" => CanonicalStopReason::ToolCalls,
        "length" => CanonicalStopReason::MaxTokens,
        "content_filter" => CanonicalStopReason::ContentFilter,
        _ => CanonicalStopReason::EndOfTurn,
    }
}

#[must_use]
pub fn canonical_stop_to_anthropic(reason: CanonicalStopReason) -> &'static str {
    match reason {
        CanonicalStopReason::EndOfTurn => "end_turn",
        CanonicalStopReason::ToolCalls => "tool_use",
        CanonicalStopReason::MaxTokens => "max_tokens",
        CanonicalStopReason::StopSequence => "stop_sequence",
        CanonicalStopReason::ContentFilter => "refusal",
    }
}

#[must_use]
pub fn anthropic_stop_to_canonical(s: &str) -> CanonicalStopReason {
    match s {
        "tool_use" => CanonicalStopReason::ToolCalls,
        "max_tokens" | "model_context_window_exceeded" => CanonicalStopReason::MaxTokens,
        "stop_sequence" => CanonicalStopReason::StopSequence,
        "refusal" => CanonicalStopReason::ContentFilter,
        _ => CanonicalStopReason::EndOfTurn,
    }
}

/// Responses-style terminal status plus `incomplete_details.reason`.
#[must_use]
pub fn canonical_stop_to_responses_status(
    reason: CanonicalStopReason,
) -> (&'static str, Option<&'static str>) {
    match reason {
        CanonicalStopReason::MaxTokens => ("incomplete", Some("max_output_tokens")),
        CanonicalStopReason::ContentFilter => ("incomplete", Some("content_filter")),
        CanonicalStopReason::EndOfTurn
        | CanonicalStopReason::ToolCalls
        | CanonicalStopReason::StopSequence => ("completed", None),
    }
}

/// Stop reason for a Responses-style terminal status. `has_tool_calls` turns a
/// plain completion into a tool-call stop.
#[must_use]
pub fn responses_status_to_canonical(
    status: Option<&str>,
    incomplete_reason: Option<&str>,
    has_tool_calls: bool,
) -> CanonicalStopReason {
    if status == Some("incomplete") {
        return match incomplete_reason {
            Some("content_filter") => CanonicalStopReason::ContentFilter,
            _ => CanonicalStopReason::MaxTokens,
        };
    }
    if has_tool_calls {
        CanonicalStopReason::ToolCalls
    } else {
        CanonicalStopReason::EndOfTurn
    }
}

// ---------------------------------------------------------------------------
// Image mappings
// ---------------------------------------------------------------------------

/// Split a `data:<media>;base64,<payload>` URI into `(media_type, payload)`.
#[must_use]
pub fn split_data_uri(url: &str) -> Option<(&str, &str)> {
    let rest = url.strip_prefix("data:")?;
    let (meta, payload) = rest.split_once(',')?;
    let media_type = meta.strip_suffix(";base64")?;
    if media_type.is_empty() {
        return None;
    }
    Some((media_type, payload))
}

#[must_use]
pub fn build_data_uri(media_type: &str, payload: &str) -> String {
    let mut out = String::with_capacity(media_type.len() + payload.len() + 13);
    out.push_str("data:");
    out.push_str(media_type);
    out.push_str(";base64,");
    out.push_str(payload);
    out
}

/// Text stand-in for an image in a position that cannot carry one.
pub const IMAGE_PLACEHOLDER: &str = "[image]";

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STOPS: [CanonicalStopReason; 5] = [
        CanonicalStopReason::EndOfTurn,
        CanonicalStopReason::ToolCalls,
        CanonicalStopReason::MaxTokens,
        CanonicalStopReason::StopSequence,
        CanonicalStopReason::ContentFilter,
    ];

    #[test]
    fn test_anthropic_stop_roundtrip_is_lossless() {
        for stop in ALL_STOPS {
            assert_eq!(
                anthropic_stop_to_canonical(canonical_stop_to_anthropic(stop)),
                stop
            );
        }
    }

    #[test]
    fn test_openai_stop_folds_stop_sequence_into_stop() {
        assert_eq!(
            canonical_stop_to_openai(CanonicalStopReason::StopSequence),
            "stop"
        );
        assert_eq!(
            openai_stop_to_canonical("stop"),
            CanonicalStopReason::EndOfTurn
        );
        assert_eq!(
            openai_stop_to_canonical("length"),
            CanonicalStopReason::MaxTokens
        );
    }

    #[test]
    fn test_responses_status_for_length_limit_is_incomplete() {
        assert_eq!(
            canonical_stop_to_responses_status(CanonicalStopReason::MaxTokens),
            ("incomplete", Some("max_output_tokens"))
        );
        assert_eq!(
            canonical_stop_to_responses_status(CanonicalStopReason::ToolCalls),
            ("completed", None)
        );
        assert_eq!(
            responses_status_to_canonical(Some("completed"), None, true),
            CanonicalStopReason::ToolCalls
        );
        assert_eq!(
            responses_status_to_canonical(Some("incomplete"), Some("max_output_tokens"), false),
            CanonicalStopReason::MaxTokens
        );
    }

    #[test]
    fn test_role_mappings() {
        assert_eq!(openai_role_to_canonical("developer"), CanonicalRole::System);
        assert_eq!(canonical_role_to_anthropic(CanonicalRole::Tool), "user");
        assert_eq!(
            anthropic_role_to_canonical("assistant"),
            CanonicalRole::Assistant
        );
    }

    #[test]
    fn test_data_uri_split_and_build() {
        let uri = build_data_uri("image/png", "iVBORw0KGgo=");
        assert_eq!(uri, "data:image/png;base64,iVBORw0KGgo=");
        assert_eq!(split_data_uri(&uri), Some(("image/png", "iVBORw0KGgo=")));
        assert_eq!(split_data_uri("https://example.com/cat.png"), None);
        assert_eq!(split_data_uri("data:;base64,AAAA"), None);
    }
}

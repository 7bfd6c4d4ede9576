//! Final-argument reconstruction for streamed tool calls.

use serde_json::Value;

const EMPTY_OBJECT: &str = "{}";

/// Build the final arguments string for a streamed tool call.
///
/// `fragments` is the concatenation of every argument delta seen for the call.
/// When it is empty, a structured input captured from the block start is
/// re-serialized instead. The result always parses as JSON; anything else
/// collapses to `{}`.
#[must_use]
pub fn finalize_tool_arguments(fragments: &str, captured_input: Option<&Value>) -> String {
    let trimmed = fragments.trim();
    if !trimmed.is_empty() {
        if is_valid_json(trimmed) {
            return trimmed.to_string();
        }
        tracing::warn!(
            len = trimmed.len(),
            "streamed tool arguments are not valid JSON; substituting fallback"
        );
    }

    match captured_input {
        Some(input @ Value::Object(map)) if !map.is_empty() => {
            serde_json::to_string(input).unwrap_or_else(|_| EMPTY_OBJECT.to_string())
        }
        _ => EMPTY_OBJECT.to_string(),
    }
}

/// True when `text` is one complete JSON value.
#[inline]
#[must_use]
pub fn is_valid_json(text: &str) -> bool {
    serde_json::from_str::<serde::de::IgnoredAny>(text).is_ok()
}

use crate::error::ErrorCategory;

fn openai_error_type(cat: ErrorCategory) -> &'static str {
    match cat {
        ErrorCategory::InvalidRequest | ErrorCategory::NotFound => "invalid_request_error",
        ErrorCategory::Authentication => "authentication_error",
        ErrorCategory::Permission => "permission_error",
        ErrorCategory::RateLimit => "rate_limit_error",
        ErrorCategory::ServerError | ErrorCategory::Unknown => "server_error",
    }
}

fn openai_error_code(cat: ErrorCategory) -> &'static str {
    match cat {
        ErrorCategory::InvalidRequest => "invalid_request",
        ErrorCategory::NotFound => "model_not_found",
        ErrorCategory::Authentication => "invalid_api_key",
        ErrorCategory::Permission => "permission_denied",
        ErrorCategory::RateLimit => "rate_limit_exceeded",
        ErrorCategory::ServerError | ErrorCategory::Unknown => "server_error",
    }
}

pub(crate) fn anthropic_error_type(cat: ErrorCategory) -> &'static str {
    match cat {
        ErrorCategory::InvalidRequest => "invalid_request_error",
        ErrorCategory::NotFound => "not_found_error",
        ErrorCategory::Authentication => "authentication_error",
        ErrorCategory::Permission => "permission_error",
        ErrorCategory::RateLimit => "rate_limit_error",
        ErrorCategory::ServerError | ErrorCategory::Unknown => "api_error",
    }
}

#[must_use]
pub(crate) fn openai_error_payload(
    cat: ErrorCategory,
    message: &str,
    param: Option<&str>,
) -> serde_json::Value {
    serde_json::json!({
        "error": {
            "message": message,
            "type": openai_error_type(cat),
            "code": openai_error_code(cat),
            "param": param,
        }
    })
}

#[must_use]
pub(crate) fn anthropic_error_payload(cat: ErrorCategory, message: &str) -> serde_json::Value {
    serde_json::json!({
        "type": "error",
        "error": {
            "type": anthropic_error_type(cat),
            "message": message,
        }
    })
}

/// HTTP status implied by a Messages-style error `type`.
#[must_use]
pub(crate) fn status_for_anthropic_error_type(error_type: &str) -> u16 {
    match error_type {
        "invalid_request_error" => 400,
        "authentication_error" => 401,
        "permission_error" => 403,
        "not_found_error" => 404,
        "rate_limit_error" => 429,
        "overloaded_error" => 529,
        _ => 500,
    }
}

/// HTTP status implied by an OpenAI-style error `type` or `code`.
#[must_use]
pub(crate) fn status_for_openai_error(error_type: Option<&str>, code: Option<&str>) -> u16 {
    match (error_type, code) {
        (Some("invalid_request_error"), _) | (_, Some("invalid_request")) => 400,
        (Some("authentication_error"), _) | (_, Some("invalid_api_key")) => 401,
        (Some("permission_error"), _) | (_, Some("permission_denied")) => 403,
        (_, Some("model_not_found")) => 404,
        (Some("rate_limit_error"), _) | (_, Some("rate_limit_exceeded")) => 429,
        _ => 500,
    }
}

/// Messages-style error `type` for an upstream HTTP status.
#[must_use]
pub(crate) fn anthropic_error_type_for_status(status: u16) -> &'static str {
    anthropic_error_type(crate::error::category_from_upstream_status(status))
}

/// OpenAI-style error `type` for an upstream HTTP status.
#[must_use]
pub(crate) fn openai_error_type_for_status(status: u16) -> &'static str {
    openai_error_type(crate::error::category_from_upstream_status(status))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openai_payload_code_maps_back_to_status() {
        for (cat, status) in [
            (ErrorCategory::InvalidRequest, 400),
            (ErrorCategory::Authentication, 401),
            (ErrorCategory::Permission, 403),
            (ErrorCategory::NotFound, 404),
            (ErrorCategory::RateLimit, 429),
            (ErrorCategory::ServerError, 500),
        ] {
            let payload = openai_error_payload(cat, "boom", None);
            let code = payload["error"]["code"].as_str();
            assert_eq!(status_for_openai_error(None, code), status, "{cat:?}");
        }
    }

    #[test]
    fn test_anthropic_payload_type_maps_back_to_status() {
        let payload = anthropic_error_payload(ErrorCategory::RateLimit, "slow down");
        let error_type = payload["error"]["type"].as_str().unwrap_or_default();
        assert_eq!(status_for_anthropic_error_type(error_type), 429);
        assert_eq!(anthropic_error_type_for_status(404), "not_found_error");
    }
}

use std::fmt;

use crate::protocol::canonical::WireApi;
use crate::protocol::error_shapes::{anthropic_error_payload, openai_error_payload};

/// One request parameter the target protocol cannot honour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsupportedParameter {
    pub name: String,
    pub reason: String,
}

impl fmt::Display for UnsupportedParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "`{}` ({})", self.name, self.reason)
    }
}

fn join_unsupported(params: &[UnsupportedParameter]) -> String {
    params
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Canonical error type used across all modules.
#[derive(Debug, thiserror::Error)]
pub enum CanonicalError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Model `{requested}` is not supported; available models: [{}]", .available.join(", "))]
    UnsupportedModel {
        requested: String,
        available: Vec<String>,
    },
    #[error("Unsupported parameters for {target}: {}", join_unsupported(.params))]
    UnsupportedParameters {
        target: WireApi,
        params: Vec<UnsupportedParameter>,
    },
    #[error("Upstream error: status={status}, message={message}")]
    Upstream { status: u16, message: String },
    #[error("Protocol translation error: {0}")]
    Translation(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Broad error category for status code selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    InvalidRequest,
    NotFound,
    Authentication,
    Permission,
    RateLimit,
    ServerError,
    Unknown,
}

/// Map an upstream HTTP status code to an error category.
#[must_use]
pub fn category_from_upstream_status(status: u16) -> ErrorCategory {
    match status {
        400 | 422 => ErrorCategory::InvalidRequest,
        401 => ErrorCategory::Authentication,
        403 => ErrorCategory::Permission,
        404 => ErrorCategory::NotFound,
        429 => ErrorCategory::RateLimit,
        500..=599 => ErrorCategory::ServerError,
        _ => ErrorCategory::Unknown,
    }
}

impl CanonicalError {
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            CanonicalError::InvalidRequest(_)
            | CanonicalError::UnsupportedModel { .. }
            | CanonicalError::UnsupportedParameters { .. } => ErrorCategory::InvalidRequest,
            CanonicalError::Translation(_) | CanonicalError::Internal(_) => {
                ErrorCategory::ServerError
            }
            CanonicalError::Upstream { status, .. } => category_from_upstream_status(*status),
        }
    }

    /// True for errors caused by the client's request rather than the engine.
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::InvalidRequest | ErrorCategory::NotFound
        )
    }
}

// ---------------------------------------------------------------------------
// Category -> HTTP status code
// ---------------------------------------------------------------------------

#[must_use]
pub fn http_status_for_category(cat: ErrorCategory) -> http::StatusCode {
    match cat {
        ErrorCategory::InvalidRequest => http::StatusCode::BAD_REQUEST,
        ErrorCategory::NotFound => http::StatusCode::NOT_FOUND,
        ErrorCategory::Authentication => http::StatusCode::UNAUTHORIZED,
        ErrorCategory::Permission => http::StatusCode::FORBIDDEN,
        ErrorCategory::RateLimit => http::StatusCode::TOO_MANY_REQUESTS,
        ErrorCategory::ServerError | ErrorCategory::Unknown => {
            http::StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

// ---------------------------------------------------------------------------
// Format an error for a given client protocol
// ---------------------------------------------------------------------------

/// Format an error for the client's protocol, returning (`status_code`, JSON body).
#[must_use]
pub fn format_error(err: &CanonicalError, client: WireApi) -> (http::StatusCode, serde_json::Value) {
    let cat = err.category();
    let status = http_status_for_category(cat);
    let message = err.to_string();
    let param = match err {
        CanonicalError::UnsupportedModel { .. } => Some("model".to_string()),
        CanonicalError::UnsupportedParameters { params, .. } => params
            .first()
            .filter(|_| params.len() == 1)
            .map(|p| p.name.clone()),
        _ => None,
    };

    let body = match client {
        WireApi::OpenAiChat | WireApi::OpenAiResponses => {
            openai_error_payload(cat, &message, param.as_deref())
        }
        WireApi::Anthropic => anthropic_error_payload(cat, &message),
    };

    (status, body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_model_lists_allowlist() {
        let err = CanonicalError::UnsupportedModel {
            requested: "gpt-9".into(),
            available: vec!["gpt-4o".into(), "gpt-4.1".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("gpt-9"));
        assert!(msg.contains("gpt-4o, gpt-4.1"));
        assert!(err.is_client_error());
    }

    #[test]
    fn test_unsupported_parameters_names_every_parameter() {
        let err = CanonicalError::UnsupportedParameters {
            target: WireApi::Anthropic,
            params: vec![
                UnsupportedParameter {
                    name: "n".into(),
                    reason: "single candidate only".into(),
                },
                UnsupportedParameter {
                    name: "logit_bias".into(),
                    reason: "no token biasing".into(),
                },
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("`n`"));
        assert!(msg.contains("`logit_bias`"));
        let (status, body) = format_error(&err, WireApi::OpenAiChat);
        assert_eq!(status, http::StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["type"], "invalid_request_error");
    }

    #[test]
    fn test_anthropic_error_shape() {
        let err = CanonicalError::Upstream {
            status: 429,
            message: "slow down".into(),
        };
        let (status, body) = format_error(&err, WireApi::Anthropic);
        assert_eq!(status, http::StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["type"], "error");
        assert_eq!(body["error"]["type"], "rate_limit_error");
    }
}

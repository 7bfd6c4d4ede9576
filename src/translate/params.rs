//! Which request parameters each target protocol can honour.

use serde_json::Value;

use crate::error::{CanonicalError, UnsupportedParameter};
use crate::protocol::canonical::{CanonicalRequest, WireApi};

/// Every parameter the mapper knows about, in reporting order.
pub const RECOGNIZED_PARAMETERS: [&str; 17] = [
    "temperature",
    "top_p",
    "max_tokens",
    "stop",
    "n",
    "top_k",
    "frequency_penalty",
    "presence_penalty",
    "seed",
    "logprobs",
    "top_logprobs",
    "logit_bias",
    "response_format",
    "user",
    "metadata",
    "parallel_tool_calls",
    "reasoning",
];

/// Recognized parameters that travel in provider extensions rather than in
/// typed canonical fields.
const EXTENSION_PARAMETERS: [&str; 4] = ["logprobs", "top_logprobs", "logit_bias", "response_format"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamSupport {
    Supported,
    Unsupported(&'static str),
}

const MESSAGES_UNSUPPORTED: &[(&str, &str)] = &[
    ("n", "Messages returns a single candidate"),
    ("frequency_penalty", "Messages has no frequency penalty"),
    ("presence_penalty", "Messages has no presence penalty"),
    ("seed", "Messages has no sampling seed"),
    ("logprobs", "Messages does not return log probabilities"),
    ("top_logprobs", "Messages does not return log probabilities"),
    ("logit_bias", "Messages has no token biasing"),
    ("response_format", "Messages has no structured output mode"),
];

const CHAT_UNSUPPORTED: &[(&str, &str)] = &[("top_k", "Chat Completions has no top-k sampling")];

const RESPONSES_UNSUPPORTED: &[(&str, &str)] = &[
    ("n", "Responses returns a single candidate"),
    ("stop", "Responses has no stop sequences"),
    ("frequency_penalty", "Responses has no frequency penalty"),
    ("presence_penalty", "Responses has no presence penalty"),
    ("seed", "Responses has no sampling seed"),
    ("logit_bias", "Responses has no token biasing"),
    ("top_k", "Responses has no top-k sampling"),
    ("logprobs", "Responses does not return log probabilities"),
];

/// Parameter table for one target protocol.
#[derive(Debug, Clone, Copy)]
pub struct ParameterMapper {
    target: WireApi,
}

impl ParameterMapper {
    #[must_use]
    pub fn new(target: WireApi) -> Self {
        Self { target }
    }

    #[must_use]
    pub fn target(&self) -> WireApi {
        self.target
    }

    /// Support status of `name` on the target. Unknown names are reported
    /// as supported; they are not this table's concern.
    #[must_use]
    pub fn support(&self, name: &str) -> ParamSupport {
        let table = match self.target {
            WireApi::Anthropic => MESSAGES_UNSUPPORTED,
            WireApi::OpenAiChat => CHAT_UNSUPPORTED,
            WireApi::OpenAiResponses => RESPONSES_UNSUPPORTED,
        };
        table
            .iter()
            .find(|(param, _)| *param == name)
            .map_or(ParamSupport::Supported, |(_, reason)| {
                ParamSupport::Unsupported(reason)
            })
    }

    /// Unsupported parameters present in `request`, in table order.
    #[must_use]
    pub fn unsupported_in(&self, request: &CanonicalRequest) -> Vec<UnsupportedParameter> {
        RECOGNIZED_PARAMETERS
            .iter()
            .filter(|name| is_present(request, name))
            .filter_map(|name| match self.support(name) {
                ParamSupport::Unsupported(reason) => Some(UnsupportedParameter {
                    name: (*name).to_string(),
                    reason: reason.to_string(),
                }),
                ParamSupport::Supported => None,
            })
            .collect()
    }

    /// Check `request` against the target.
    ///
    /// With `propagate_unsupported` every unsupported parameter is logged and
    /// stripped and the stripped list is returned. Without it, nothing is
    /// modified and all of them are reported in one error.
    ///
    /// Extension-borne parameters are also reshaped for the target where the
    /// wire name differs (`response_format` becomes Responses `text.format`).
    ///
    /// # Errors
    ///
    /// [`CanonicalError::UnsupportedParameters`] in strict mode when any
    /// unsupported parameter is present.
    pub fn apply(
        &self,
        request: &mut CanonicalRequest,
        propagate_unsupported: bool,
    ) -> Result<Vec<UnsupportedParameter>, CanonicalError> {
        normalize_single_candidate(request);
        let unsupported = self.unsupported_in(request);
        if !unsupported.is_empty() && !propagate_unsupported {
            return Err(CanonicalError::UnsupportedParameters {
                target: self.target,
                params: unsupported,
            });
        }
        for param in &unsupported {
            tracing::warn!(
                target_api = %self.target,
                parameter = %param.name,
                reason = %param.reason,
                "unsupported parameter dropped"
            );
            strip(request, &param.name);
        }
        if self.target == WireApi::OpenAiResponses {
            reshape_response_format(request);
        }
        Ok(unsupported)
    }

    /// True when `key`, found in provider extensions, is a recognized
    /// parameter the target accepts.
    #[must_use]
    pub fn keeps_extension(&self, key: &str) -> bool {
        match self.target {
            WireApi::OpenAiResponses if key == "text" => true,
            _ => {
                EXTENSION_PARAMETERS.contains(&key)
                    && self.support(key) == ParamSupport::Supported
            }
        }
    }
}

/// `n: 1` asks for what every target does anyway.
fn normalize_single_candidate(request: &mut CanonicalRequest) {
    if request.generation.n == Some(1) {
        request.generation.n = None;
    }
}

fn is_present(request: &CanonicalRequest, name: &str) -> bool {
    let g = &request.generation;
    match name {
        "temperature" => g.temperature.is_some(),
        "top_p" => g.top_p.is_some(),
        "max_tokens" => g.max_tokens.is_some(),
        "stop" => g.stop.as_ref().is_some_and(|s| !s.is_empty()),
        "n" => g.n.is_some_and(|n| n > 1),
        "top_k" => g.top_k.is_some(),
        "frequency_penalty" => g.frequency_penalty.is_some(),
        "presence_penalty" => g.presence_penalty.is_some(),
        "seed" => g.seed.is_some(),
        "user" => request.user.is_some(),
        "metadata" => request.metadata.is_some(),
        "parallel_tool_calls" => request.parallel_tool_calls.is_some(),
        "reasoning" => request.reasoning.is_some(),
        other => request
            .provider_extensions_ref()
            .get(other)
            .is_some_and(|v| !v.is_null() && *v != Value::Bool(false)),
    }
}

fn strip(request: &mut CanonicalRequest, name: &str) {
    let g = &mut request.generation;
    match name {
        "temperature" => g.temperature = None,
        "top_p" => g.top_p = None,
        "max_tokens" => g.max_tokens = None,
        "stop" => g.stop = None,
        "n" => g.n = None,
        "top_k" => g.top_k = None,
        "frequency_penalty" => g.frequency_penalty = None,
        "presence_penalty" => g.presence_penalty = None,
        "seed" => g.seed = None,
        _ => strip_request_field(request, name),
    }
}

fn strip_request_field(request: &mut CanonicalRequest, name: &str) {
    match name {
        "user" => request.user = None,
        "metadata" => request.metadata = None,
        "parallel_tool_calls" => request.parallel_tool_calls = None,
        "reasoning" => request.reasoning = None,
        other => {
            if let Some(ext) = request.provider_extensions.as_deref_mut() {
                ext.remove(other);
            }
        }
    }
}

/// Chat `response_format` → Responses `text.format`; the `json_schema`
/// wrapper object is flattened into the format itself.
fn reshape_response_format(request: &mut CanonicalRequest) {
    let Some(ext) = request.provider_extensions.as_deref_mut() else {
        return;
    };
    let Some(Value::Object(mut format)) = ext.remove("response_format") else {
        return;
    };
    if let Some(Value::Object(schema)) = format.remove("json_schema") {
        for (key, value) in schema {
            format.entry(key).or_insert(value);
        }
    }
    let mut text = serde_json::Map::new();
    text.insert("format".to_string(), Value::Object(format));
    ext.entry("text".to_string()).or_insert(Value::Object(text));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request() -> CanonicalRequest {
        CanonicalRequest::empty(uuid::Uuid::nil(), WireApi::OpenAiChat, "m".into())
    }

    #[test]
    fn strict_mode_reports_every_parameter() {
        let mut req = request();
        req.generation.n = Some(3);
        req.generation.seed = Some(7);
        req.provider_extensions_mut().insert("logit_bias".into(), json!({"50256": -100}));
        let err = ParameterMapper::new(WireApi::Anthropic)
            .apply(&mut req, false)
            .unwrap_err();
        let CanonicalError::UnsupportedParameters { target, params } = err else {
            panic!("expected UnsupportedParameters");
        };
        assert_eq!(target, WireApi::Anthropic);
        let names: Vec<&str> = params.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["n", "seed", "logit_bias"]);
        // strict mode leaves the request untouched
        assert_eq!(req.generation.n, Some(3));
    }

    #[test]
    fn permissive_mode_strips_and_resets_candidates() {
        let mut req = request();
        req.generation.n = Some(2);
        req.generation.temperature = Some(0.2);
        let dropped = ParameterMapper::new(WireApi::OpenAiResponses)
            .apply(&mut req, true)
            .unwrap();
        assert_eq!(dropped.len(), 1);
        assert_eq!(req.generation.n, None);
        assert_eq!(req.generation.temperature, Some(0.2));
    }

    #[test]
    fn single_candidate_is_not_a_violation() {
        let mut req = request();
        req.generation.n = Some(1);
        assert!(ParameterMapper::new(WireApi::Anthropic).apply(&mut req, false).is_ok());
    }

    #[test]
    fn top_k_only_rejected_by_chat() {
        let mut req = request();
        req.generation.top_k = Some(40);
        assert!(ParameterMapper::new(WireApi::Anthropic).unsupported_in(&req).is_empty());
        assert_eq!(
            ParameterMapper::new(WireApi::OpenAiChat).unsupported_in(&req)[0].name,
            "top_k"
        );
    }

    #[test]
    fn response_format_becomes_text_format_for_responses() {
        let mut req = request();
        req.provider_extensions_mut().insert(
            "response_format".into(),
            json!({"type": "json_schema", "json_schema": {"name": "r", "schema": {"type": "object"}}}),
        );
        ParameterMapper::new(WireApi::OpenAiResponses)
            .apply(&mut req, false)
            .unwrap();
        let ext = req.provider_extensions_ref();
        assert!(!ext.contains_key("response_format"));
        assert_eq!(
            ext["text"],
            json!({"format": {"type": "json_schema", "name": "r", "schema": {"type": "object"}}})
        );
    }
}

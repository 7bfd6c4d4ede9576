use std::sync::Arc;

use super::canonical::{
    CanonicalRequest, CanonicalToolChoice, CanonicalToolSpec, ProviderExtensions,
    ReasoningConfig,
};

/// Request-level fields that backend events do not repeat.
///
/// Captured once when a call starts and handed to the transcoder and to the
/// one-shot response encoders, which re-attach them wherever the client
/// protocol expects them (e.g. the response object inside Responses
/// lifecycle events).
#[derive(Debug, Clone)]
pub struct RequestEnvelope {
    pub request_id: uuid::Uuid,
    pub response_id: String,
    pub created_at: u64,
    /// Model name as the client requested it.
    pub model: String,
    pub instructions: Option<String>,
    pub tools: Arc<[CanonicalToolSpec]>,
    pub tool_choice: CanonicalToolChoice,
    pub reasoning: Option<ReasoningConfig>,
    pub metadata: Option<ProviderExtensions>,
    pub parallel_tool_calls: Option<bool>,
    pub include_usage: bool,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub max_output_tokens: Option<u64>,
}

impl RequestEnvelope {
    #[must_use]
    pub fn from_request(request: &CanonicalRequest, created_at: u64) -> Self {
        Self {
            request_id: request.request_id,
            response_id: format!("resp_{}", request.request_id.simple()),
            created_at,
            model: request.model.clone(),
            instructions: request.system_prompt.clone(),
            tools: Arc::clone(&request.tools),
            tool_choice: request.tool_choice.clone(),
            reasoning: request.reasoning.clone(),
            metadata: request.metadata.clone(),
            parallel_tool_calls: request.parallel_tool_calls,
            include_usage: request.include_usage,
            temperature: request.generation.temperature,
            top_p: request.generation.top_p,
            max_output_tokens: request.generation.max_tokens,
        }
    }

    /// Minimal envelope when only a model name is known (replay, tests).
    #[must_use]
    pub fn for_model(request_id: uuid::Uuid, model: impl Into<String>, created_at: u64) -> Self {
        Self {
            request_id,
            response_id: format!("resp_{}", request_id.simple()),
            created_at,
            model: model.into(),
            instructions: None,
            tools: Arc::from(Vec::new()),
            tool_choice: CanonicalToolChoice::Auto,
            reasoning: None,
            metadata: None,
            parallel_tool_calls: None,
            include_usage: true,
            temperature: None,
            top_p: None,
            max_output_tokens: None,
        }
    }

    /// Stable per-stream id for a generated item: `<prefix>_<suffix>_<n>`.
    #[must_use]
    pub fn item_id(&self, prefix: &str, ordinal: usize) -> String {
        let suffix = self
            .response_id
            .strip_prefix("resp_")
            .unwrap_or(&self.response_id);
        format!("{prefix}_{suffix}_{ordinal}")
    }

    /// Response id in the shape the client protocol uses.
    #[must_use]
    pub fn chat_completion_id(&self) -> String {
        format!("chatcmpl-{}", self.request_id.simple())
    }

    #[must_use]
    pub fn anthropic_message_id(&self) -> String {
        format!("msg_{}", self.request_id.simple())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_ids_are_deterministic() {
        let envelope = RequestEnvelope::for_model(uuid::Uuid::from_u128(7), "m", 0);
        assert_eq!(envelope.item_id("fc", 2), envelope.item_id("fc", 2));
        assert!(envelope.item_id("msg", 0).starts_with("msg_"));
        assert!(envelope.response_id.starts_with("resp_"));
        assert_ne!(envelope.item_id("fc", 0), envelope.item_id("fc", 1));
    }
}

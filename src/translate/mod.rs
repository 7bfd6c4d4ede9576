//! One-shot translation facade: client request → backend request, backend
//! response → client response, and transcoders for streaming calls.

pub mod params;

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::config::{AppConfig, TranslationConfig};
use crate::error::{CanonicalError, UnsupportedParameter};
use crate::protocol::anthropic::decoder::decode_anthropic_request;
use crate::protocol::anthropic::encoder::encode_anthropic_request;
use crate::protocol::anthropic::response_decoder::decode_anthropic_response;
use crate::protocol::anthropic::response_encoder::encode_anthropic_response;
use crate::protocol::anthropic::{AnthropicRequest, AnthropicResponse};
use crate::protocol::canonical::{
    CanonicalRequest, CanonicalResponse, CanonicalRole, WireApi,
};
use crate::protocol::envelope::RequestEnvelope;
use crate::protocol::openai_chat::decoder::decode_openai_chat_request;
use crate::protocol::openai_chat::encoder::encode_openai_chat_request;
use crate::protocol::openai_chat::response_decoder::decode_openai_chat_response;
use crate::protocol::openai_chat::response_encoder::encode_openai_chat_response;
use crate::protocol::openai_chat::{OpenAiChatRequest, OpenAiChatResponse};
use crate::protocol::openai_responses::decoder::decode_responses_request;
use crate::protocol::openai_responses::encoder::encode_responses_request;
use crate::protocol::openai_responses::response_decoder::decode_responses_output;
use crate::protocol::openai_responses::response_encoder::encode_responses_output;
use crate::protocol::openai_responses::{ResponsesOutput, ResponsesRequest};
use crate::state::{
    ModelInfoSource, ModelResolver, RequestIdGenerator, StreamEntry, StreamLease, StreamRegistry,
};
use crate::stream::StreamTranscoder;
use crate::util::unix_now_secs;

use self::params::ParameterMapper;

/// A request in one protocol's wire shape.
#[derive(Debug, Clone)]
pub enum WireRequest {
    Anthropic(AnthropicRequest),
    OpenAiChat(OpenAiChatRequest),
    Responses(ResponsesRequest),
}

/// A non-streaming response in one protocol's wire shape.
#[derive(Debug, Clone, PartialEq)]
pub enum WireResponse {
    Anthropic(AnthropicResponse),
    OpenAiChat(OpenAiChatResponse),
    Responses(ResponsesOutput),
}

fn from_json<T: serde::de::DeserializeOwned>(api: WireApi, body: Value) -> Result<T, CanonicalError> {
    serde_json::from_value(body)
        .map_err(|e| CanonicalError::InvalidRequest(format!("malformed {api} body: {e}")))
}

fn to_json<T: Serialize>(value: &T) -> Result<Value, CanonicalError> {
    serde_json::to_value(value)
        .map_err(|e| CanonicalError::Internal(format!("failed to serialize body: {e}")))
}

impl WireRequest {
    /// Parse a JSON request body of the given protocol.
    ///
    /// # Errors
    ///
    /// [`CanonicalError::InvalidRequest`] when the body does not match the
    /// protocol's request schema.
    pub fn from_json(api: WireApi, body: Value) -> Result<Self, CanonicalError> {
        Ok(match api {
            WireApi::Anthropic => WireRequest::Anthropic(from_json(api, body)?),
            WireApi::OpenAiChat => WireRequest::OpenAiChat(from_json(api, body)?),
            WireApi::OpenAiResponses => WireRequest::Responses(from_json(api, body)?),
        })
    }

    /// # Errors
    ///
    /// [`CanonicalError::Internal`] if serialization fails.
    pub fn to_json(&self) -> Result<Value, CanonicalError> {
        match self {
            WireRequest::Anthropic(r) => to_json(r),
            WireRequest::OpenAiChat(r) => to_json(r),
            WireRequest::Responses(r) => to_json(r),
        }
    }

    #[must_use]
    pub fn api(&self) -> WireApi {
        match self {
            WireRequest::Anthropic(_) => WireApi::Anthropic,
            WireRequest::OpenAiChat(_) => WireApi::OpenAiChat,
            WireRequest::Responses(_) => WireApi::OpenAiResponses,
        }
    }
}

impl WireResponse {
    /// Parse a JSON response body of the given protocol.
    ///
    /// # Errors
    ///
    /// [`CanonicalError::InvalidRequest`] when the body does not match the
    /// protocol's response schema.
    pub fn from_json(api: WireApi, body: Value) -> Result<Self, CanonicalError> {
        Ok(match api {
            WireApi::Anthropic => WireResponse::Anthropic(from_json(api, body)?),
            WireApi::OpenAiChat => WireResponse::OpenAiChat(from_json(api, body)?),
            WireApi::OpenAiResponses => WireResponse::Responses(from_json(api, body)?),
        })
    }

    /// # Errors
    ///
    /// [`CanonicalError::Internal`] if serialization fails.
    pub fn to_json(&self) -> Result<Value, CanonicalError> {
        match self {
            WireResponse::Anthropic(r) => to_json(r),
            WireResponse::OpenAiChat(r) => to_json(r),
            WireResponse::Responses(r) => to_json(r),
        }
    }

    #[must_use]
    pub fn api(&self) -> WireApi {
        match self {
            WireResponse::Anthropic(_) => WireApi::Anthropic,
            WireResponse::OpenAiChat(_) => WireApi::OpenAiChat,
            WireResponse::Responses(_) => WireApi::OpenAiResponses,
        }
    }
}

/// Decode any wire request into the canonical form.
///
/// # Errors
///
/// Propagates the protocol decoder's error.
pub fn decode_request(
    request: &WireRequest,
    request_id: uuid::Uuid,
) -> Result<CanonicalRequest, CanonicalError> {
    match request {
        WireRequest::Anthropic(r) => decode_anthropic_request(r, request_id),
        WireRequest::OpenAiChat(r) => decode_openai_chat_request(r, request_id),
        WireRequest::Responses(r) => decode_responses_request(r, request_id),
    }
}

/// Encode a canonical request for `target`.
///
/// # Errors
///
/// Propagates the protocol encoder's error.
pub fn encode_request(
    canonical: &CanonicalRequest,
    target: WireApi,
) -> Result<WireRequest, CanonicalError> {
    Ok(match target {
        WireApi::Anthropic => WireRequest::Anthropic(encode_anthropic_request(canonical)?),
        WireApi::OpenAiChat => WireRequest::OpenAiChat(encode_openai_chat_request(canonical)?),
        WireApi::OpenAiResponses => WireRequest::Responses(encode_responses_request(canonical)?),
    })
}

/// Decode any backend response into the canonical form.
///
/// # Errors
///
/// Propagates the protocol decoder's error.
pub fn decode_response(response: &WireResponse) -> Result<CanonicalResponse, CanonicalError> {
    match response {
        WireResponse::Anthropic(r) => decode_anthropic_response(r),
        WireResponse::OpenAiChat(r) => decode_openai_chat_response(r),
        WireResponse::Responses(r) => decode_responses_output(r),
    }
}

/// Encode a canonical response for the `client` protocol.
///
/// # Errors
///
/// Propagates the protocol encoder's error.
pub fn encode_response(
    canonical: &CanonicalResponse,
    envelope: &RequestEnvelope,
    client: WireApi,
) -> Result<WireResponse, CanonicalError> {
    Ok(match client {
        WireApi::Anthropic => WireResponse::Anthropic(encode_anthropic_response(canonical, envelope)?),
        WireApi::OpenAiChat => {
            WireResponse::OpenAiChat(encode_openai_chat_response(canonical, envelope)?)
        }
        WireApi::OpenAiResponses => {
            WireResponse::Responses(encode_responses_output(canonical, envelope)?)
        }
    })
}

/// Result of translating a client request.
#[derive(Debug, Clone)]
pub struct TranslatedRequest {
    /// Request to send to the backend.
    pub request: WireRequest,
    /// Context for encoding the backend's answer for the client.
    pub envelope: Arc<RequestEnvelope>,
    /// Parameters stripped under the permissive policy.
    pub dropped_params: Vec<UnsupportedParameter>,
}

struct Resolvers {
    anthropic: ModelResolver,
    openai_chat: ModelResolver,
    openai_responses: ModelResolver,
}

impl Resolvers {
    fn get(&self, api: WireApi) -> &ModelResolver {
        match api {
            WireApi::Anthropic => &self.anthropic,
            WireApi::OpenAiChat => &self.openai_chat,
            WireApi::OpenAiResponses => &self.openai_responses,
        }
    }
}

/// Request/response translation with model resolution and parameter policy.
pub struct Translator {
    config: TranslationConfig,
    resolvers: Resolvers,
    model_info: Option<Arc<dyn ModelInfoSource>>,
    ids: RequestIdGenerator,
    streams: StreamRegistry,
}

impl Translator {
    #[must_use]
    pub fn new(config: &AppConfig, model_info: Option<Arc<dyn ModelInfoSource>>) -> Self {
        let build = |api: WireApi| {
            let resolver = ModelResolver::new(
                config.models.allowlist(api).to_vec(),
                &config.models.aliases,
            );
            match (&model_info, config.models.enable_dynamic_model_info) {
                (Some(source), true) => resolver
                    .with_dynamic_source(Arc::clone(source), config.models.model_refresh_ttl_secs),
                _ => resolver,
            }
        };
        Self {
            config: config.translation.clone(),
            resolvers: Resolvers {
                anthropic: build(WireApi::Anthropic),
                openai_chat: build(WireApi::OpenAiChat),
                openai_responses: build(WireApi::OpenAiResponses),
            },
            model_info,
            ids: RequestIdGenerator::new(),
            streams: StreamRegistry::new(),
        }
    }

    /// Live streams started through [`Translator::begin_stream`].
    #[must_use]
    pub fn streams(&self) -> &StreamRegistry {
        &self.streams
    }

    #[must_use]
    pub fn resolver(&self, target: WireApi) -> &ModelResolver {
        self.resolvers.get(target)
    }

    /// Translate a client request for a `target` backend under a fresh
    /// request id.
    ///
    /// # Errors
    ///
    /// See [`Translator::translate_request_with_id`].
    pub fn translate_request(
        &self,
        request: &WireRequest,
        target: WireApi,
    ) -> Result<TranslatedRequest, CanonicalError> {
        self.translate_request_with_id(request, target, self.ids.next_id())
    }

    /// Translate a client request for a `target` backend.
    ///
    /// # Errors
    ///
    /// - [`CanonicalError::InvalidRequest`] for malformed client requests
    /// - [`CanonicalError::UnsupportedModel`] when the model is not allowlisted
    /// - [`CanonicalError::UnsupportedParameters`] under the strict policy
    pub fn translate_request_with_id(
        &self,
        request: &WireRequest,
        target: WireApi,
        request_id: uuid::Uuid,
    ) -> Result<TranslatedRequest, CanonicalError> {
        let mut canonical = decode_request(request, request_id)?;
        let client_model = canonical.model.clone();
        canonical.model = self.resolvers.get(target).resolve(&client_model)?;

        let mapper = ParameterMapper::new(target);
        let dropped_params = mapper.apply(&mut canonical, self.config.propagate_unsupported_params)?;
        if canonical.client_api != target {
            retain_portable_extensions(&mut canonical, &mapper);
        }
        if target == WireApi::Anthropic && canonical.generation.max_tokens.is_none() {
            canonical.generation.max_tokens = Some(self.max_output_tokens_for(&canonical.model));
        }
        if target == WireApi::OpenAiResponses && self.config.responses_single_turn {
            collapse_to_last_user_turn(&mut canonical);
        }

        let wire = encode_request(&canonical, target)?;
        let mut envelope = RequestEnvelope::from_request(&canonical, unix_now_secs());
        envelope.model = client_model;
        tracing::debug!(
            request_id = %request_id,
            client = %canonical.client_api,
            backend = %target,
            model = %canonical.model,
            stream = canonical.stream,
            "request translated"
        );
        Ok(TranslatedRequest {
            request: wire,
            envelope: Arc::new(envelope),
            dropped_params,
        })
    }

    fn max_output_tokens_for(&self, model: &str) -> u64 {
        let fallback = self.config.max_output_tokens_fallback;
        let Some(source) = &self.model_info else {
            return fallback;
        };
        match source.max_output_tokens(model) {
            Ok(limit) if limit > 0 => limit,
            Ok(_) => fallback,
            Err(e) => {
                tracing::warn!(model, error = %e, fallback, "max output tokens lookup failed; using fallback");
                fallback
            }
        }
    }

    /// Translate a backend response for the client.
    ///
    /// # Errors
    ///
    /// Propagates decode and encode errors; a failed Responses output
    /// surfaces as [`CanonicalError::Upstream`].
    pub fn translate_response(
        &self,
        response: &WireResponse,
        envelope: &RequestEnvelope,
        client: WireApi,
    ) -> Result<WireResponse, CanonicalError> {
        if response.api() == client {
            return Ok(response.clone());
        }
        let canonical = decode_response(response)?;
        encode_response(&canonical, envelope, client)
    }

    /// Transcoder for one streaming call.
    #[must_use]
    pub fn transcoder_for(
        &self,
        envelope: Arc<RequestEnvelope>,
        backend: WireApi,
        client: WireApi,
    ) -> StreamTranscoder {
        StreamTranscoder::new(backend, client, envelope)
    }

    /// Transcoder plus the registry lease that tracks the call while it runs.
    #[must_use]
    pub fn begin_stream(
        &self,
        envelope: Arc<RequestEnvelope>,
        backend: WireApi,
        client: WireApi,
    ) -> (StreamTranscoder, StreamLease) {
        let lease = self.streams.register(
            envelope.request_id,
            StreamEntry::new(client, backend, envelope.model.clone()),
        );
        (self.transcoder_for(envelope, backend, client), lease)
    }
}

/// Keep only extension keys the target understands; the rest belong to the
/// client's protocol.
fn retain_portable_extensions(canonical: &mut CanonicalRequest, mapper: &ParameterMapper) {
    let Some(ext) = canonical.provider_extensions.as_deref_mut() else {
        return;
    };
    let mut dropped = Vec::new();
    ext.retain(|key, _| {
        let keep = mapper.keeps_extension(key);
        if !keep {
            dropped.push(key.clone());
        }
        keep
    });
    if !dropped.is_empty() {
        tracing::debug!(target_api = %mapper.target(), fields = ?dropped, "client-specific fields not forwarded");
    }
    if ext.is_empty() {
        canonical.provider_extensions = None;
    }
}

/// Responses backends that take a single logical turn get only the last
/// user message; instructions are kept.
fn collapse_to_last_user_turn(canonical: &mut CanonicalRequest) {
    let Some(last_user) = canonical
        .messages
        .iter()
        .rposition(|m| m.role == CanonicalRole::User)
    else {
        return;
    };
    let dropped = canonical.messages.len() - 1;
    if dropped == 0 {
        return;
    }
    let kept = canonical.messages.swap_remove(last_user);
    canonical.messages = vec![kept];
    tracing::debug!(dropped, "history collapsed to the last user turn");
}

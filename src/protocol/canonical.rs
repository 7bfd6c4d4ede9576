use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;

use crate::protocol::usage::UsageSnapshot;

pub type ProviderExtensions = serde_json::Map<String, serde_json::Value>;

/// One of the three wire protocols a client or backend can speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireApi {
    /// Messages-style API (`/v1/messages`).
    Anthropic,
    /// Chat-Completions-style API (`/v1/chat/completions`).
    OpenAiChat,
    /// Responses-style API (`/v1/responses`).
    OpenAiResponses,
}

impl WireApi {
    pub const ALL: [WireApi; 3] = [
        WireApi::Anthropic,
        WireApi::OpenAiChat,
        WireApi::OpenAiResponses,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            WireApi::Anthropic => "anthropic",
            WireApi::OpenAiChat => "openai_chat",
            WireApi::OpenAiResponses => "openai_responses",
        }
    }

    /// Parse the names accepted on the command line and in config files.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "anthropic" | "messages" => Some(WireApi::Anthropic),
            "openai" | "openai_chat" | "openai-chat" | "chat" => Some(WireApi::OpenAiChat),
            "openai_responses" | "openai-responses" | "responses" => {
                Some(WireApi::OpenAiResponses)
            }
            _ => None,
        }
    }
}

impl fmt::Display for WireApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CanonicalRole {
    System,
    User,
    Assistant,
    Tool,
}

/// Reason the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CanonicalStopReason {
    EndOfTurn,
    ToolCalls,
    MaxTokens,
    StopSequence,
    ContentFilter,
}

/// Tool choice specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CanonicalToolChoice {
    Auto,
    None,
    Required,
    Specific(String),
}

/// Reasoning / extended-thinking configuration requested by the client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReasoningConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effort: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_tokens: Option<u64>,
}

impl ReasoningConfig {
    /// Derive an effort label from a thinking token budget.
    #[must_use]
    pub fn effort_or_from_budget(&self) -> Option<String> {
        if let Some(effort) = &self.effort {
            return Some(effort.clone());
        }
        self.budget_tokens.map(|budget| {
            match budget {
                0..=2048 => "low",
                2049..=8192 => "medium",
                _ => "high",
            }
            .to_string()
        })
    }

    /// Derive a thinking token budget from an effort label.
    #[must_use]
    pub fn budget_or_from_effort(&self) -> Option<u64> {
        if self.budget_tokens.is_some() {
            return self.budget_tokens;
        }
        match self.effort.as_deref()? {
            "minimal" | "low" => Some(2048),
            "medium" => Some(8192),
            "high" => Some(24_576),
            _ => None,
        }
    }
}

/// Generation parameters passed through to the backend.
#[derive(Debug, Clone, Default)]
pub struct GenerationParams {
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
    pub top_p: Option<f64>,
    pub top_k: Option<u64>,
    pub frequency_penalty: Option<f64>,
    pub presence_penalty: Option<f64>,
    pub n: Option<u32>,
    pub stop: Option<Vec<String>>,
    pub seed: Option<i64>,
}

/// A single part of a message's content.
#[derive(Debug, Clone)]
pub enum CanonicalPart {
    Text(String),
    Reasoning {
        text: String,
        signature: Option<String>,
    },
    ImageUrl {
        url: String,
        detail: Option<String>,
    },
    ToolCall {
        id: String,
        name: String,
        arguments: Box<serde_json::value::RawValue>,
    },
    ToolResult {
        tool_call_id: String,
        content: String,
    },
    Refusal(String),
}

/// A single message in the canonical conversation.
#[derive(Debug, Clone)]
pub struct CanonicalMessage {
    pub role: CanonicalRole,
    pub parts: SmallVec<[CanonicalPart; 1]>,
    pub name: Option<String>,
    pub tool_call_id: Option<String>,
}

impl CanonicalMessage {
    #[must_use]
    pub fn new(role: CanonicalRole, parts: Vec<CanonicalPart>) -> Self {
        Self {
            role,
            parts: parts.into(),
            name: None,
            tool_call_id: None,
        }
    }

    /// Concatenated text of all `Text` parts.
    #[must_use]
    pub fn text(&self) -> String {
        let mut out = String::new();
        for part in &self.parts {
            if let CanonicalPart::Text(text) = part {
                out.push_str(text);
            }
        }
        out
    }
}

/// A tool's function declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalToolFunction {
    pub name: String,
    pub description: Option<String>,
    pub parameters: serde_json::Value,
}

/// A tool specification in the request.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalToolSpec {
    pub function: CanonicalToolFunction,
}

/// The fully-decoded, protocol-agnostic request.
#[derive(Debug, Clone)]
pub struct CanonicalRequest {
    pub request_id: uuid::Uuid,
    pub client_api: WireApi,
    pub model: String,
    pub stream: bool,
    pub include_usage: bool,
    pub system_prompt: Option<String>,
    pub messages: Vec<CanonicalMessage>,
    pub tools: Arc<[CanonicalToolSpec]>,
    pub tool_choice: CanonicalToolChoice,
    pub generation: GenerationParams,
    pub reasoning: Option<ReasoningConfig>,
    pub metadata: Option<ProviderExtensions>,
    pub parallel_tool_calls: Option<bool>,
    pub user: Option<String>,
    pub provider_extensions: Option<Box<ProviderExtensions>>,
}

impl CanonicalRequest {
    /// An empty request for the given client protocol; decoders fill in the rest.
    #[must_use]
    pub fn empty(request_id: uuid::Uuid, client_api: WireApi, model: String) -> Self {
        Self {
            request_id,
            client_api,
            model,
            stream: false,
            include_usage: false,
            system_prompt: None,
            messages: Vec::new(),
            tools: Arc::from(Vec::new()),
            tool_choice: CanonicalToolChoice::Auto,
            generation: GenerationParams::default(),
            reasoning: None,
            metadata: None,
            parallel_tool_calls: None,
            user: None,
            provider_extensions: None,
        }
    }

    #[must_use]
    pub fn provider_extensions_ref(&self) -> &ProviderExtensions {
        match self.provider_extensions.as_deref() {
            Some(ext) => ext,
            None => empty_extensions(),
        }
    }

    #[must_use]
    pub fn provider_extensions_mut(&mut self) -> &mut ProviderExtensions {
        self.provider_extensions
            .get_or_insert_with(|| Box::new(ProviderExtensions::new()))
    }
}

/// The fully-decoded, protocol-agnostic non-streaming response.
#[derive(Debug, Clone)]
pub struct CanonicalResponse {
    pub id: String,
    pub model: String,
    pub content: Vec<CanonicalPart>,
    pub stop_reason: CanonicalStopReason,
    pub usage: UsageSnapshot,
}

#[must_use]
pub fn provider_extensions_from_map(map: ProviderExtensions) -> Option<Box<ProviderExtensions>> {
    if map.is_empty() {
        None
    } else {
        Some(Box::new(map))
    }
}

#[must_use]
pub fn provider_extensions_to_map(value: &Option<Box<ProviderExtensions>>) -> ProviderExtensions {
    value.as_deref().cloned().unwrap_or_default()
}

fn empty_extensions() -> &'static ProviderExtensions {
    static EMPTY: std::sync::LazyLock<ProviderExtensions> =
        std::sync::LazyLock::new(ProviderExtensions::new);
    &EMPTY
}

/// Kind of a non-tool content block in a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Text,
    Reasoning,
}

/// A single event in a canonical stream.
///
/// `index` is always the content index assigned by the source protocol (or by
/// the source decoder when the protocol has none), so target encoders can
/// order the final content by it.
#[derive(Debug, Clone, PartialEq)]
pub enum CanonicalStreamEvent {
    MessageStart {
        id: Option<String>,
        model: Option<String>,
    },
    BlockStart {
        index: usize,
        kind: BlockKind,
    },
    TextDelta {
        index: usize,
        text: String,
    },
    ReasoningDelta {
        index: usize,
        text: String,
    },
    ReasoningSignature {
        index: usize,
        signature: String,
    },
    BlockStop {
        index: usize,
    },
    ToolCallStart {
        index: usize,
        id: String,
        name: String,
    },
    ToolCallArgsDelta {
        index: usize,
        delta: String,
    },
    /// Closes a tool call. `arguments` is the final, valid JSON text.
    ToolCallEnd {
        index: usize,
        arguments: String,
    },
    Usage(UsageSnapshot),
    MessageEnd {
        stop_reason: CanonicalStopReason,
    },
    Done,
    Error {
        status: u16,
        message: String,
    },
}

//! Vendor-neutral token accounting.
//!
//! Every protocol's usage object is mapped into [`UsageSnapshot`] and back.
//! `input_tokens` keeps the same number under every field name
//! (`input_tokens`, `prompt_tokens`); cache counters are accepted from any of
//! the fields backends are known to report them in.

use serde::{Deserialize, Serialize};

use super::anthropic::AnthropicUsage;
use super::openai_chat::{OpenAiCompletionTokensDetails, OpenAiPromptTokensDetails, OpenAiUsage};
use super::openai_responses::{
    ResponsesInputTokensDetails, ResponsesOutputTokensDetails, ResponsesUsage,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
    pub reasoning_tokens: u64,
}

impl UsageSnapshot {
    #[must_use]
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Fold a later partial report into this one; non-zero fields win.
    pub fn merge(&mut self, later: &UsageSnapshot) {
        fn pick(current: &mut u64, later: u64) {
            if later > 0 {
                *current = later;
            }
        }
        pick(&mut self.input_tokens, later.input_tokens);
        pick(&mut self.output_tokens, later.output_tokens);
        pick(&mut self.cache_read_tokens, later.cache_read_tokens);
        pick(&mut self.cache_creation_tokens, later.cache_creation_tokens);
        pick(&mut self.reasoning_tokens, later.reasoning_tokens);
    }

    #[must_use]
    pub fn to_anthropic(&self) -> AnthropicUsage {
        AnthropicUsage {
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            cache_creation_input_tokens: non_zero(self.cache_creation_tokens),
            cache_read_input_tokens: non_zero(self.cache_read_tokens),
        }
    }

    #[must_use]
    pub fn to_openai(&self) -> OpenAiUsage {
        let prompt_tokens_details =
            if self.cache_read_tokens > 0 || self.cache_creation_tokens > 0 {
                Some(OpenAiPromptTokensDetails {
                    cached_tokens: Some(self.cache_read_tokens),
                    cache_creation_tokens: non_zero(self.cache_creation_tokens),
                })
            } else {
                None
            };
        let completion_tokens_details =
            non_zero(self.reasoning_tokens).map(|reasoning| OpenAiCompletionTokensDetails {
                reasoning_tokens: Some(reasoning),
            });
        OpenAiUsage {
            prompt_tokens: self.input_tokens,
            completion_tokens: self.output_tokens,
            total_tokens: self.total_tokens(),
            prompt_tokens_details,
            completion_tokens_details,
            cache_read_input_tokens: None,
            cache_creation_input_tokens: None,
        }
    }

    #[must_use]
    pub fn to_responses(&self) -> ResponsesUsage {
        ResponsesUsage {
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            total_tokens: self.total_tokens(),
            input_tokens_details: Some(ResponsesInputTokensDetails {
                cached_tokens: self.cache_read_tokens,
                cache_creation_tokens: non_zero(self.cache_creation_tokens),
            }),
            output_tokens_details: Some(ResponsesOutputTokensDetails {
                reasoning_tokens: self.reasoning_tokens,
            }),
        }
    }
}

#[inline]
fn non_zero(value: u64) -> Option<u64> {
    (value > 0).then_some(value)
}

impl From<&AnthropicUsage> for UsageSnapshot {
    fn from(usage: &AnthropicUsage) -> Self {
        Self {
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cache_read_tokens: usage.cache_read_input_tokens.unwrap_or(0),
            cache_creation_tokens: usage.cache_creation_input_tokens.unwrap_or(0),
            reasoning_tokens: 0,
        }
    }
}

impl From<&OpenAiUsage> for UsageSnapshot {
    fn from(usage: &OpenAiUsage) -> Self {
        let details = usage.prompt_tokens_details.as_ref();
        let cache_read_tokens = details
            .and_then(|d| d.cached_tokens)
            .or(usage.cache_read_input_tokens)
            .unwrap_or(0);
        let cache_creation_tokens = details
            .and_then(|d| d.cache_creation_tokens)
            .or(usage.cache_creation_input_tokens)
            .unwrap_or(0);
        Self {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            cache_read_tokens,
            cache_creation_tokens,
            reasoning_tokens: usage
                .completion_tokens_details
                .as_ref()
                .and_then(|d| d.reasoning_tokens)
                .unwrap_or(0),
        }
    }
}

impl From<&ResponsesUsage> for UsageSnapshot {
    fn from(usage: &ResponsesUsage) -> Self {
        let details = usage.input_tokens_details.as_ref();
        Self {
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cache_read_tokens: details.map_or(0, |d| d.cached_tokens),
            cache_creation_tokens: details.and_then(|d| d.cache_creation_tokens).unwrap_or(0),
            reasoning_tokens: usage
                .output_tokens_details
                .as_ref()
                .map_or(0, |d| d.reasoning_tokens),
        }
    }
}

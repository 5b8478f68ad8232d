//! Core types for the provider gateway.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

// =============================================================================
// ATTRIBUTION
// =============================================================================

/// Attribution for usage accounting and debugging.
///
/// Every request through the gateway carries attribution so usage records can
/// be traced back to:
/// - The pipeline run that issued it (run_id)
/// - Which code path triggered it (caller)
#[derive(Debug, Clone, Default)]
pub struct Attribution {
    /// Pipeline run this request is part of.
    pub run_id: Option<Uuid>,
    /// Which code path made this call, for debugging.
    /// Use a static string like "pipeline::dispatch".
    pub caller: &'static str,
}

impl Attribution {
    pub fn new(caller: &'static str) -> Self {
        Self {
            caller,
            ..Default::default()
        }
    }

    pub fn with_run(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }
}

// =============================================================================
// CHAT TYPES
// =============================================================================

/// Chat message role. The system prompt travels separately on the request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// A chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Chat model specification.
#[derive(Debug, Clone)]
pub enum ChatModel {
    /// Anthropic Messages API model, e.g. "claude-sonnet-4-5"
    Anthropic(String),
}

impl ChatModel {
    pub fn anthropic(model_id: impl Into<String>) -> Self {
        ChatModel::Anthropic(model_id.into())
    }

    pub fn model_id(&self) -> &str {
        match self {
            ChatModel::Anthropic(id) => id,
        }
    }

    pub fn provider(&self) -> &'static str {
        match self {
            ChatModel::Anthropic(_) => "anthropic",
        }
    }
}

/// Request for a single message completion.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Model to use.
    pub model: ChatModel,
    /// Optional system prompt.
    pub system: Option<String>,
    /// Messages in the conversation.
    pub messages: Vec<Message>,
    /// Maximum tokens to generate. The Messages API requires one.
    pub max_tokens: u32,
    /// Mark the system prompt as cacheable on the provider side.
    pub use_prompt_cache: bool,
    /// Attribution for usage accounting.
    pub attribution: Attribution,
}

impl ChatRequest {
    pub fn new(model: ChatModel, messages: Vec<Message>, attribution: Attribution) -> Self {
        Self {
            model,
            system: None,
            messages,
            max_tokens: 4096,
            use_prompt_cache: false,
            attribution,
        }
    }

    pub fn system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = max;
        self
    }

    pub fn prompt_cache(mut self, enabled: bool) -> Self {
        self.use_prompt_cache = enabled;
        self
    }

    /// Total characters across system prompt and messages.
    pub fn input_chars(&self) -> usize {
        let system = self.system.as_ref().map(|s| s.len()).unwrap_or(0);
        system + self.messages.iter().map(|m| m.content.len()).sum::<usize>()
    }
}

/// Reason the model stopped generating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    EndTurn,
    MaxTokens,
    StopSequence,
    Refusal,
    Unknown(String),
}

impl From<Option<String>> for FinishReason {
    fn from(s: Option<String>) -> Self {
        match s.as_deref() {
            Some("end_turn") => FinishReason::EndTurn,
            Some("max_tokens") => FinishReason::MaxTokens,
            Some("stop_sequence") => FinishReason::StopSequence,
            Some("refusal") => FinishReason::Refusal,
            Some(other) => FinishReason::Unknown(other.to_string()),
            None => FinishReason::Unknown("none".to_string()),
        }
    }
}

/// Token usage as reported by the provider, kept field-for-field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_input_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_creation_input_tokens: Option<u32>,
}

impl TokenUsage {
    /// Every token billed for the call, cache reads and writes included.
    pub fn total(&self) -> u64 {
        self.input_tokens as u64
            + self.output_tokens as u64
            + self.cache_read_input_tokens.unwrap_or(0) as u64
            + self.cache_creation_input_tokens.unwrap_or(0) as u64
    }
}

/// Response from a message completion.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    /// Generated text, all text blocks concatenated.
    pub content: String,
    /// Model that actually served the request.
    pub model: String,
    /// Token usage reported by the provider.
    pub usage: TokenUsage,
    /// Estimated cost in nanodollars.
    pub cost_nanodollars: i64,
    /// Time taken for the request.
    pub latency: Duration,
    /// Why the model stopped.
    pub finish_reason: FinishReason,
    /// Provider request id, if returned.
    pub request_id: Option<String>,
}

//! Anthropic Messages API adapter.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use super::error::{ErrorContext, ProviderError};
use super::pricing::message_cost;
use super::types::*;

// =============================================================================
// TRAIT
// =============================================================================

/// Trait for message completion providers.
#[async_trait]
pub trait MessagesProvider: Send + Sync {
    async fn complete(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError>;
}

// =============================================================================
// ANTHROPIC ADAPTER
// =============================================================================

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
pub const API_VERSION: &str = "2023-06-01";

/// Maximum allowed response body length (1MB).
const MAX_RESPONSE_LEN: usize = 1_024 * 1_024;

/// Maximum allowed input characters (~200k tokens).
pub const MAX_INPUT_CHARS: usize = 800_000;

/// Used when a 429 carries no usable retry-after header.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

/// Anthropic Messages API adapter.
#[derive(Debug, Clone)]
pub struct AnthropicAdapter {
    client: reqwest::Client,
    base_url: String,
}

impl AnthropicAdapter {
    /// `timeout` bounds each HTTP attempt, not the whole retry sequence.
    pub fn with_config(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(ProviderError::config("API key is empty"));
        }
        let base_url = base_url.into().trim_end_matches('/').to_string();

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert("anthropic-version", HeaderValue::from_static(API_VERSION));

        let mut key_value = HeaderValue::from_str(&api_key)
            .map_err(|_| ProviderError::config("Invalid API key format"))?;
        key_value.set_sensitive(true);
        headers.insert("x-api-key", key_value);

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .gzip(true)
            .build()
            .map_err(|e| ProviderError::config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self { client, base_url })
    }

    fn messages_url(&self) -> String {
        format!("{}/messages", self.base_url)
    }

    fn extract_request_id(headers: &HeaderMap) -> Option<String> {
        headers
            .get("request-id")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    }

    fn extract_retry_after(headers: &HeaderMap) -> Duration {
        headers
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_RETRY_AFTER)
    }

    fn classify_error(status: u16, message: String, ctx: ErrorContext) -> ProviderError {
        match status {
            401 | 403 => ProviderError::config(format!("credentials rejected: {message}")),
            400 | 404 | 413 | 422 => ProviderError::invalid_request(message, Some(ctx)),
            s => ProviderError::api(message, s >= 500, Some(ctx)),
        }
    }
}

// =============================================================================
// API TYPES
// =============================================================================

#[derive(Serialize)]
struct MessagesApiRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<Vec<SystemBlock<'a>>>,
    messages: &'a [Message],
}

#[derive(Serialize)]
struct SystemBlock<'a> {
    #[serde(rename = "type")]
    block_type: &'static str,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    cache_control: Option<CacheControl>,
}

#[derive(Serialize)]
struct CacheControl {
    #[serde(rename = "type")]
    control_type: &'static str,
}

#[derive(Deserialize)]
struct MessagesApiResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    model: Option<String>,
    stop_reason: Option<String>,
    usage: Option<TokenUsage>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct ApiErrorEnvelope {
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct ApiError {
    #[serde(rename = "type")]
    error_type: Option<String>,
    message: Option<String>,
}

// =============================================================================
// PROVIDER IMPL
// =============================================================================

#[async_trait]
impl MessagesProvider for AnthropicAdapter {
    async fn complete(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let total_chars = req.input_chars();
        if total_chars > MAX_INPUT_CHARS {
            return Err(ProviderError::invalid_request(
                format!("Input too large: {total_chars} chars (max {MAX_INPUT_CHARS})"),
                None,
            ));
        }

        let start = Instant::now();

        let system = req.system.as_deref().map(|text| {
            vec![SystemBlock {
                block_type: "text",
                text,
                cache_control: req.use_prompt_cache.then_some(CacheControl {
                    control_type: "ephemeral",
                }),
            }]
        });

        let api_req = MessagesApiRequest {
            model: req.model.model_id(),
            max_tokens: req.max_tokens,
            system,
            messages: &req.messages,
        };

        let mut response = self
            .client
            .post(self.messages_url())
            .json(&api_req)
            .send()
            .await?;

        let status = response.status();
        let request_id = Self::extract_request_id(response.headers());
        let retry_after = Self::extract_retry_after(response.headers());

        // Stream response to enforce size limit
        let mut bytes = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            let new_len = bytes.len() + chunk.len();
            if new_len > MAX_RESPONSE_LEN {
                return Err(ProviderError::api(
                    format!("Response too large: {new_len} bytes"),
                    false,
                    Some(ErrorContext::from_status(status.as_u16(), request_id)),
                ));
            }
            bytes.extend_from_slice(&chunk);
        }

        let body = String::from_utf8_lossy(&bytes).to_string();

        let ctx = ErrorContext::from_status(status.as_u16(), request_id.clone());

        if !status.is_success() {
            let parsed = serde_json::from_str::<ApiErrorEnvelope>(&body)
                .ok()
                .and_then(|e| e.error);
            let (message, ctx) = match parsed {
                Some(error) => {
                    let ctx = match error.error_type {
                        Some(error_type) => ctx.error_type(error_type),
                        None => ctx,
                    };
                    (error.message.unwrap_or_default(), ctx)
                }
                None => (format!("HTTP {}", status.as_u16()), ctx),
            };

            if status.as_u16() == 429 {
                return Err(ProviderError::rate_limited_remote(retry_after, ctx));
            }
            return Err(Self::classify_error(status.as_u16(), message, ctx));
        }

        let parsed: MessagesApiResponse = serde_json::from_str(&body)
            .map_err(|e| ProviderError::api(format!("Invalid JSON: {e}"), false, Some(ctx.clone())))?;

        let usage = parsed
            .usage
            .ok_or_else(|| ProviderError::api("Missing usage in response", false, Some(ctx)))?;

        let content: String = parsed
            .content
            .into_iter()
            .filter(|b| b.block_type == "text")
            .filter_map(|b| b.text)
            .collect::<Vec<_>>()
            .join("");

        let model = parsed
            .model
            .unwrap_or_else(|| req.model.model_id().to_string());
        let cost = message_cost(&model, &usage);

        Ok(ChatResponse {
            content,
            model,
            usage,
            cost_nanodollars: cost,
            latency: start.elapsed(),
            finish_reason: FinishReason::from(parsed.stop_reason),
            request_id,
        })
    }
}

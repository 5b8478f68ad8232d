//! Single-message client on top of the provider gateway.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use crate::config::ApiConfig;
use crate::gateway::anthropic::{AnthropicAdapter, DEFAULT_BASE_URL};
use crate::gateway::{
    Attribution, ChatGateway, ChatModel, ChatRequest, GatewayConfig, Message, ProviderError,
    ProviderGateway, TokenUsage, UsageSink,
};
use crate::prompts::DEFAULT_SYSTEM_PROMPT;

pub const API_KEY_ENV: &str = "ANTHROPIC_API_KEY";
pub const BASE_URL_ENV: &str = "ANTHROPIC_BASE_URL";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOptions {
    pub max_tokens: u32,
    pub use_cache: bool,
    pub system_prompt: Option<String>,
    pub run_id: Option<Uuid>,
}

impl SendOptions {
    pub fn from_config(config: &ApiConfig) -> Self {
        Self {
            max_tokens: config.max_tokens,
            use_cache: config.use_cache,
            system_prompt: config.system_prompt.clone(),
            run_id: None,
        }
    }

    pub fn with_run(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }
}

/// A finished dispatch. Usage is exactly what the provider reported.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiResult {
    pub content: String,
    pub usage: TokenUsage,
    pub model: String,
    #[serde(skip)]
    pub latency: Duration,
    pub cost_nanodollars: i64,
}

#[async_trait]
pub trait MessageClient: Send + Sync {
    /// Fail fast, before any I/O, when the client cannot possibly dispatch.
    fn ensure_ready(&self) -> Result<(), ProviderError>;

    async fn send_message(
        &self,
        prompt: &str,
        options: &SendOptions,
    ) -> Result<ApiResult, ProviderError>;
}

pub struct ApiClient {
    gateway: Option<Arc<dyn ChatGateway>>,
    unavailable: Option<String>,
    model: String,
}

impl ApiClient {
    /// Build from config and `ANTHROPIC_API_KEY`. A missing key is not an
    /// error here; it surfaces from [`MessageClient::ensure_ready`].
    pub fn from_env(config: &ApiConfig, usage_sink: Arc<dyn UsageSink>) -> Self {
        match std::env::var(API_KEY_ENV) {
            Ok(key) if !key.trim().is_empty() => Self::with_api_key(config, key, usage_sink),
            _ => Self::unavailable(config, format!("{API_KEY_ENV} not set")),
        }
    }

    pub fn with_api_key(
        config: &ApiConfig,
        api_key: impl Into<String>,
        usage_sink: Arc<dyn UsageSink>,
    ) -> Self {
        let base_url = config
            .base_url
            .clone()
            .or_else(|| std::env::var(BASE_URL_ENV).ok())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let adapter = match AnthropicAdapter::with_config(
            api_key,
            base_url,
            Duration::from_secs(config.timeout_seconds),
        ) {
            Ok(adapter) => adapter,
            Err(e) => return Self::unavailable(config, e.to_string()),
        };
        let gateway = ProviderGateway::with_config(
            Arc::new(adapter),
            usage_sink,
            GatewayConfig {
                max_retries: config.max_retries,
                weekly_token_limit: config.weekly_token_limit,
                ..GatewayConfig::default()
            },
        );
        Self::with_gateway(Arc::new(gateway), config)
    }

    pub fn with_gateway(gateway: Arc<dyn ChatGateway>, config: &ApiConfig) -> Self {
        Self {
            gateway: Some(gateway),
            unavailable: None,
            model: config.model.clone(),
        }
    }

    fn unavailable(config: &ApiConfig, reason: String) -> Self {
        Self {
            gateway: None,
            unavailable: Some(reason),
            model: config.model.clone(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl MessageClient for ApiClient {
    fn ensure_ready(&self) -> Result<(), ProviderError> {
        match (&self.gateway, &self.unavailable) {
            (Some(_), _) => Ok(()),
            (None, Some(reason)) => Err(ProviderError::config(reason.clone())),
            (None, None) => Err(ProviderError::config("API client not configured")),
        }
    }

    async fn send_message(
        &self,
        prompt: &str,
        options: &SendOptions,
    ) -> Result<ApiResult, ProviderError> {
        self.ensure_ready()?;
        let Some(gateway) = &self.gateway else {
            return Err(ProviderError::config("API client not configured"));
        };

        let attribution = match options.run_id {
            Some(run_id) => Attribution::new("pipeline::dispatch").with_run(run_id),
            None => Attribution::new("pipeline::dispatch"),
        };
        let system = options
            .system_prompt
            .clone()
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());

        let req = ChatRequest::new(
            ChatModel::anthropic(&self.model),
            vec![Message::user(prompt)],
            attribution,
        )
        .system(system)
        .max_tokens(options.max_tokens)
        .prompt_cache(options.use_cache);

        let resp = gateway.chat(req).await?;
        tracing::info!(
            stage = "dispatch",
            model = %resp.model,
            input_tokens = resp.usage.input_tokens,
            output_tokens = resp.usage.output_tokens,
            cache_read_input_tokens = resp.usage.cache_read_input_tokens.unwrap_or(0),
            latency_ms = resp.latency.as_millis() as u64,
            "message dispatched"
        );

        Ok(ApiResult {
            content: resp.content,
            usage: resp.usage,
            model: resp.model,
            latency: resp.latency,
            cost_nanodollars: resp.cost_nanodollars,
        })
    }
}

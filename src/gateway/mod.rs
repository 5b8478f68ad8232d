//! Provider gateway for Anthropic message completions.
//!
//! The gateway owns transport retries, usage accounting and the local weekly
//! token limit. Callers above it only see a finished response or a classified
//! [`ProviderError`].

pub mod anthropic;
pub mod error;
pub mod pricing;
pub mod types;
pub mod usage;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::sleep;

use anthropic::MessagesProvider;
use usage::ProviderCallRecord;

pub use error::{ErrorContext, ProviderError, RateLimitSource};
pub use pricing::*;
pub use types::*;
pub use usage::{JsonlUsageLedger, NoopUsageSink, UsageSink, WeeklyUsage};

#[async_trait::async_trait]
pub trait ChatGateway: Send + Sync {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError>;
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    /// Tokens allowed inside the trailing seven days. `None` disables the check.
    pub weekly_token_limit: Option<u64>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_base_delay: Duration::from_secs(1),
            weekly_token_limit: None,
        }
    }
}

pub struct ProviderGateway {
    provider: Arc<dyn MessagesProvider>,
    usage_sink: Arc<dyn UsageSink>,
    config: GatewayConfig,
}

#[async_trait::async_trait]
impl ChatGateway for ProviderGateway {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        ProviderGateway::chat(self, req).await
    }
}

impl ProviderGateway {
    pub fn with_config(
        provider: Arc<dyn MessagesProvider>,
        usage_sink: Arc<dyn UsageSink>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            provider,
            usage_sink,
            config,
        }
    }

    pub async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        self.check_weekly_limit().await?;

        let mut attempt = 0;
        loop {
            match self.provider.complete(&req).await {
                Ok(resp) => {
                    self.record_usage(&req, Some(&resp), None).await;
                    return Ok(resp);
                }
                Err(err) => {
                    self.record_usage(&req, None, Some(&err)).await;

                    if !err.is_retryable() || attempt >= self.config.max_retries {
                        return Err(err);
                    }

                    let delay = backoff_delay(self.config.retry_base_delay, attempt);
                    tracing::debug!(
                        attempt,
                        code = err.code(),
                        delay_ms = delay.as_millis() as u64,
                        "retrying provider call"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Refuse the call before any network attempt once the trailing window
    /// has spent the configured budget.
    async fn check_weekly_limit(&self) -> Result<(), ProviderError> {
        let Some(limit) = self.config.weekly_token_limit else {
            return Ok(());
        };
        let Some(used) = self.usage_sink.weekly_usage().await else {
            return Ok(());
        };
        if used.tokens >= limit {
            let retry_after = used.resets_in(Utc::now());
            tracing::warn!(
                used = used.tokens,
                limit,
                retry_after_secs = retry_after.as_secs(),
                "weekly token limit reached"
            );
            return Err(ProviderError::rate_limited_local(retry_after));
        }
        Ok(())
    }

    async fn record_usage(
        &self,
        req: &ChatRequest,
        resp: Option<&ChatResponse>,
        err: Option<&ProviderError>,
    ) {
        let mut record = ProviderCallRecord::new(
            req.model.provider(),
            "messages",
            req.model.model_id(),
            req.attribution.caller,
        )
        .run(req.attribution.run_id);

        if let Some(resp) = resp {
            record = record
                .usage(resp.usage)
                .cost(resp.cost_nanodollars)
                .latency(resp.latency.as_millis() as i32)
                .request_id(resp.request_id.clone());
        }

        if let Some(err) = err {
            record = record
                .error(err.code())
                .request_id(err.request_id().map(str::to_string));
        }

        self.usage_sink.record(record).await;
    }
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let multiplier = 2u64.pow(attempt.min(5));
    base * multiplier as u32
}

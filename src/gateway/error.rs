//! Failure taxonomy for calls to the Messages API.

use std::time::Duration;

use thiserror::Error;

/// Which limit refused the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitSource {
    /// `api.weeklyTokenLimit`, checked against the usage ledger before sending.
    Local,
    /// HTTP 429 from the API.
    Remote,
}

/// What the API said about a failed call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    pub status: Option<u16>,
    /// `error.type` from the response body, e.g. `overloaded_error`.
    pub error_type: Option<String>,
    /// The `request-id` response header.
    pub request_id: Option<String>,
}

impl ErrorContext {
    pub fn from_status(status: u16, request_id: Option<String>) -> Self {
        Self {
            status: Some(status),
            error_type: None,
            request_id,
        }
    }

    pub fn error_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    /// No usable credentials, or the API rejected the ones we sent.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("rate limited ({limit_source:?}), retry after {retry_after:?}")]
    RateLimited {
        retry_after: Duration,
        limit_source: RateLimitSource,
        context: Option<ErrorContext>,
    },

    /// The request can never succeed as sent: too large, malformed, unknown model.
    #[error("invalid request: {message}")]
    InvalidRequest {
        message: String,
        context: Option<ErrorContext>,
    },

    /// The API answered, but not with a usable message.
    #[error("messages API error: {message}")]
    Api {
        message: String,
        retryable: bool,
        context: Option<ErrorContext>,
    },

    /// Transport failure before any response arrived, timeouts included.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl ProviderError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn rate_limited_local(retry_after: Duration) -> Self {
        Self::RateLimited {
            retry_after,
            limit_source: RateLimitSource::Local,
            context: None,
        }
    }

    pub fn rate_limited_remote(retry_after: Duration, context: ErrorContext) -> Self {
        Self::RateLimited {
            retry_after,
            limit_source: RateLimitSource::Remote,
            context: Some(context),
        }
    }

    pub fn invalid_request(message: impl Into<String>, context: Option<ErrorContext>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
            context,
        }
    }

    pub fn api(message: impl Into<String>, retryable: bool, context: Option<ErrorContext>) -> Self {
        Self::Api {
            message: message.into(),
            retryable,
            context,
        }
    }

    /// Whether the gateway may send the same request again.
    ///
    /// Rate limits are never retried: the window they report is far longer
    /// than any backoff the gateway would wait.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Api { retryable, .. } => *retryable,
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            Self::Config(_) | Self::RateLimited { .. } | Self::InvalidRequest { .. } => false,
        }
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// Stable short code, written to the usage ledger.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_error",
            Self::RateLimited {
                limit_source: RateLimitSource::Local,
                ..
            } => "weekly_limit_reached",
            Self::RateLimited { .. } => "rate_limited",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::Api { .. } => "api_error",
            Self::Http(e) if e.is_timeout() => "timeout",
            Self::Http(_) => "http_error",
        }
    }

    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Self::RateLimited { context, .. }
            | Self::InvalidRequest { context, .. }
            | Self::Api { context, .. } => context.as_ref(),
            Self::Config(_) | Self::Http(_) => None,
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        self.context().and_then(|c| c.request_id.as_deref())
    }
}

//! Usage tracking via the UsageSink trait.
//!
//! The gateway logs all calls through a UsageSink. This decouples the gateway
//! from any specific storage backend:
//! - The CLI uses JsonlUsageLedger, which also backs the weekly token limit
//! - Tests use NoopUsageSink or an in-memory sink

use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::types::TokenUsage;

/// Length of the rolling usage window the weekly limit is measured over.
pub const USAGE_WINDOW_DAYS: i64 = 7;

/// Status of a provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Success,
    Error,
}

/// Record of a provider API call for logging.
#[derive(Debug, Clone)]
pub struct ProviderCallRecord {
    /// Provider name: "anthropic".
    pub provider: &'static str,
    /// Endpoint: "messages".
    pub endpoint: &'static str,
    /// Model used.
    pub model: String,
    /// Tokens reported by the provider (zero on error).
    pub usage: TokenUsage,
    /// Cost in nanodollars (1e-9 USD).
    pub cost_nanodollars: i64,
    /// Pipeline run this call belongs to (if any).
    pub run_id: Option<Uuid>,
    /// Latency in milliseconds.
    pub latency_ms: i32,
    /// Call status.
    pub status: CallStatus,
    /// Error code if status is Error.
    pub error_code: Option<String>,
    /// Which code path made this call.
    pub caller: &'static str,
    /// Provider request ID (for debugging).
    pub request_id: Option<String>,
    /// When the call was made.
    pub timestamp: DateTime<Utc>,
}

impl ProviderCallRecord {
    /// Create a new record with required fields, defaulting others.
    pub fn new(
        provider: &'static str,
        endpoint: &'static str,
        model: impl Into<String>,
        caller: &'static str,
    ) -> Self {
        Self {
            provider,
            endpoint,
            model: model.into(),
            usage: TokenUsage::default(),
            cost_nanodollars: 0,
            run_id: None,
            latency_ms: 0,
            status: CallStatus::Success,
            error_code: None,
            caller,
            request_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn usage(mut self, usage: TokenUsage) -> Self {
        self.usage = usage;
        self
    }

    pub fn cost(mut self, nanodollars: i64) -> Self {
        self.cost_nanodollars = nanodollars;
        self
    }

    pub fn run(mut self, run_id: Option<Uuid>) -> Self {
        self.run_id = run_id;
        self
    }

    pub fn latency(mut self, ms: i32) -> Self {
        self.latency_ms = ms;
        self
    }

    pub fn error(mut self, code: impl Into<String>) -> Self {
        self.status = CallStatus::Error;
        self.error_code = Some(code.into());
        self
    }

    pub fn request_id(mut self, id: Option<String>) -> Self {
        self.request_id = id;
        self
    }
}

/// Tokens spent inside the rolling window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeeklyUsage {
    pub tokens: u64,
    /// Timestamp of the oldest record still inside the window.
    pub oldest: Option<DateTime<Utc>>,
}

impl WeeklyUsage {
    /// Time until the oldest in-window record ages out.
    pub fn resets_in(&self, now: DateTime<Utc>) -> std::time::Duration {
        self.oldest
            .map(|oldest| oldest + ChronoDuration::days(USAGE_WINDOW_DAYS) - now)
            .and_then(|d| d.to_std().ok())
            .unwrap_or_default()
    }
}

/// Trait for recording provider call usage.
///
/// Implement this trait to customize where usage data is stored.
#[async_trait]
pub trait UsageSink: Send + Sync {
    /// Record a provider call. This should be fire-and-forget:
    /// failures should be logged but not propagated.
    async fn record(&self, record: ProviderCallRecord);

    /// Tokens used inside the trailing window, if this sink keeps history.
    async fn weekly_usage(&self) -> Option<WeeklyUsage> {
        None
    }
}

/// No-op usage sink that discards all records.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopUsageSink;

#[async_trait]
impl UsageSink for NoopUsageSink {
    async fn record(&self, _record: ProviderCallRecord) {}
}

/// One persisted line of the usage ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerLine {
    pub timestamp: DateTime<Utc>,
    pub model: String,
    pub status: CallStatus,
    #[serde(flatten)]
    pub usage: TokenUsage,
    pub cost_nanodollars: i64,
    #[serde(default)]
    pub run_id: Option<Uuid>,
    #[serde(default)]
    pub error_code: Option<String>,
}

impl From<&ProviderCallRecord> for LedgerLine {
    fn from(record: &ProviderCallRecord) -> Self {
        Self {
            timestamp: record.timestamp,
            model: record.model.clone(),
            status: record.status,
            usage: record.usage,
            cost_nanodollars: record.cost_nanodollars,
            run_id: record.run_id,
            error_code: record.error_code.clone(),
        }
    }
}

/// Append-only JSONL ledger of provider calls.
///
/// Doubles as the history behind the weekly token limit: `weekly_usage` sums
/// every line newer than [`USAGE_WINDOW_DAYS`].
#[derive(Debug, Clone)]
pub struct JsonlUsageLedger {
    path: PathBuf,
}

impl JsonlUsageLedger {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(path: &Path, line: &LedgerLine) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        let json = serde_json::to_string(line)?;
        writeln!(file, "{json}")
    }

    fn sum_window(path: &Path, now: DateTime<Utc>) -> std::io::Result<WeeklyUsage> {
        let cutoff = now - ChronoDuration::days(USAGE_WINDOW_DAYS);
        let mut usage = WeeklyUsage {
            tokens: 0,
            oldest: None,
        };
        let file = match std::fs::File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(usage),
            Err(e) => return Err(e),
        };
        for line in BufReader::new(file).lines() {
            let line = line?;
            let Ok(entry) = serde_json::from_str::<LedgerLine>(&line) else {
                continue;
            };
            if entry.timestamp <= cutoff {
                continue;
            }
            usage.tokens += entry.usage.total();
            usage.oldest = Some(match usage.oldest {
                Some(oldest) if oldest <= entry.timestamp => oldest,
                _ => entry.timestamp,
            });
        }
        Ok(usage)
    }
}

#[async_trait]
impl UsageSink for JsonlUsageLedger {
    async fn record(&self, record: ProviderCallRecord) {
        let path = self.path.clone();
        let line = LedgerLine::from(&record);
        let result = tokio::task::spawn_blocking(move || Self::append(&path, &line)).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "failed to append usage ledger"),
            Err(e) => tracing::warn!(error = %e, "usage ledger task failed"),
        }
    }

    async fn weekly_usage(&self) -> Option<WeeklyUsage> {
        let path = self.path.clone();
        let now = Utc::now();
        match tokio::task::spawn_blocking(move || Self::sum_window(&path, now)).await {
            Ok(Ok(usage)) => Some(usage),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "failed to read usage ledger");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "usage ledger task failed");
                None
            }
        }
    }
}

//! JSON configuration snapshot.
//!
//! The file is read once at startup. Each component receives its own section
//! by value and never sees the rest.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "CODEBRIEF_CONFIG";
/// Config file used when neither `--config` nor the environment names one.
pub const DEFAULT_CONFIG_FILE: &str = "codebrief.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file not found: {0}")]
    Missing(PathBuf),
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed configuration in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub agents: AgentsConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentsConfig {
    pub cache: CacheConfig,
    #[serde(default)]
    pub retriever: RetrieverConfig,
    #[serde(default)]
    pub extractor: ExtractorConfig,
    #[serde(default)]
    pub preprocessor: PreprocessorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheConfig {
    /// Gates the lookup and store stages. Required.
    pub enabled: bool,
    #[serde(default = "default_cache_path")]
    pub path: PathBuf,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
    #[serde(default)]
    pub max_entries: Option<usize>,
    #[serde(default)]
    pub ttl_days: Option<u32>,
}

fn default_cache_path() -> PathBuf {
    PathBuf::from(".codebrief/cache.sqlite")
}

fn default_similarity_threshold() -> f64 {
    0.8
}

impl CacheConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            path: default_cache_path(),
            similarity_threshold: default_similarity_threshold(),
            max_entries: None,
            ttl_days: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrieverConfig {
    #[serde(default = "default_index_path")]
    pub index_path: PathBuf,
    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,
}

fn default_index_path() -> PathBuf {
    PathBuf::from(".codebrief/index.json")
}

fn default_max_candidates() -> usize {
    25
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        Self {
            index_path: default_index_path(),
            max_candidates: default_max_candidates(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractorConfig {
    #[serde(default = "default_max_methods")]
    pub max_methods: usize,
    #[serde(default)]
    pub max_code_chars: Option<usize>,
}

fn default_max_methods() -> usize {
    10
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            max_methods: default_max_methods(),
            max_code_chars: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreprocessorConfig {
    /// Extra domain terms merged over the built-in dictionary.
    #[serde(default)]
    pub domain_terms: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_true")]
    pub use_cache: bool,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub weekly_token_limit: Option<u64>,
    #[serde(default = "default_usage_ledger_path")]
    pub usage_ledger_path: PathBuf,
}

fn default_model() -> String {
    "claude-sonnet-4-5".to_string()
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_true() -> bool {
    true
}

fn default_timeout_seconds() -> u64 {
    120
}

fn default_max_retries() -> u32 {
    2
}

fn default_usage_ledger_path() -> PathBuf {
    PathBuf::from(".codebrief/usage.jsonl")
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            max_tokens: default_max_tokens(),
            use_cache: true,
            system_prompt: None,
            timeout_seconds: default_timeout_seconds(),
            max_retries: default_max_retries(),
            base_url: None,
            weekly_token_limit: None,
            usage_ledger_path: default_usage_ledger_path(),
        }
    }
}

impl Config {
    /// Pick the config path: explicit flag, then `$CODEBRIEF_CONFIG`, then
    /// `./codebrief.json`.
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(path) = explicit {
            return path.to_path_buf();
        }
        match std::env::var(CONFIG_ENV) {
            Ok(path) if !path.trim().is_empty() => PathBuf::from(path),
            _ => PathBuf::from(DEFAULT_CONFIG_FILE),
        }
    }

    /// Load, validate and anchor relative paths at the file's directory.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ConfigError::Missing(path.to_path_buf()))
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let mut config = Self::from_json(&raw).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })?;
        let base = path.parent().unwrap_or_else(|| Path::new(""));
        config.resolve_relative_to(base);
        Ok(config)
    }

    /// Parse and validate without touching the filesystem. Paths stay as written.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(raw).map_err(|source| ConfigError::Parse {
            path: PathBuf::new(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let cache = &self.agents.cache;
        if !(0.0..=1.0).contains(&cache.similarity_threshold) {
            return Err(ConfigError::Invalid(format!(
                "agents.cache.similarityThreshold must be within [0, 1], got {}",
                cache.similarity_threshold
            )));
        }
        if cache.max_entries == Some(0) {
            return Err(ConfigError::Invalid(
                "agents.cache.maxEntries must be positive".into(),
            ));
        }
        if self.agents.extractor.max_methods == 0 {
            return Err(ConfigError::Invalid(
                "agents.extractor.maxMethods must be positive".into(),
            ));
        }
        if self.agents.extractor.max_code_chars == Some(0) {
            return Err(ConfigError::Invalid(
                "agents.extractor.maxCodeChars must be positive".into(),
            ));
        }
        if self.agents.retriever.max_candidates == 0 {
            return Err(ConfigError::Invalid(
                "agents.retriever.maxCandidates must be positive".into(),
            ));
        }
        if self.api.max_tokens == 0 {
            return Err(ConfigError::Invalid("api.maxTokens must be positive".into()));
        }
        if self.api.timeout_seconds == 0 {
            return Err(ConfigError::Invalid(
                "api.timeoutSeconds must be positive".into(),
            ));
        }
        if self.api.model.trim().is_empty() {
            return Err(ConfigError::Invalid("api.model must not be empty".into()));
        }
        for (term, weight) in &self.agents.preprocessor.domain_terms {
            if !weight.is_finite() || *weight <= 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "agents.preprocessor.domainTerms.{term} must be a positive number"
                )));
            }
        }
        Ok(())
    }

    fn resolve_relative_to(&mut self, base: &Path) {
        anchor(&mut self.agents.cache.path, base);
        anchor(&mut self.agents.retriever.index_path, base);
        anchor(&mut self.api.usage_ledger_path, base);
    }
}

fn anchor(path: &mut PathBuf, base: &Path) {
    if path.is_relative() && !base.as_os_str().is_empty() {
        *path = base.join(&*path);
    }
}

//! Staged query pipeline: preprocess → retrieve → analyze → propose →
//! extract → build prompt → dispatch → remember.
//!
//! The [`Coordinator`] is the only piece that knows every stage. Each stage
//! finishes before the next starts; the only suspension points are the cache,
//! the network call and the optional output file.
//!
//! ```text
//! Init → Preprocessed → Retrieved → Analyzed →
//!   [ProposalPending → Approved | Cancelled] →
//!   Extracted → PromptBuilt → [DryRunDone | Dispatched] → CacheUpdated → Done
//! ```

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use uuid::Uuid;

use crate::analysis::Analyzer;
use crate::cache::{CacheEntry, CacheLookup, ResponseCache};
use crate::client::{ApiResult, MessageClient, SendOptions};
use crate::config::{Config, ConfigError};
use crate::extract::{Extractor, PromptBudget};
use crate::gateway::{ProviderError, RateLimitSource};
use crate::preprocess::Preprocessor;
use crate::prompts::{build_optimized_prompt, estimate_tokens};
use crate::proposals::{CacheHitAction, Interaction, ProposalGenerator};
use crate::retrieval::{IndexError, Retriever};

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error(transparent)]
    File(#[from] ConfigError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error("missing or rejected credentials: {0}")]
    Credentials(String),
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("query must not be empty")]
    EmptyQuery,
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),
    #[error(
        "{} reached; retry after {} once the limiting window resets",
        describe_limit(.limit_source),
        format_wait(.retry_after)
    )]
    RateLimitReached {
        retry_after: Duration,
        limit_source: RateLimitSource,
    },
    #[error("dispatch failed: {0}")]
    Dispatch(#[source] ProviderError),
    #[error("interactive prompt failed: {0}")]
    Interaction(#[source] io::Error),
    #[error("failed to write output file: {0}")]
    Output(#[source] io::Error),
}

impl PipelineError {
    /// Classify a provider failure: credentials and rate limits get their own
    /// variants, everything else is a dispatch failure.
    pub fn from_provider(err: ProviderError) -> Self {
        match err {
            ProviderError::Config(msg) => {
                Self::Configuration(ConfigurationError::Credentials(msg))
            }
            ProviderError::RateLimited {
                retry_after,
                limit_source,
                ..
            } => Self::RateLimitReached {
                retry_after,
                limit_source,
            },
            other => Self::Dispatch(other),
        }
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Self::RateLimitReached { .. })
    }

    /// What the user can do about it, when there is something specific.
    pub fn remediation(&self) -> Option<String> {
        match self {
            Self::RateLimitReached {
                limit_source: RateLimitSource::Local,
                retry_after,
            } => Some(format!(
                "The weekly token limit (api.weeklyTokenLimit) is used up. Wait {} or raise the limit in the configuration.",
                format_wait(retry_after)
            )),
            Self::RateLimitReached {
                limit_source: RateLimitSource::Remote,
                retry_after,
            } => Some(format!(
                "The provider is rate limiting this key. Wait {} and run the same command again.",
                format_wait(retry_after)
            )),
            Self::Configuration(ConfigurationError::Credentials(_)) => Some(format!(
                "Set {} in the environment.",
                crate::client::API_KEY_ENV
            )),
            Self::Configuration(ConfigurationError::File(ConfigError::Missing(_))) => Some(
                "Create codebrief.json or pass --config (or set CODEBRIEF_CONFIG).".to_string(),
            ),
            _ => None,
        }
    }
}

impl From<ConfigError> for PipelineError {
    fn from(e: ConfigError) -> Self {
        Self::Configuration(e.into())
    }
}

impl From<IndexError> for PipelineError {
    fn from(e: IndexError) -> Self {
        Self::Configuration(e.into())
    }
}

fn describe_limit(source: &RateLimitSource) -> &'static str {
    match source {
        RateLimitSource::Local => "weekly token limit",
        RateLimitSource::Remote => "provider rate limit",
    }
}

/// Coarse human duration: "2d 3h", "5h 10m", "4m 2s", "30s".
pub fn format_wait(d: &Duration) -> String {
    let secs = d.as_secs();
    let (days, hours, mins, s) = (secs / 86_400, secs / 3_600 % 24, secs / 60 % 60, secs % 60);
    if days > 0 {
        format!("{days}d {hours}h")
    } else if hours > 0 {
        format!("{hours}h {mins}m")
    } else if mins > 0 {
        format!("{mins}m {s}s")
    } else {
        format!("{s}s")
    }
}

// =============================================================================
// Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Init,
    Preprocessed,
    CacheReused,
    Retrieved,
    Analyzed,
    ProposalPending,
    Approved,
    Cancelled,
    Extracted,
    PromptBuilt,
    DryRunDone,
    Dispatched,
    CacheUpdated,
    Done,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed { response: ApiResult, persisted: bool },
    DryRun { prompt: String },
    Cancelled,
    ReusedCache { entry: CacheEntry },
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    pub outcome: RunOutcome,
    pub stages: Vec<Stage>,
    /// Approximate prompt size, set once the prompt is built.
    pub token_estimate: Option<usize>,
    pub cache_lookup: Option<CacheLookup>,
    pub warnings: Vec<String>,
}

impl RunReport {
    pub fn reached(&self, stage: Stage) -> bool {
        self.stages.contains(&stage)
    }
}

/// Per-run switches from the command line.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub quick: bool,
    pub dry_run: bool,
    pub output: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub quick: bool,
    pub dry_run: bool,
    pub output: Option<PathBuf>,
    pub cache_enabled: bool,
    pub budget: PromptBudget,
    pub send: SendOptions,
}

impl PipelineConfig {
    pub fn new(config: &Config, options: RunOptions) -> Self {
        Self {
            quick: options.quick,
            dry_run: options.dry_run,
            output: options.output,
            cache_enabled: config.agents.cache.enabled,
            budget: PromptBudget::from(&config.agents.extractor),
            send: SendOptions::from_config(&config.api),
        }
    }
}

pub struct PipelineDeps {
    pub preprocessor: Preprocessor,
    pub retriever: Retriever,
    pub cache: Option<Arc<dyn ResponseCache>>,
    pub analyzer: Analyzer,
    pub proposals: ProposalGenerator,
    pub extractor: Extractor,
    pub client: Arc<dyn MessageClient>,
    pub interaction: Arc<dyn Interaction>,
}

// =============================================================================
// Coordinator
// =============================================================================

pub struct Coordinator {
    deps: PipelineDeps,
    config: PipelineConfig,
}

struct RunState {
    run_id: Uuid,
    stages: Vec<Stage>,
    token_estimate: Option<usize>,
    cache_lookup: Option<CacheLookup>,
    warnings: Vec<String>,
}

impl RunState {
    fn enter(&mut self, stage: Stage) {
        tracing::debug!(run_id = %self.run_id, stage = %stage, "stage entered");
        self.stages.push(stage);
    }

    fn warn(&mut self, message: String) {
        tracing::debug!(run_id = %self.run_id, "{message}");
        self.warnings.push(message);
    }

    fn finish(self, outcome: RunOutcome) -> RunReport {
        RunReport {
            run_id: self.run_id,
            outcome,
            stages: self.stages,
            token_estimate: self.token_estimate,
            cache_lookup: self.cache_lookup,
            warnings: self.warnings,
        }
    }
}

impl Coordinator {
    pub fn new(deps: PipelineDeps, config: PipelineConfig) -> Self {
        Self { deps, config }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn cache(&self) -> Option<&Arc<dyn ResponseCache>> {
        if self.config.cache_enabled {
            self.deps.cache.as_ref()
        } else {
            None
        }
    }

    pub async fn run(&self, query: &str) -> Result<RunReport, PipelineError> {
        let mut state = RunState {
            run_id: Uuid::new_v4(),
            stages: Vec::new(),
            token_estimate: None,
            cache_lookup: None,
            warnings: Vec::new(),
        };

        match self.run_stages(query, &mut state).await {
            Ok(outcome) => Ok(state.finish(outcome)),
            Err(err) => {
                let last = state.stages.last().copied();
                state.enter(Stage::Failed);
                tracing::debug!(
                    run_id = %state.run_id,
                    after = ?last,
                    error = %err,
                    "pipeline failed"
                );
                Err(err)
            }
        }
    }

    async fn run_stages(
        &self,
        query: &str,
        state: &mut RunState,
    ) -> Result<RunOutcome, PipelineError> {
        if query.trim().is_empty() {
            return Err(PipelineError::EmptyQuery);
        }
        state.enter(Stage::Init);
        if !self.config.dry_run {
            self.deps
                .client
                .ensure_ready()
                .map_err(PipelineError::from_provider)?;
        }

        let preprocessed = self.deps.preprocessor.process(query);
        state.enter(Stage::Preprocessed);

        if let Some(cache) = self.cache() {
            match cache.find(query).await {
                Ok(lookup) => {
                    let hit = lookup.hit;
                    state.cache_lookup = Some(lookup.clone());
                    if hit {
                        let action = self
                            .deps
                            .interaction
                            .on_cache_hit(&lookup)
                            .map_err(PipelineError::Interaction)?;
                        if let (CacheHitAction::Reuse, Some(entry)) = (action, lookup.entry) {
                            state.enter(Stage::CacheReused);
                            self.write_output(|| {
                                format_response_file(query, &entry.response)
                            })?;
                            return Ok(RunOutcome::ReusedCache { entry });
                        }
                    }
                }
                Err(e) => state.warn(format!("cache lookup failed: {e}")),
            }
        }

        let session = self.deps.retriever.create_search_session(&preprocessed);
        state.enter(Stage::Retrieved);

        let analysis = self.deps.analyzer.analyze(&preprocessed, &session);
        state.enter(Stage::Analyzed);

        let mut selected = None;
        if !self.config.quick {
            let proposals = self.deps.proposals.generate_proposals(&analysis, &session);
            state.enter(Stage::ProposalPending);
            let validation = self
                .deps
                .proposals
                .request_validation(self.deps.interaction.as_ref(), &proposals)
                .map_err(PipelineError::Interaction)?;
            if !validation.approved {
                state.enter(Stage::Cancelled);
                tracing::info!(run_id = %state.run_id, "request cancelled at proposal review");
                return Ok(RunOutcome::Cancelled);
            }
            selected = self
                .deps
                .proposals
                .get_selected_proposal(&proposals, &validation);
            state.enter(Stage::Approved);
        }

        let extracted = self
            .deps
            .extractor
            .extract_methods_code(&session, &self.config.budget);
        if extracted.is_empty() {
            state.warn(format!(
                "no method code could be extracted ({} candidates ranked); the prompt carries no code",
                session.len()
            ));
        }
        state.enter(Stage::Extracted);

        let prompt = build_optimized_prompt(
            query,
            &preprocessed,
            &analysis,
            selected.as_ref(),
            &extracted,
            &session,
        );
        let tokens = estimate_tokens(&prompt);
        state.token_estimate = Some(tokens);
        state.enter(Stage::PromptBuilt);
        tracing::info!(
            run_id = %state.run_id,
            chars = prompt.chars().count(),
            estimated_tokens = tokens,
            methods = extracted.len(),
            "prompt built"
        );
        self.deps.interaction.prompt_built(tokens);

        if self.config.dry_run {
            self.write_output(|| prompt.clone())?;
            state.enter(Stage::DryRunDone);
            return Ok(RunOutcome::DryRun { prompt });
        }

        let send = self.config.send.clone().with_run(state.run_id);
        let response = self
            .deps
            .client
            .send_message(&prompt, &send)
            .await
            .map_err(PipelineError::from_provider)?;
        state.enter(Stage::Dispatched);

        let mut persisted = false;
        if let Some(cache) = self.cache() {
            let saved = match cache.store(query, &response.content).await {
                Ok(()) => cache.save().await,
                Err(e) => Err(e),
            };
            match saved {
                Ok(_) => persisted = true,
                Err(e) => state.warn(format!("failed to persist response cache: {e}")),
            }
            state.enter(Stage::CacheUpdated);
        }

        // The response is already paid for; a bad --output path must not lose it.
        if let Err(e) = self.write_output(|| format_response_file(query, &response.content)) {
            state.warn(e.to_string());
        }
        state.enter(Stage::Done);

        Ok(RunOutcome::Completed {
            response,
            persisted,
        })
    }

    fn write_output(&self, contents: impl FnOnce() -> String) -> Result<(), PipelineError> {
        let Some(path) = &self.config.output else {
            return Ok(());
        };
        write_file(path, &contents()).map_err(PipelineError::Output)?;
        tracing::info!(path = %path.display(), "output written");
        Ok(())
    }
}

fn write_file(path: &Path, contents: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, contents)
}

pub fn format_response_file(query: &str, response: &str) -> String {
    format!("# Query\n{query}\n\n# Response\n{response}")
}

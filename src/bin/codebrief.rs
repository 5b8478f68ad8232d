#![forbid(unsafe_code)]

use std::error::Error as _;
use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::error::ErrorKind;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use codebrief::cache::{CacheLookup, ResponseCache, SqliteResponseCache};
use codebrief::client::{ApiClient, MessageClient};
use codebrief::config::Config;
use codebrief::gateway::{JsonlUsageLedger, UsageSink};
use codebrief::pipeline::{
    Coordinator, PipelineConfig, PipelineDeps, PipelineError, RunOptions, RunOutcome, RunReport,
};
use codebrief::preprocess::Preprocessor;
use codebrief::prompts::{frame_in_box, BOX_WIDTH};
use codebrief::proposals::{
    AutoInteraction, CacheHitAction, Interaction, Proposal, TerminalInteraction, Validation,
};
use codebrief::retrieval::{MethodIndex, Retriever};
use codebrief::{Analyzer, Extractor, ProposalGenerator};

#[derive(Parser)]
#[command(
    name = "codebrief",
    version,
    about = "Ask one well-briefed question about a codebase"
)]
struct Cli {
    /// Skip the proposal review
    #[arg(long)]
    quick: bool,
    /// Debug logging and full error chains
    #[arg(long)]
    verbose: bool,
    /// Build and print the prompt without calling the model
    #[arg(long)]
    dry_run: bool,
    /// Write the response (or, with --dry-run, the prompt) to this file
    #[arg(long)]
    output: Option<PathBuf>,
    /// Configuration file [default: $CODEBRIEF_CONFIG, then ./codebrief.json]
    #[arg(long)]
    config: Option<PathBuf>,
    /// Method index, overriding agents.retriever.indexPath
    #[arg(long)]
    index: Option<PathBuf>,
    /// The question
    query: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::from(1),
            };
        }
    };

    init_tracing(cli.verbose);

    match run(&cli).await {
        Ok(report) => report_outcome(&report),
        Err(err) => {
            report_error(&err, cli.verbose);
            ExitCode::from(1)
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "codebrief=debug" } else { "codebrief=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(io::stderr().is_terminal())
        .with_writer(io::stderr)
        .init();
}

async fn run(cli: &Cli) -> Result<RunReport, PipelineError> {
    if cli.query.trim().is_empty() {
        return Err(PipelineError::EmptyQuery);
    }
    let config_path = Config::resolve_path(cli.config.as_deref());
    let config = Config::load(&config_path)?;

    // Credentials are checked before anything is created on disk.
    let ledger: Arc<dyn UsageSink> = Arc::new(JsonlUsageLedger::new(&config.api.usage_ledger_path));
    let client = ApiClient::from_env(&config.api, ledger);
    if !cli.dry_run {
        client.ensure_ready().map_err(PipelineError::from_provider)?;
    }

    let index_path = cli
        .index
        .clone()
        .unwrap_or_else(|| config.agents.retriever.index_path.clone());
    let index = Arc::new(MethodIndex::load(&index_path)?);

    let cache: Option<Arc<dyn ResponseCache>> = if config.agents.cache.enabled {
        match SqliteResponseCache::open(&config.agents.cache) {
            Ok(cache) => Some(Arc::new(cache)),
            Err(e) => {
                tracing::warn!(error = %e, "response cache unavailable; continuing without it");
                None
            }
        }
    } else {
        None
    };

    let inner: Arc<dyn Interaction> = if io::stdin().is_terminal() {
        Arc::new(TerminalInteraction)
    } else {
        Arc::new(AutoInteraction::approve_first())
    };

    let deps = PipelineDeps {
        preprocessor: Preprocessor::new(&config.agents.preprocessor),
        retriever: Retriever::new(index, &config.agents.retriever),
        cache,
        analyzer: Analyzer,
        proposals: ProposalGenerator,
        extractor: Extractor,
        client: Arc::new(client),
        interaction: Arc::new(ReportingInteraction { inner }),
    };
    let options = RunOptions {
        quick: cli.quick,
        dry_run: cli.dry_run,
        output: cli.output.clone(),
    };

    Coordinator::new(deps, PipelineConfig::new(&config, options))
        .run(&cli.query)
        .await
}

/// Prints the prompt size as soon as it is known, so it survives a failed dispatch.
struct ReportingInteraction {
    inner: Arc<dyn Interaction>,
}

impl Interaction for ReportingInteraction {
    fn request_validation(&self, proposals: &[Proposal]) -> io::Result<Validation> {
        self.inner.request_validation(proposals)
    }

    fn on_cache_hit(&self, lookup: &CacheLookup) -> io::Result<CacheHitAction> {
        self.inner.on_cache_hit(lookup)
    }

    fn prompt_built(&self, token_estimate: usize) {
        eprintln!("estimated prompt size: ~{token_estimate} tokens");
        self.inner.prompt_built(token_estimate);
    }
}

fn report_outcome(report: &RunReport) -> ExitCode {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    for warning in &report.warnings {
        eprintln!("warning: {warning}");
    }

    match &report.outcome {
        RunOutcome::Completed {
            response,
            persisted,
        } => {
            let _ = writeln!(out, "{}", response.content);
            eprintln!(
                "model {} | input {} | output {} | cache read {}{}",
                response.model,
                response.usage.input_tokens,
                response.usage.output_tokens,
                response.usage.cache_read_input_tokens.unwrap_or(0),
                if *persisted { " | cached" } else { "" }
            );
            ExitCode::SUCCESS
        }
        RunOutcome::DryRun { prompt } => {
            let _ = writeln!(out, "{}", frame_in_box(prompt, BOX_WIDTH));
            ExitCode::SUCCESS
        }
        RunOutcome::ReusedCache { entry } => {
            let _ = writeln!(out, "{}", entry.response);
            eprintln!("reused cached answer for: {}", entry.original_query);
            ExitCode::SUCCESS
        }
        RunOutcome::Cancelled => {
            eprintln!("cancelled: no approach was approved");
            ExitCode::from(1)
        }
    }
}

fn report_error(err: &PipelineError, verbose: bool) {
    eprintln!("error: {err}");
    if let Some(hint) = err.remediation() {
        eprintln!("hint: {hint}");
    }
    if verbose {
        let mut source = err.source();
        while let Some(cause) = source {
            eprintln!("  caused by: {cause}");
            source = cause.source();
        }
        if let PipelineError::Dispatch(provider) = err {
            if let Some(ctx) = provider.context() {
                eprintln!("  provider context: {ctx:?}");
            }
        }
    }
}

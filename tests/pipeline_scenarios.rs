use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use codebrief::cache::{CacheEntry, CacheError, CacheLookup, ResponseCache, SaveStats};
use codebrief::client::{ApiResult, MessageClient, SendOptions};
use codebrief::config::{ApiConfig, RetrieverConfig};
use codebrief::extract::PromptBudget;
use codebrief::gateway::{ProviderError, TokenUsage};
use codebrief::pipeline::{
    Coordinator, PipelineConfig, PipelineDeps, PipelineError, RunOutcome, Stage,
};
use codebrief::preprocess::Preprocessor;
use codebrief::proposals::{AutoInteraction, Interaction, Proposal, Validation};
use codebrief::retrieval::{MethodIndex, MethodRecord, Retriever};
use codebrief::{Analyzer, Extractor, ProposalGenerator};
use tempfile::tempdir;

const QUERY: &str = "explain how shape area and perimeter are computed";

fn method(
    key: &str,
    class: &str,
    signature: &str,
    description: &str,
) -> (MethodRecord, Option<String>) {
    let name = key.rsplit('.').next().unwrap_or(key);
    (
        MethodRecord {
            key: key.to_string(),
            file: format!("{}.py", class.to_lowercase()),
            class: Some(class.to_string()),
            signature: signature.to_string(),
            role: "accessor".to_string(),
            description: description.to_string(),
            effects: Default::default(),
            consumers: vec![],
        },
        Some(format!("def {name}(self):\n    return compute_{name}(self)")),
    )
}

fn index() -> MethodIndex {
    MethodIndex::from_records([
        method(
            "Shape.area",
            "Shape",
            "def area(self) -> float",
            "Computes the area of the shape",
        ),
        method(
            "Shape.perimeter",
            "Shape",
            "def perimeter(self) -> float",
            "Computes the perimeter of the shape",
        ),
        method(
            "Circle.area",
            "Circle",
            "def area(self) -> float",
            "Computes the circle area from its radius",
        ),
        method(
            "Logger.flush",
            "Logger",
            "def flush(self) -> None",
            "Writes buffered log lines to disk",
        ),
    ])
    .unwrap()
}

enum Reply {
    Text(&'static str),
    WeeklyLimit,
}

struct MockClient {
    ready: bool,
    reply: Reply,
    sent: Mutex<Vec<(String, SendOptions)>>,
}

impl MockClient {
    fn answering(text: &'static str) -> Self {
        Self {
            ready: true,
            reply: Reply::Text(text),
            sent: Mutex::new(Vec::new()),
        }
    }

    fn sent(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl MessageClient for MockClient {
    fn ensure_ready(&self) -> Result<(), ProviderError> {
        if self.ready {
            Ok(())
        } else {
            Err(ProviderError::config("ANTHROPIC_API_KEY not set"))
        }
    }

    async fn send_message(
        &self,
        prompt: &str,
        options: &SendOptions,
    ) -> Result<ApiResult, ProviderError> {
        self.sent
            .lock()
            .unwrap()
            .push((prompt.to_string(), options.clone()));
        match self.reply {
            Reply::Text(text) => Ok(ApiResult {
                content: text.to_string(),
                usage: TokenUsage {
                    input_tokens: 100,
                    output_tokens: 20,
                    ..Default::default()
                },
                model: "claude-sonnet-4-5".to_string(),
                latency: Duration::from_millis(5),
                cost_nanodollars: 0,
            }),
            Reply::WeeklyLimit => Err(ProviderError::rate_limited_local(Duration::from_secs(
                2 * 3_600,
            ))),
        }
    }
}

#[derive(Default)]
struct RecordingCache {
    lookup: Option<CacheLookup>,
    fail_save: bool,
    stored: Mutex<Vec<(String, String)>>,
}

impl RecordingCache {
    fn hit(query: &str, response: &str) -> Self {
        Self {
            lookup: Some(CacheLookup {
                hit: true,
                similarity: 1.0,
                entry: Some(CacheEntry {
                    query_fingerprint: codebrief::cache::fingerprint(query),
                    original_query: query.to_string(),
                    response: response.to_string(),
                    timestamp: Utc::now(),
                }),
            }),
            ..Default::default()
        }
    }

    fn stored(&self) -> usize {
        self.stored.lock().unwrap().len()
    }
}

#[async_trait]
impl ResponseCache for RecordingCache {
    async fn find(&self, _query: &str) -> Result<CacheLookup, CacheError> {
        Ok(self.lookup.clone().unwrap_or_else(CacheLookup::miss))
    }

    async fn store(&self, query: &str, response: &str) -> Result<(), CacheError> {
        self.stored
            .lock()
            .unwrap()
            .push((query.to_string(), response.to_string()));
        Ok(())
    }

    async fn save(&self) -> Result<SaveStats, CacheError> {
        if self.fail_save {
            return Err(CacheError::Io(io::Error::other("disk full")));
        }
        Ok(SaveStats {
            inserted: self.stored(),
            evicted: 0,
            remaining: self.stored(),
        })
    }
}

/// Approves the first proposal and remembers every prompt estimate it is told about.
#[derive(Default)]
struct EstimateRecorder {
    estimates: Mutex<Vec<usize>>,
}

impl Interaction for EstimateRecorder {
    fn request_validation(&self, proposals: &[Proposal]) -> io::Result<Validation> {
        AutoInteraction::approve_first().request_validation(proposals)
    }

    fn prompt_built(&self, token_estimate: usize) {
        self.estimates.lock().unwrap().push(token_estimate);
    }
}

struct Harness {
    client: Arc<MockClient>,
    cache: Option<Arc<RecordingCache>>,
    interaction: Arc<dyn Interaction>,
    config: PipelineConfig,
}

impl Harness {
    fn new(client: MockClient) -> Self {
        Self {
            client: Arc::new(client),
            cache: None,
            interaction: Arc::new(AutoInteraction::approve_first()),
            config: PipelineConfig {
                quick: false,
                dry_run: false,
                output: None,
                cache_enabled: true,
                budget: PromptBudget {
                    max_methods: 10,
                    max_code_chars: None,
                },
                send: SendOptions::from_config(&ApiConfig::default()),
            },
        }
    }

    fn cache(mut self, cache: RecordingCache) -> Self {
        self.cache = Some(Arc::new(cache));
        self
    }

    fn interaction(mut self, interaction: AutoInteraction) -> Self {
        self.interaction = Arc::new(interaction);
        self
    }

    fn quick(mut self) -> Self {
        self.config.quick = true;
        self
    }

    fn dry_run(mut self) -> Self {
        self.config.dry_run = true;
        self
    }

    fn coordinator(&self) -> Coordinator {
        let cache = self
            .cache
            .clone()
            .map(|c| c as Arc<dyn ResponseCache>);
        Coordinator::new(
            PipelineDeps {
                preprocessor: Preprocessor::default(),
                retriever: Retriever::new(Arc::new(index()), &RetrieverConfig::default()),
                cache,
                analyzer: Analyzer,
                proposals: ProposalGenerator,
                extractor: Extractor,
                client: self.client.clone(),
                interaction: self.interaction.clone(),
            },
            self.config.clone(),
        )
    }
}

fn method_headings(prompt: &str) -> Vec<&str> {
    prompt
        .lines()
        .filter_map(|line| line.strip_prefix("### "))
        .collect()
}

#[tokio::test]
async fn quick_dry_run_builds_prompt_from_matching_methods_only() {
    let harness = Harness::new(MockClient::answering("unused")).quick().dry_run();
    let report = harness.coordinator().run(QUERY).await.unwrap();

    let RunOutcome::DryRun { prompt } = &report.outcome else {
        panic!("expected dry run, got {:?}", report.outcome);
    };
    let headings = method_headings(prompt);
    assert_eq!(headings.len(), 3);
    assert!(!headings.contains(&"Logger.flush"));
    assert!(!prompt.contains("## Chosen Approach"));
    assert!(prompt.ends_with(&format!("## Query\n{QUERY}")));
    assert_eq!(
        report.token_estimate,
        Some(prompt.chars().count().div_ceil(4))
    );

    assert!(report.reached(Stage::DryRunDone));
    assert!(!report.reached(Stage::ProposalPending));
    assert!(!report.reached(Stage::Dispatched));
    assert_eq!(harness.client.sent(), 0);
}

#[tokio::test]
async fn dry_run_does_not_require_credentials() {
    let client = MockClient {
        ready: false,
        ..MockClient::answering("unused")
    };
    let report = Harness::new(client)
        .quick()
        .dry_run()
        .coordinator()
        .run(QUERY)
        .await
        .unwrap();
    assert!(matches!(report.outcome, RunOutcome::DryRun { .. }));
}

#[tokio::test]
async fn approved_proposal_lands_between_analysis_and_query() {
    let harness = Harness::new(MockClient::answering("unused")).dry_run();
    let report = harness.coordinator().run(QUERY).await.unwrap();

    let RunOutcome::DryRun { prompt } = &report.outcome else {
        panic!("expected dry run");
    };
    let positions: Vec<usize> = [
        "## Context",
        "## Relevant Methods",
        "## Analysis",
        "## Chosen Approach",
        "## Query",
    ]
    .iter()
    .map(|heading| prompt.find(heading).expect(heading))
    .collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]), "{positions:?}");
    assert!(prompt.contains("**Extend the existing implementation**"));

    let stages = &report.stages;
    let pending = stages.iter().position(|s| *s == Stage::ProposalPending).unwrap();
    let approved = stages.iter().position(|s| *s == Stage::Approved).unwrap();
    let extracted = stages.iter().position(|s| *s == Stage::Extracted).unwrap();
    assert!(pending < approved && approved < extracted);
}

#[tokio::test]
async fn declined_proposals_cancel_before_extraction_and_dispatch() {
    let harness = Harness::new(MockClient::answering("unused"))
        .cache(RecordingCache::default())
        .interaction(AutoInteraction::decline());
    let report = harness.coordinator().run(QUERY).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Cancelled);
    assert!(report.reached(Stage::Cancelled));
    assert!(!report.reached(Stage::Extracted));
    assert!(!report.reached(Stage::PromptBuilt));
    assert_eq!(harness.client.sent(), 0);
    assert_eq!(harness.cache.as_ref().unwrap().stored(), 0);
}

#[tokio::test]
async fn completed_run_dispatches_once_and_persists_response() {
    let harness =
        Harness::new(MockClient::answering("Area is width times height.")).cache(RecordingCache::default());
    let report = harness.coordinator().run(QUERY).await.unwrap();

    match &report.outcome {
        RunOutcome::Completed {
            response,
            persisted,
        } => {
            assert_eq!(response.content, "Area is width times height.");
            assert_eq!(response.usage.input_tokens, 100);
            assert!(*persisted);
        }
        other => panic!("expected completion, got {other:?}"),
    }
    assert!(report.warnings.is_empty());
    assert_eq!(
        report.stages.last().copied(),
        Some(Stage::Done)
    );
    assert!(report.reached(Stage::CacheUpdated));

    let sent = harness.client.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].1.run_id, Some(report.run_id));
    assert!(sent[0].0.ends_with(QUERY));

    let stored = harness.cache.as_ref().unwrap().stored.lock().unwrap();
    assert_eq!(
        stored.as_slice(),
        &[(QUERY.to_string(), "Area is width times height.".to_string())]
    );
}

#[tokio::test]
async fn weekly_limit_surfaces_as_rate_limit_error() {
    let client = MockClient {
        reply: Reply::WeeklyLimit,
        ..MockClient::answering("unused")
    };
    let harness = Harness::new(client).quick().cache(RecordingCache::default());
    let err = harness.coordinator().run(QUERY).await.unwrap_err();

    assert!(err.is_rate_limit());
    let message = err.to_string();
    assert!(message.contains("weekly token limit"), "{message}");
    assert!(message.contains("2h 0m"), "{message}");
    assert_eq!(harness.cache.as_ref().unwrap().stored(), 0);
}

#[tokio::test]
async fn prompt_estimate_is_reported_before_a_failed_dispatch() {
    let client = MockClient {
        reply: Reply::WeeklyLimit,
        ..MockClient::answering("unused")
    };
    let recorder = Arc::new(EstimateRecorder::default());
    let mut harness = Harness::new(client).quick();
    harness.interaction = recorder.clone();

    let err = harness.coordinator().run(QUERY).await.unwrap_err();
    assert!(err.is_rate_limit());
    assert_eq!(harness.client.sent(), 1);

    let estimates = recorder.estimates.lock().unwrap();
    assert_eq!(estimates.len(), 1);
    let sent = harness.client.sent.lock().unwrap();
    assert_eq!(estimates[0], sent[0].0.chars().count().div_ceil(4));
}

#[tokio::test]
async fn output_write_failure_after_dispatch_keeps_the_response() {
    let dir = tempdir().unwrap();
    // A directory cannot be overwritten as a file.
    let mut harness = Harness::new(MockClient::answering("Multiply the sides.")).quick();
    harness.config.output = Some(dir.path().to_path_buf());

    let report = harness.coordinator().run(QUERY).await.unwrap();
    match &report.outcome {
        RunOutcome::Completed { response, .. } => {
            assert_eq!(response.content, "Multiply the sides.")
        }
        other => panic!("expected completion, got {other:?}"),
    }
    assert_eq!(report.warnings.len(), 1);
    assert!(report.warnings[0].contains("output file"), "{:?}", report.warnings);
    assert!(report.reached(Stage::Done));
    assert!(!report.reached(Stage::Failed));
    assert_eq!(harness.client.sent(), 1);
}

#[tokio::test]
async fn cache_save_failure_is_a_warning_not_an_error() {
    let harness = Harness::new(MockClient::answering("ok"))
        .quick()
        .cache(RecordingCache {
            fail_save: true,
            ..Default::default()
        });
    let report = harness.coordinator().run(QUERY).await.unwrap();

    assert!(matches!(
        report.outcome,
        RunOutcome::Completed {
            persisted: false,
            ..
        }
    ));
    assert_eq!(report.warnings.len(), 1);
    assert!(report.warnings[0].contains("disk full"));
    assert!(report.reached(Stage::Done));
}

#[tokio::test]
async fn missing_credentials_fail_before_any_stage_runs() {
    let client = MockClient {
        ready: false,
        ..MockClient::answering("unused")
    };
    let harness = Harness::new(client).quick();
    let err = harness.coordinator().run(QUERY).await.unwrap_err();

    assert!(matches!(err, PipelineError::Configuration(_)));
    assert!(err.remediation().unwrap().contains("ANTHROPIC_API_KEY"));
    assert_eq!(harness.client.sent(), 0);
}

#[tokio::test]
async fn empty_query_is_rejected() {
    let harness = Harness::new(MockClient::answering("unused"));
    let err = harness.coordinator().run("   \n").await.unwrap_err();
    assert!(matches!(err, PipelineError::EmptyQuery));
}

#[tokio::test]
async fn cache_hit_reuse_short_circuits_and_writes_output() {
    let dir = tempdir().unwrap();
    let output = dir.path().join("out").join("answer.md");

    let mut harness = Harness::new(MockClient::answering("unused"))
        .cache(RecordingCache::hit(QUERY, "cached answer"))
        .interaction(AutoInteraction::approve_first().reuse_cache());
    harness.config.output = Some(output.clone());
    let report = harness.coordinator().run(QUERY).await.unwrap();

    match &report.outcome {
        RunOutcome::ReusedCache { entry } => assert_eq!(entry.response, "cached answer"),
        other => panic!("expected cache reuse, got {other:?}"),
    }
    assert!(report.reached(Stage::CacheReused));
    assert!(!report.reached(Stage::Retrieved));
    assert_eq!(harness.client.sent(), 0);
    assert_eq!(
        std::fs::read_to_string(&output).unwrap(),
        format!("# Query\n{QUERY}\n\n# Response\ncached answer")
    );
}

#[tokio::test]
async fn cache_hit_without_reuse_still_dispatches() {
    let harness = Harness::new(MockClient::answering("fresh answer"))
        .quick()
        .cache(RecordingCache::hit(QUERY, "cached answer"));
    let report = harness.coordinator().run(QUERY).await.unwrap();

    assert!(report.cache_lookup.as_ref().unwrap().hit);
    assert!(matches!(report.outcome, RunOutcome::Completed { .. }));
    assert_eq!(harness.client.sent(), 1);
}

#[tokio::test]
async fn cache_disabled_skips_lookup_and_store() {
    let mut harness = Harness::new(MockClient::answering("ok"))
        .quick()
        .cache(RecordingCache::hit(QUERY, "cached answer"))
        .interaction(AutoInteraction::approve_first().reuse_cache());
    harness.config.cache_enabled = false;
    let report = harness.coordinator().run(QUERY).await.unwrap();

    assert!(report.cache_lookup.is_none());
    assert!(!report.reached(Stage::CacheUpdated));
    assert_eq!(harness.cache.as_ref().unwrap().stored(), 0);
    assert!(matches!(
        report.outcome,
        RunOutcome::Completed {
            persisted: false,
            ..
        }
    ));
}

#[tokio::test]
async fn completed_run_writes_response_file() {
    let dir = tempdir().unwrap();
    let output = dir.path().join("answer.md");

    let mut harness = Harness::new(MockClient::answering("Multiply the sides.")).quick();
    harness.config.output = Some(output.clone());
    harness.coordinator().run(QUERY).await.unwrap();

    assert_eq!(
        std::fs::read_to_string(&output).unwrap(),
        format!("# Query\n{QUERY}\n\n# Response\nMultiply the sides.")
    );
}

#[tokio::test]
async fn extracted_methods_are_the_top_ranked_prefix() {
    let mut harness = Harness::new(MockClient::answering("unused")).quick().dry_run();
    harness.config.budget.max_methods = 2;
    let report = harness.coordinator().run(QUERY).await.unwrap();
    let RunOutcome::DryRun { prompt } = &report.outcome else {
        panic!("expected dry run");
    };

    let retriever = Retriever::new(Arc::new(index()), &RetrieverConfig::default());
    let session = retriever.create_search_session(&Preprocessor::default().process(QUERY));
    let ranked: Vec<&str> = session.keys().take(2).collect();
    assert_eq!(method_headings(prompt), ranked);
}

#[tokio::test]
async fn no_matching_methods_warns_and_still_builds_prompt() {
    let harness = Harness::new(MockClient::answering("unused")).quick().dry_run();
    let report = harness
        .coordinator()
        .run("zebra quokka")
        .await
        .unwrap();

    let RunOutcome::DryRun { prompt } = &report.outcome else {
        panic!("expected dry run");
    };
    assert!(method_headings(prompt).is_empty());
    assert!(!prompt.contains("## Relevant Methods"));
    assert_eq!(report.warnings.len(), 1);
}

#[test]
fn retrieval_is_deterministic_with_key_order_tiebreak() {
    let retriever = Retriever::new(Arc::new(index()), &RetrieverConfig::default());
    let query = Preprocessor::default().process("area");

    let first: Vec<String> = retriever
        .create_search_session(&query)
        .keys()
        .map(str::to_string)
        .collect();
    let second: Vec<String> = retriever
        .create_search_session(&query)
        .keys()
        .map(str::to_string)
        .collect();

    assert_eq!(first, second);
    assert_eq!(first, vec!["Circle.area", "Shape.area"]);
}

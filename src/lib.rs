#![forbid(unsafe_code)]

//! # codebrief
//!
//! Ask one well-briefed question about a codebase.
//!
//! A query is normalized, matched against an index of methods, classified,
//! optionally reviewed as a set of proposed approaches, and turned into a
//! single size-budgeted prompt. One model call answers it, and the answer is
//! remembered so that a similar question later can reuse it.
//!
//! The stages live in their own modules and meet only in
//! [`pipeline::Coordinator`].

pub mod analysis;
pub mod cache;
pub mod client;
pub mod config;
pub mod extract;
pub mod gateway;
pub mod pipeline;
pub mod preprocess;
pub mod prompts;
pub mod proposals;
pub mod retrieval;

pub use analysis::{Analysis, Analyzer};
pub use cache::{CacheEntry, CacheLookup, ResponseCache, SqliteResponseCache};
pub use client::{ApiClient, ApiResult, MessageClient, SendOptions};
pub use config::{Config, ConfigError};
pub use extract::{ExtractedMethod, Extractor, PromptBudget};
pub use gateway::{ChatGateway, ProviderError, ProviderGateway, UsageSink};
pub use pipeline::{
    Coordinator, PipelineConfig, PipelineDeps, PipelineError, RunOptions, RunOutcome, RunReport,
    Stage,
};
pub use preprocess::{PreprocessedQuery, Preprocessor};
pub use proposals::{Interaction, Proposal, ProposalGenerator};
pub use retrieval::{MethodIndex, Retriever, SearchSession};

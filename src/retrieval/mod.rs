//! Ranked retrieval over the method index.
//!
//! The [`Retriever`] scores every indexed method with a [`Ranker`], drops the
//! ones that score zero, and orders the rest by score descending with ties
//! broken by key ascending. The result is a [`SearchSession`]: built once per
//! query, read-only afterwards.

pub mod index;
pub mod ranker;
pub mod session;

use std::cmp::Ordering;
use std::sync::Arc;

use thiserror::Error;

use crate::config::RetrieverConfig;
use crate::preprocess::PreprocessedQuery;

pub use index::{IndexError, MethodIndex, MethodRecord};
pub use ranker::{Ranker, TermOverlapRanker};
pub use session::{MethodView, RankedKey, SearchSession};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RetrievalError {
    #[error("detail level must be 1, 2 or 3 (got {0})")]
    InvalidDetailLevel(u8),
}

pub struct Retriever {
    index: Arc<MethodIndex>,
    ranker: Box<dyn Ranker>,
    max_candidates: usize,
}

impl Retriever {
    pub fn new(index: Arc<MethodIndex>, config: &RetrieverConfig) -> Self {
        Self::with_ranker(index, Box::new(TermOverlapRanker), config)
    }

    pub fn with_ranker(
        index: Arc<MethodIndex>,
        ranker: Box<dyn Ranker>,
        config: &RetrieverConfig,
    ) -> Self {
        Self {
            index,
            ranker,
            max_candidates: config.max_candidates,
        }
    }

    pub fn index(&self) -> &Arc<MethodIndex> {
        &self.index
    }

    pub fn create_search_session(&self, query: &PreprocessedQuery) -> SearchSession {
        let mut ranked: Vec<RankedKey> = self
            .index
            .records()
            .iter()
            .filter_map(|record| {
                let score = self.ranker.score(query, record);
                (score.is_finite() && score > 0.0).then(|| RankedKey {
                    key: record.key.clone(),
                    score,
                })
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.key.cmp(&b.key))
        });
        ranked.truncate(self.max_candidates);

        tracing::debug!(
            stage = "retrieve",
            candidates = ranked.len(),
            top = ranked.first().map(|r| r.key.as_str()).unwrap_or("-"),
            "search session created"
        );

        SearchSession::new(Arc::clone(&self.index), ranked)
    }
}

/// Query categories, in match priority order.
const CATEGORIES: &[(&str, &[&str])] = &[
    ("feature", &["add", "create", "implement", "introduce", "new", "support"]),
    ("bugfix", &["fix", "bug", "error", "crash", "broken", "fail", "wrong"]),
    ("refactor", &["refactor", "rename", "extract", "simplify", "restructure", "cleanup"]),
    ("performance", &["slow", "optimize", "performance", "faster", "latency", "speed"]),
    ("testing", &["test", "coverage", "mock"]),
    ("documentation", &["document", "comment", "docs", "docstring", "readme"]),
    ("explanation", &["explain", "how", "why", "what", "where", "understand"]),
];

/// First category with a keyword in `text`, or `None`.
pub fn detect_query_category(text: &str) -> Option<&'static str> {
    let lowered = text.to_lowercase();
    let words: Vec<&str> = lowered
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();

    CATEGORIES
        .iter()
        .find(|(_, keywords)| {
            keywords
                .iter()
                .any(|kw| words.iter().any(|w| keyword_matches(w, kw)))
        })
        .map(|(category, _)| *category)
}

fn keyword_matches(word: &str, keyword: &str) -> bool {
    if word == keyword {
        return true;
    }
    if keyword.len() >= 4 && word.starts_with(keyword) {
        return true;
    }
    word.strip_prefix(keyword)
        .is_some_and(|suffix| matches!(suffix, "s" | "es" | "ed" | "ing"))
}

//! Query normalization and domain-term detection.

use std::collections::{BTreeMap, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::PreprocessorConfig;

static NON_TOKEN_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^a-z0-9_.:#\-]+").expect("static regex is valid"));

/// Words dropped during normalization. Question words stay: they drive
/// category detection.
pub(crate) const STOPWORDS: &[&str] = &[
    "a", "about", "also", "an", "and", "any", "are", "as", "at", "be", "been", "but", "by",
    "can", "could", "did", "do", "does", "for", "from", "i", "in", "into", "is", "it", "its",
    "just", "me", "my", "of", "on", "or", "our", "please", "should", "so", "some", "that",
    "the", "their", "then", "there", "these", "this", "those", "to", "was", "we", "were",
    "will", "with", "would", "you", "your",
];

static STOPWORD_SET: Lazy<HashSet<&'static str>> = Lazy::new(|| STOPWORDS.iter().copied().collect());

/// Built-in domain vocabulary with relative weights.
const DEFAULT_DOMAIN_TERMS: &[(&str, f64)] = &[
    ("api", 0.9),
    ("async", 0.8),
    ("auth", 1.0),
    ("authentication", 1.0),
    ("cache", 1.0),
    ("class", 0.5),
    ("config", 0.8),
    ("configuration", 0.8),
    ("database", 1.0),
    ("endpoint", 0.9),
    ("error", 0.7),
    ("function", 0.5),
    ("handler", 0.7),
    ("http", 0.8),
    ("index", 0.8),
    ("logging", 0.7),
    ("method", 0.5),
    ("model", 0.6),
    ("parser", 0.9),
    ("prompt", 0.8),
    ("query", 0.8),
    ("request", 0.7),
    ("response", 0.7),
    ("retry", 0.8),
    ("schema", 0.8),
    ("session", 0.8),
    ("test", 0.6),
    ("thread", 0.8),
    ("token", 0.8),
    ("validation", 0.8),
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedTerm {
    pub term: String,
    pub weight: f64,
}

/// Normalized query plus the domain terms found in it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreprocessedQuery {
    pub cleaned: String,
    pub detected_terms: Vec<DetectedTerm>,
}

#[derive(Debug, Clone)]
pub struct Preprocessor {
    dictionary: BTreeMap<String, f64>,
}

impl Default for Preprocessor {
    fn default() -> Self {
        Self::new(&PreprocessorConfig::default())
    }
}

impl Preprocessor {
    /// Built-in dictionary with the configured terms layered on top.
    pub fn new(config: &PreprocessorConfig) -> Self {
        let mut dictionary: BTreeMap<String, f64> = DEFAULT_DOMAIN_TERMS
            .iter()
            .map(|(t, w)| (t.to_string(), *w))
            .collect();
        for (term, weight) in &config.domain_terms {
            dictionary.insert(term.to_lowercase(), *weight);
        }
        Self { dictionary }
    }

    pub fn process(&self, raw: &str) -> PreprocessedQuery {
        let tokens = normalize_tokens(raw);
        let cleaned = tokens.join(" ");

        let mut found: BTreeMap<&str, f64> = BTreeMap::new();
        for token in &tokens {
            let stem = token.strip_suffix('s').filter(|s| !s.is_empty());
            for candidate in std::iter::once(token.as_str()).chain(stem) {
                if let Some((term, weight)) = self.dictionary.get_key_value(candidate) {
                    found.insert(term.as_str(), *weight);
                    break;
                }
            }
        }

        let mut detected_terms: Vec<DetectedTerm> = found
            .into_iter()
            .map(|(term, weight)| DetectedTerm {
                term: term.to_string(),
                weight,
            })
            .collect();
        detected_terms.sort_by(|a, b| {
            b.weight
                .total_cmp(&a.weight)
                .then_with(|| a.term.cmp(&b.term))
        });

        tracing::debug!(
            stage = "preprocess",
            cleaned = %cleaned,
            terms = detected_terms.len(),
            "query normalized"
        );

        PreprocessedQuery {
            cleaned,
            detected_terms,
        }
    }
}

/// Lowercased, punctuation-stripped tokens with stopwords removed.
pub fn normalize_tokens(raw: &str) -> Vec<String> {
    let lowered = raw.to_lowercase();
    NON_TOKEN_CHARS
        .replace_all(&lowered, " ")
        .split_whitespace()
        .map(|t| t.trim_matches(|c| c == '.' || c == ':'))
        .filter(|t| !t.is_empty() && !STOPWORD_SET.contains(t))
        .map(str::to_string)
        .collect()
}

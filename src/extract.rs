//! Full-code extraction for the top-ranked methods.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::config::ExtractorConfig;
use crate::retrieval::SearchSession;

pub const TRUNCATION_MARKER: &str = "... [truncated]";

/// Caps how much code reaches the prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromptBudget {
    pub max_methods: usize,
    pub max_code_chars: Option<usize>,
}

impl From<&ExtractorConfig> for PromptBudget {
    fn from(config: &ExtractorConfig) -> Self {
        Self {
            max_methods: config.max_methods,
            max_code_chars: config.max_code_chars,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractedMethod {
    pub key: String,
    pub file: String,
    pub class: Option<String>,
    pub signature: String,
    pub role: String,
    pub description: String,
    pub effects: BTreeMap<String, Vec<String>>,
    pub consumers: Vec<String>,
    pub score: f64,
    pub code: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Extractor;

impl Extractor {
    /// Take the first `max_methods` ranked keys and resolve each one.
    ///
    /// Keys with no metadata or no code are skipped; the result is a prefix of
    /// the ranked order restricted to resolvable keys.
    pub fn extract_methods_code(
        &self,
        session: &SearchSession,
        budget: &PromptBudget,
    ) -> Vec<ExtractedMethod> {
        let index = session.index();
        let mut extracted = Vec::new();

        for ranked in session.ranked().iter().take(budget.max_methods) {
            let Some(record) = index.get(&ranked.key) else {
                tracing::debug!(stage = "extract", key = %ranked.key, reason = "no metadata", "skipping method");
                continue;
            };
            let Some(code) = index.code(&ranked.key) else {
                tracing::debug!(stage = "extract", key = %ranked.key, reason = "no code", "skipping method");
                continue;
            };

            extracted.push(ExtractedMethod {
                key: record.key.clone(),
                file: record.file.clone(),
                class: record.class.clone(),
                signature: record.signature.clone(),
                role: record.role.clone(),
                description: record.description.clone(),
                effects: record.effects.clone(),
                consumers: record.consumers.clone(),
                score: ranked.score,
                code: truncate_code(code, budget.max_code_chars),
            });
        }

        tracing::debug!(
            stage = "extract",
            extracted = extracted.len(),
            ranked = session.len(),
            "methods extracted"
        );
        extracted
    }
}

fn truncate_code(code: &str, max_chars: Option<usize>) -> String {
    match max_chars {
        Some(max) if code.chars().count() > max => {
            let cut: String = code.chars().take(max).collect();
            format!("{cut}\n{TRUNCATION_MARKER}")
        }
        _ => code.to_string(),
    }
}

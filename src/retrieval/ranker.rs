//! Relevance scoring seam.

use std::collections::HashSet;

use crate::preprocess::PreprocessedQuery;

use super::index::MethodRecord;

/// Scores one method against a query. Higher is more relevant; scores at or
/// below zero drop the method from the session.
pub trait Ranker: Send + Sync {
    fn score(&self, query: &PreprocessedQuery, record: &MethodRecord) -> f64;
}

/// Term-overlap ranker used when no external ranking function is supplied.
///
/// Query words found in the key or signature count double; words found in
/// the class, file, role or description count once. Detected domain terms
/// add their weight on top.
#[derive(Debug, Clone, Copy, Default)]
pub struct TermOverlapRanker;

const IDENT_WEIGHT: f64 = 2.0;
const PROSE_WEIGHT: f64 = 1.0;

impl Ranker for TermOverlapRanker {
    fn score(&self, query: &PreprocessedQuery, record: &MethodRecord) -> f64 {
        let ident = words(&format!("{} {}", record.key, record.signature));
        let prose = words(&format!(
            "{} {} {} {}",
            record.class.as_deref().unwrap_or(""),
            record.file,
            record.role,
            record.description
        ));

        let query_words = words(&query.cleaned);
        let mut score = 0.0;
        for word in &query_words {
            if ident.contains(word) {
                score += IDENT_WEIGHT;
            } else if prose.contains(word) {
                score += PROSE_WEIGHT;
            }
        }
        if score > 0.0 {
            for term in &query.detected_terms {
                let folded = fold(&term.term);
                if ident.contains(&folded) || prose.contains(&folded) {
                    score += term.weight;
                }
            }
        }
        score
    }
}

/// Split identifiers and prose into lowercase words, with a trailing plural
/// `s` folded away.
fn words(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| w.len() > 1)
        .map(fold)
        .collect()
}

fn fold(word: &str) -> String {
    let w = word.to_ascii_lowercase();
    match w.strip_suffix('s') {
        Some(stem) if stem.len() > 2 => stem.to_string(),
        _ => w,
    }
}

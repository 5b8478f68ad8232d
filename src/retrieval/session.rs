//! Ranked search session with level-of-detail projections.

use std::sync::Arc;

use serde::Serialize;

use super::index::{MethodIndex, MethodRecord};
use super::RetrievalError;

/// One ranked candidate: a key into the index plus its score.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedKey {
    pub key: String,
    pub score: f64,
}

/// Projection of a ranked candidate at a given detail level.
///
/// Level 1 fills `key`, `role` and `score`. Level 2 adds `signature`.
/// Level 3 adds `code` (still `None` when the index holds no code for the key).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MethodView {
    pub key: String,
    pub role: String,
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// The ranked outcome of one retrieval. Read-only once built.
#[derive(Debug, Clone)]
pub struct SearchSession {
    index: Arc<MethodIndex>,
    ranked: Vec<RankedKey>,
}

impl SearchSession {
    pub(crate) fn new(index: Arc<MethodIndex>, ranked: Vec<RankedKey>) -> Self {
        Self { index, ranked }
    }

    pub fn ranked(&self) -> &[RankedKey] {
        &self.ranked
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.ranked.iter().map(|r| r.key.as_str())
    }

    pub fn len(&self) -> usize {
        self.ranked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranked.is_empty()
    }

    pub fn index(&self) -> &MethodIndex {
        &self.index
    }

    /// Full records for the ranked keys that still resolve, in rank order.
    pub fn records(&self) -> impl Iterator<Item = (&RankedKey, &MethodRecord)> {
        self.ranked
            .iter()
            .filter_map(|r| self.index.get(&r.key).map(|rec| (r, rec)))
    }

    /// Project the ranked keys at `level` (1..=3). Never re-ranks.
    pub fn get_at_level(&self, level: u8) -> Result<Vec<MethodView>, RetrievalError> {
        if !(1..=3).contains(&level) {
            return Err(RetrievalError::InvalidDetailLevel(level));
        }
        Ok(self
            .records()
            .map(|(ranked, record)| MethodView {
                key: ranked.key.clone(),
                role: record.role.clone(),
                score: ranked.score,
                signature: (level >= 2).then(|| record.signature.clone()),
                code: if level >= 3 {
                    self.index.code(&ranked.key).map(str::to_string)
                } else {
                    None
                },
            })
            .collect())
    }
}

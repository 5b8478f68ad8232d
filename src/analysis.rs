//! Query classification from the retrieved context.
//!
//! Pure: everything is computed from the preprocessed query and the session
//! already in hand. No I/O, no further retrieval.

use std::collections::BTreeSet;
use std::fmt;

use serde::Serialize;

use crate::preprocess::PreprocessedQuery;
use crate::retrieval::{detect_query_category, SearchSession};

/// Consumer count at which a method is flagged as widely used.
pub const HIGH_FAN_IN: usize = 3;

/// Effect kinds that make a change riskier.
pub const RISKY_EFFECTS: &[&str] = &["writes", "io", "network", "database", "state"];

const MEDIUM_THRESHOLD: usize = 4;
const HIGH_THRESHOLD: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComplexityLevel {
    Low,
    Medium,
    High,
}

impl ComplexityLevel {
    pub fn from_score(score: usize) -> Self {
        if score < MEDIUM_THRESHOLD {
            Self::Low
        } else if score < HIGH_THRESHOLD {
            Self::Medium
        } else {
            Self::High
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl fmt::Display for ComplexityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Summary {
    #[serde(rename = "type")]
    pub query_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Complexity {
    pub label: ComplexityLevel,
    pub score: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskKind {
    HighFanIn,
    SideEffect,
    NoContext,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Risk {
    pub kind: RiskKind,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Analysis {
    pub summary: Summary,
    pub complexity: Complexity,
    pub risks: Vec<Risk>,
}

impl Analysis {
    pub fn has_risk(&self, kind: RiskKind) -> bool {
        self.risks.iter().any(|r| r.kind == kind)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Analyzer;

impl Analyzer {
    pub fn analyze(&self, query: &PreprocessedQuery, session: &SearchSession) -> Analysis {
        let query_type = detect_query_category(&query.cleaned)
            .unwrap_or("general")
            .to_string();

        let mut files = BTreeSet::new();
        let mut effect_kinds = BTreeSet::new();
        let mut risks = Vec::new();
        let mut candidates = 0usize;

        for (_, record) in session.records() {
            candidates += 1;
            files.insert(record.file.as_str());
            effect_kinds.extend(record.effects.keys().map(String::as_str));
            if record.consumers.len() >= HIGH_FAN_IN {
                risks.push(Risk {
                    kind: RiskKind::HighFanIn,
                    description: format!(
                        "{} has {} consumers; changes ripple to every caller",
                        record.key,
                        record.consumers.len()
                    ),
                });
            }
        }

        for kind in &effect_kinds {
            if RISKY_EFFECTS.contains(kind) {
                risks.push(Risk {
                    kind: RiskKind::SideEffect,
                    description: format!("retrieved methods perform {kind} side effects"),
                });
            }
        }

        if candidates == 0 {
            risks.push(Risk {
                kind: RiskKind::NoContext,
                description: "no relevant methods were retrieved; the answer relies on the query alone"
                    .to_string(),
            });
        }

        let score = candidates.min(6) / 2
            + files.len()
            + effect_kinds.len()
            + query.detected_terms.len().min(4) / 2;
        let complexity = Complexity {
            label: ComplexityLevel::from_score(score),
            score,
        };

        tracing::debug!(
            stage = "analyze",
            query_type = %query_type,
            complexity = %complexity.label,
            risks = risks.len(),
            "query analyzed"
        );

        Analysis {
            summary: Summary { query_type },
            complexity,
            risks,
        }
    }
}

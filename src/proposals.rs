//! Alternative approaches and the interactive decision points.

use std::io::{self, BufRead, Write};

use serde::Serialize;

use crate::analysis::{Analysis, ComplexityLevel, RiskKind};
use crate::cache::CacheLookup;
use crate::retrieval::SearchSession;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Proposal {
    pub title: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
}

/// Outcome of asking the user to pick a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Validation {
    pub approved: bool,
    pub selected: Option<usize>,
}

impl Validation {
    pub fn approve(index: usize) -> Self {
        Self {
            approved: true,
            selected: Some(index),
        }
    }

    pub fn decline() -> Self {
        Self {
            approved: false,
            selected: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheHitAction {
    /// Ask the model anyway.
    Continue,
    /// End the request with the cached answer.
    Reuse,
}

/// Decisions the pipeline defers to the caller.
pub trait Interaction: Send + Sync {
    fn request_validation(&self, proposals: &[Proposal]) -> io::Result<Validation>;

    fn on_cache_hit(&self, _lookup: &CacheLookup) -> io::Result<CacheHitAction> {
        Ok(CacheHitAction::Continue)
    }

    /// Called once the prompt is final and before anything is sent.
    fn prompt_built(&self, _token_estimate: usize) {}
}

/// Scripted decisions for non-interactive runs.
#[derive(Debug, Clone, Copy)]
pub struct AutoInteraction {
    pub select: Option<usize>,
    pub cache_action: CacheHitAction,
}

impl AutoInteraction {
    pub fn approve_first() -> Self {
        Self {
            select: Some(0),
            cache_action: CacheHitAction::Continue,
        }
    }

    pub fn decline() -> Self {
        Self {
            select: None,
            cache_action: CacheHitAction::Continue,
        }
    }

    pub fn reuse_cache(mut self) -> Self {
        self.cache_action = CacheHitAction::Reuse;
        self
    }
}

impl Interaction for AutoInteraction {
    fn request_validation(&self, _proposals: &[Proposal]) -> io::Result<Validation> {
        Ok(match self.select {
            Some(i) => Validation::approve(i),
            None => Validation::decline(),
        })
    }

    fn on_cache_hit(&self, _lookup: &CacheLookup) -> io::Result<CacheHitAction> {
        Ok(self.cache_action)
    }
}

/// Prompts on stderr, reads answers from stdin.
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminalInteraction;

impl TerminalInteraction {
    fn read_answer(prompt: &str) -> io::Result<Option<String>> {
        let mut err = io::stderr().lock();
        write!(err, "{prompt}")?;
        err.flush()?;
        let mut line = String::new();
        if io::stdin().lock().read_line(&mut line)? == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim().to_lowercase()))
    }
}

impl Interaction for TerminalInteraction {
    fn request_validation(&self, proposals: &[Proposal]) -> io::Result<Validation> {
        {
            let mut err = io::stderr().lock();
            writeln!(err, "\nProposed approaches:")?;
            for (i, p) in proposals.iter().enumerate() {
                writeln!(err, "  {}. {}", i + 1, p.title)?;
                writeln!(err, "     {}", p.description)?;
            }
        }
        let Some(answer) =
            Self::read_answer("Select an approach [1], or 'n' to cancel: ")?
        else {
            return Ok(Validation::decline());
        };
        if answer.is_empty() {
            return Ok(Validation::approve(0));
        }
        match answer.parse::<usize>() {
            Ok(n) if n >= 1 => Ok(Validation::approve(n - 1)),
            _ => Ok(Validation::decline()),
        }
    }

    fn on_cache_hit(&self, lookup: &CacheLookup) -> io::Result<CacheHitAction> {
        let Some(entry) = &lookup.entry else {
            return Ok(CacheHitAction::Continue);
        };
        eprintln!(
            "\nA similar question was answered before ({:.0}% match): {}",
            lookup.similarity * 100.0,
            entry.original_query
        );
        let answer = Self::read_answer("Reuse the cached answer? [y/N]: ")?;
        Ok(match answer.as_deref() {
            Some("y") | Some("yes") => CacheHitAction::Reuse,
            _ => CacheHitAction::Continue,
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProposalGenerator;

impl ProposalGenerator {
    pub fn generate_proposals(&self, analysis: &Analysis, session: &SearchSession) -> Vec<Proposal> {
        let top = session.records().next().map(|(_, record)| record);
        let snippet = top.map(|r| r.signature.clone());

        let (anchor, home) = match top {
            Some(r) => (
                format!("`{}`", r.key),
                match &r.class {
                    Some(class) => format!("`{class}` in {}", r.file),
                    None => r.file.clone(),
                },
            ),
            None => (
                "the closest existing code".to_string(),
                "the most relevant module".to_string(),
            ),
        };

        let mut proposals = vec![
            Proposal {
                title: "Extend the existing implementation".to_string(),
                description: format!(
                    "Modify {anchor} in place so the {} change stays next to the code it touches.",
                    analysis.summary.query_type
                ),
                snippet: snippet.clone(),
            },
            Proposal {
                title: "Add a dedicated method".to_string(),
                description: format!(
                    "Introduce a new method alongside {home} and leave existing callers untouched."
                ),
                snippet: snippet.clone(),
            },
        ];

        if analysis.complexity.label == ComplexityLevel::High
            || analysis.has_risk(RiskKind::HighFanIn)
        {
            proposals.push(Proposal {
                title: "Refactor before changing".to_string(),
                description: format!(
                    "Complexity is {} with {} risk(s); split {anchor} first, then apply the change.",
                    analysis.complexity.label,
                    analysis.risks.len()
                ),
                snippet,
            });
        }

        tracing::debug!(stage = "proposals", count = proposals.len(), "proposals generated");
        proposals
    }

    pub fn request_validation(
        &self,
        interaction: &dyn Interaction,
        proposals: &[Proposal],
    ) -> io::Result<Validation> {
        let validation = interaction.request_validation(proposals)?;
        match validation.selected {
            Some(i) if validation.approved && i < proposals.len() => Ok(validation),
            _ => Ok(Validation::decline()),
        }
    }

    pub fn get_selected_proposal(
        &self,
        proposals: &[Proposal],
        validation: &Validation,
    ) -> Option<Proposal> {
        if !validation.approved {
            return None;
        }
        validation.selected.and_then(|i| proposals.get(i)).cloned()
    }
}

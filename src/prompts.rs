//! Prompt assembly.
//!
//! The section order is fixed: context, relevant methods, analysis, chosen
//! approach, query. Token budgeting downstream assumes it.

use std::fmt::Write as _;

use crate::analysis::Analysis;
use crate::extract::ExtractedMethod;
use crate::preprocess::PreprocessedQuery;
use crate::proposals::Proposal;
use crate::retrieval::{detect_query_category, SearchSession};

/// Characters per token for [`estimate_tokens`]. An approximation, not a
/// tokenizer.
pub const TOKEN_DIVISOR: usize = 4;

/// Width of the dry-run frame.
pub const BOX_WIDTH: usize = 80;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a senior software engineer answering a question \
about an existing codebase. The user message contains the relevant methods, an analysis of the \
request and, when one was chosen, the preferred approach. Ground every statement in the code \
shown. When you propose changes, show the modified code and name the file it belongs to. \
If the provided context is insufficient, say what is missing instead of guessing.";

pub const CONTEXT_HEADING: &str = "## Context";
pub const METHODS_HEADING: &str = "## Relevant Methods";
pub const ANALYSIS_HEADING: &str = "## Analysis";
pub const APPROACH_HEADING: &str = "## Chosen Approach";
pub const QUERY_HEADING: &str = "## Query";

/// `ceil(chars / TOKEN_DIVISOR)`.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(TOKEN_DIVISOR)
}

/// Assemble the user prompt. Deterministic; `query` is copied verbatim into
/// the final section.
pub fn build_optimized_prompt(
    query: &str,
    preprocessed: &PreprocessedQuery,
    analysis: &Analysis,
    proposal: Option<&Proposal>,
    extracted: &[ExtractedMethod],
    session: &SearchSession,
) -> String {
    let mut sections = vec![render_context(preprocessed, session, extracted.len())];
    if !extracted.is_empty() {
        sections.push(render_methods(extracted));
    }
    sections.push(render_analysis(analysis));
    if let Some(proposal) = proposal {
        sections.push(render_approach(proposal));
    }
    sections.push(format!("{QUERY_HEADING}\n{query}"));
    sections.join("\n\n")
}

fn render_context(
    preprocessed: &PreprocessedQuery,
    session: &SearchSession,
    extracted: usize,
) -> String {
    let category = detect_query_category(&preprocessed.cleaned).unwrap_or("none");
    let terms = if preprocessed.detected_terms.is_empty() {
        "none".to_string()
    } else {
        preprocessed
            .detected_terms
            .iter()
            .map(|t| t.term.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    };
    format!(
        "{CONTEXT_HEADING}\n- Category: {category}\n- Domain terms: {terms}\n- Candidates: {} ranked, {extracted} extracted",
        session.len()
    )
}

fn render_methods(extracted: &[ExtractedMethod]) -> String {
    let mut out = String::from(METHODS_HEADING);
    for method in extracted {
        let _ = write!(out, "\n\n### {}\n- File: {}", method.key, method.file);
        if let Some(class) = &method.class {
            let _ = write!(out, "\n- Class: {class}");
        }
        let _ = write!(out, "\n- Role: {}", or_none(&method.role));
        let _ = write!(out, "\n- Description: {}", or_none(&method.description));

        let effects = method
            .effects
            .iter()
            .map(|(kind, targets)| {
                if targets.is_empty() {
                    kind.clone()
                } else {
                    format!("{kind} ({})", targets.join(", "))
                }
            })
            .collect::<Vec<_>>()
            .join("; ");
        let _ = write!(out, "\n- Effects: {}", or_none(&effects));
        let _ = write!(out, "\n- Consumers: {}", or_none(&method.consumers.join(", ")));

        let fence = fence_for(&method.code);
        let _ = write!(out, "\n\n{fence}\n{}\n{fence}", method.code.trim_end());
    }
    out
}

fn render_analysis(analysis: &Analysis) -> String {
    let mut out = format!(
        "{ANALYSIS_HEADING}\n- Type: {}\n- Complexity: {}",
        analysis.summary.query_type, analysis.complexity.label
    );
    if analysis.risks.is_empty() {
        out.push_str("\n- Risks: none");
    } else {
        out.push_str("\n- Risks:");
        for risk in &analysis.risks {
            let _ = write!(out, "\n  - {}", risk.description);
        }
    }
    out
}

fn render_approach(proposal: &Proposal) -> String {
    let mut out = format!(
        "{APPROACH_HEADING}\n**{}**\n{}",
        proposal.title, proposal.description
    );
    if let Some(snippet) = &proposal.snippet {
        let fence = fence_for(snippet);
        let _ = write!(out, "\n\n{fence}\n{snippet}\n{fence}");
    }
    out
}

fn or_none(s: &str) -> &str {
    if s.trim().is_empty() {
        "none"
    } else {
        s
    }
}

/// A backtick fence longer than any run inside `code`.
fn fence_for(code: &str) -> String {
    let mut longest = 0;
    let mut run = 0;
    for c in code.chars() {
        if c == '`' {
            run += 1;
            longest = longest.max(run);
        } else {
            run = 0;
        }
    }
    "`".repeat(longest.max(2) + 1)
}

/// Frame `text` in a box `width` columns wide, wrapping long lines by
/// character count.
pub fn frame_in_box(text: &str, width: usize) -> String {
    let width = width.max(5);
    let inner = width - 4;
    let mut out = String::new();
    let _ = writeln!(out, "┌{}┐", "─".repeat(width - 2));
    for line in text.replace('\t', "    ").lines() {
        let chars: Vec<char> = line.chars().collect();
        if chars.is_empty() {
            let _ = writeln!(out, "│ {} │", " ".repeat(inner));
            continue;
        }
        for chunk in chars.chunks(inner) {
            let segment: String = chunk.iter().collect();
            let pad = inner - chunk.len();
            let _ = writeln!(out, "│ {segment}{} │", " ".repeat(pad));
        }
    }
    let _ = write!(out, "└{}┘", "─".repeat(width - 2));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
        assert_eq!(estimate_tokens(&"x".repeat(401)), 101);
    }

    #[test]
    fn fence_outgrows_backticks_in_code() {
        assert_eq!(fence_for("fn a() {}"), "```");
        assert_eq!(fence_for("let s = \"````\";"), "`````");
    }

    #[test]
    fn box_lines_have_fixed_width() {
        let framed = frame_in_box(&format!("short\n\n{}", "y".repeat(100)), 20);
        for line in framed.lines() {
            assert_eq!(line.chars().count(), 20, "line: {line}");
        }
        // 100 chars over a 16-wide interior: 7 lines, plus "short", blank, and borders.
        assert_eq!(framed.lines().count(), 11);
    }
}

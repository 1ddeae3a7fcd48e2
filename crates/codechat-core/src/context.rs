//! Renders ranked retrieval results into the context block handed to the
//! language model.
//!
//! Nodes are grouped by kind (files, classes, functions) and keep their
//! rank order inside each group. When the block would exceed the character
//! budget, whole nodes are dropped from the bottom of the ranking until it
//! fits.

use std::fmt::Write as _;

use codechat_index::{NodeKind, RetrievalResult};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextLimits {
    /// Budget for the whole block, in characters.
    pub max_chars: usize,
    pub summary_chars: usize,
    pub code_chars: usize,
}

impl Default for ContextLimits {
    fn default() -> Self {
        Self {
            max_chars: 6000,
            summary_chars: 300,
            code_chars: 500,
        }
    }
}

/// Shape of what made it into the context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextStats {
    pub total: usize,
    pub files: usize,
    pub classes: usize,
    pub functions: usize,
    pub min_score: f32,
    pub max_score: f32,
    pub avg_score: f32,
    /// Nodes left out to respect the budget.
    pub dropped: usize,
}

#[derive(Debug, Clone)]
pub struct BuiltContext {
    pub text: String,
    pub stats: ContextStats,
}

const GROUPS: [(NodeKind, &str); 3] = [
    (NodeKind::File, "Files"),
    (NodeKind::Class, "Classes"),
    (NodeKind::Function, "Functions"),
];

pub struct ContextBuilder {
    limits: ContextLimits,
}

impl ContextBuilder {
    pub fn new(limits: ContextLimits) -> Self {
        Self { limits }
    }

    /// `results` must be in rank order.
    pub fn build(&self, results: &[RetrievalResult]) -> BuiltContext {
        let blocks: Vec<String> = results.iter().map(|r| self.format_node(r)).collect();

        let mut kept = results.len();
        let mut text = render(results, &blocks, kept);
        while kept > 0 && text.chars().count() > self.limits.max_chars {
            kept -= 1;
            text = render(results, &blocks, kept);
        }

        BuiltContext {
            stats: stats(&results[..kept], results.len() - kept),
            text,
        }
    }

    fn format_node(&self, result: &RetrievalResult) -> String {
        let node = &result.node;
        let mut block = format!("[{}] {} (line {})\n", node.kind, node.name, node.lineno);

        match node.summary.as_deref().filter(|s| !s.trim().is_empty()) {
            Some(summary) => {
                let _ = writeln!(
                    block,
                    "  Summary: {}",
                    truncate_chars(summary.trim(), self.limits.summary_chars)
                );
            }
            None if !node.code.trim().is_empty() => {
                let _ = writeln!(
                    block,
                    "  Code:\n{}",
                    indent(&truncate_chars(node.code.trim_end(), self.limits.code_chars))
                );
            }
            None => block.push_str("  Summary: (none)\n"),
        }

        if node.kind != NodeKind::File && !node.parameters.is_empty() {
            let _ = writeln!(block, "  Parameters: {}", node.parameters.join(", "));
        }

        let _ = writeln!(
            block,
            "  Relevance: {:.3} ({})",
            result.score, result.source
        );
        block
    }
}

fn render(results: &[RetrievalResult], blocks: &[String], kept: usize) -> String {
    let mut text = String::new();
    for (kind, heading) in GROUPS {
        let members: Vec<&String> = results[..kept]
            .iter()
            .zip(blocks)
            .filter(|(r, _)| r.node.kind == kind)
            .map(|(_, b)| b)
            .collect();
        if members.is_empty() {
            continue;
        }
        if !text.is_empty() {
            text.push('\n');
        }
        let _ = writeln!(text, "## {} ({})", heading, members.len());
        for block in members {
            text.push_str(block);
        }
    }
    text
}

fn stats(included: &[RetrievalResult], dropped: usize) -> ContextStats {
    let count = |kind| included.iter().filter(|r| r.node.kind == kind).count();
    let scores = included.iter().map(|r| r.score);
    let (min_score, max_score, avg_score) = if included.is_empty() {
        (0.0, 0.0, 0.0)
    } else {
        (
            scores.clone().fold(f32::INFINITY, f32::min),
            scores.clone().fold(f32::NEG_INFINITY, f32::max),
            scores.sum::<f32>() / included.len() as f32,
        )
    };

    ContextStats {
        total: included.len(),
        files: count(NodeKind::File),
        classes: count(NodeKind::Class),
        functions: count(NodeKind::Function),
        min_score,
        max_score,
        avg_score,
        dropped,
    }
}

/// First `max` characters, with an ellipsis when something was cut.
pub(crate) fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

fn indent(text: &str) -> String {
    text.lines()
        .map(|line| format!("    {line}"))
        .collect::<Vec<_>>()
        .join("\n")
}

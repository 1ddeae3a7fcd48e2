//! Query analysis: intent classification, keyword extraction and
//! multi-part detection.
//!
//! Analysis is pure and never fails; an unrecognised question is simply
//! `General` with whatever keywords survive filtering.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Intent of a question, used to pick the prompt template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryType {
    Overview,
    Functionality,
    Architecture,
    Implementation,
    Relationships,
    Comparison,
    Debugging,
    General,
}

impl QueryType {
    pub fn label(&self) -> &'static str {
        match self {
            QueryType::Overview => "overview",
            QueryType::Functionality => "functionality",
            QueryType::Architecture => "architecture",
            QueryType::Implementation => "implementation",
            QueryType::Relationships => "relationships",
            QueryType::Comparison => "comparison",
            QueryType::Debugging => "debugging",
            QueryType::General => "general",
        }
    }
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Phrase families in priority order; the first family with a hit wins.
const PHRASE_TABLE: &[(QueryType, &[&str])] = &[
    (QueryType::Overview, &["what is", "explain", "describe"]),
    (QueryType::Functionality, &["how does", "purpose", "what does"]),
    (QueryType::Architecture, &["structure", "design", "components"]),
    (QueryType::Implementation, &["how to", "example", "usage"]),
    (QueryType::Relationships, &["related", "connects", "calls"]),
    (QueryType::Comparison, &["difference", "compare", "vs"]),
    (QueryType::Debugging, &["bug", "error", "issue", "fix"]),
];

const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "is", "are", "in", "on", "at", "to", "for", "of", "this",
    "that", "what", "how", "does", "do", "did", "can", "could", "would", "should", "will",
    "with", "from", "into", "about", "which", "where", "when", "why", "who", "whom", "whose",
    "there", "their", "them", "they", "its", "it's", "has", "have", "had", "was", "were",
    "been", "be", "being", "than", "then", "also", "all", "any", "some",
];

const MIN_KEYWORD_LEN: usize = 3;

/// Outcome of analysing one question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryAnalysis {
    pub query_type: QueryType,
    pub keywords: BTreeSet<String>,
    pub is_multi_part: bool,
}

impl QueryAnalysis {
    /// Result budget for a requested `top_k`: doubled for multi-part questions.
    pub fn effective_top_k(&self, top_k: usize) -> usize {
        if self.is_multi_part {
            top_k.saturating_mul(2)
        } else {
            top_k
        }
    }
}

/// Lower-cased word tokens. Apostrophes stay inside words so "it's" is
/// one token; underscores stay so identifiers survive intact.
fn tokenize(query: &str) -> Vec<String> {
    query
        .to_lowercase()
        .split(|c: char| !(c.is_alphanumeric() || c == '_' || c == '\''))
        .map(|t| t.trim_matches('\''))
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Shorter single-word phrases must match a whole token ("vs" is not
/// "canvas"); longer ones also match inflections ("errors", "designed").
const MIN_PREFIX_PHRASE_LEN: usize = 3;

fn phrase_matches(tokens: &[String], padded: &str, phrase: &str) -> bool {
    if phrase.contains(' ') {
        return padded.contains(&format!(" {phrase} "));
    }
    if phrase.len() < MIN_PREFIX_PHRASE_LEN {
        return tokens.iter().any(|t| t == phrase);
    }
    tokens.iter().any(|t| t.starts_with(phrase))
}

fn classify(tokens: &[String]) -> QueryType {
    let padded = format!(" {} ", tokens.join(" "));
    PHRASE_TABLE
        .iter()
        .find(|(_, phrases)| phrases.iter().any(|p| phrase_matches(tokens, &padded, p)))
        .map(|(query_type, _)| *query_type)
        .unwrap_or(QueryType::General)
}

pub fn analyze(query: &str) -> QueryAnalysis {
    let tokens = tokenize(query);

    let keywords = tokens
        .iter()
        .filter(|t| t.chars().count() >= MIN_KEYWORD_LEN && !STOP_WORDS.contains(&t.as_str()))
        .cloned()
        .collect();

    let is_multi_part = tokens.iter().any(|t| t == "and" || t == "also")
        || query.matches('?').count() >= 2;

    QueryAnalysis {
        query_type: classify(&tokens),
        keywords,
        is_multi_part,
    }
}

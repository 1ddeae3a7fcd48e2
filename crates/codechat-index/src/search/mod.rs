//! Retrieval strategies.
//!
//! Three independent strategies (summary embeddings, code embeddings and
//! graph keyword matching) each score candidates on their own scale. The
//! fourth, relationship expansion, runs on the merged output of the others.
//! Fusion across strategies happens in [`crate::retriever`].

pub mod embedding;
pub mod expansion;
pub mod keyword;

pub use embedding::EmbeddingStrategy;
pub use expansion::RelationshipExpansion;
pub use keyword::KeywordStrategy;

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::graph::{CodeNode, NodeKey};
use crate::store::StoreError;

/// Strategy that produced (or confirmed) a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Semantic,
    CodeEmbedding,
    Keyword,
    Relationship,
    /// Found by more than one strategy.
    Hybrid,
}

impl StrategyKind {
    pub fn label(&self) -> &'static str {
        match self {
            StrategyKind::Semantic => "semantic",
            StrategyKind::CodeEmbedding => "code_embedding",
            StrategyKind::Keyword => "keyword",
            StrategyKind::Relationship => "relationship",
            StrategyKind::Hybrid => "hybrid",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A scored node.
#[derive(Debug, Clone)]
pub struct RetrievalResult {
    pub node: Arc<CodeNode>,
    /// Strategy-local score, or the fused score once merged.
    pub score: f32,
    pub source: StrategyKind,
    /// Hops from the owning file; used for tie-breaking.
    pub depth: usize,
}

impl RetrievalResult {
    pub fn key(&self) -> NodeKey {
        self.node.key()
    }
}

/// Total order used for every ranked list: score descending, then
/// shallower nodes, shorter names, name, line number, and finally the
/// remaining key fields so equal-looking nodes never swap between runs.
pub fn rank_order(a: &RetrievalResult, b: &RetrievalResult) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then(a.depth.cmp(&b.depth))
        .then(a.node.name.len().cmp(&b.node.name.len()))
        .then_with(|| a.node.name.cmp(&b.node.name))
        .then(a.node.lineno.cmp(&b.node.lineno))
        .then_with(|| a.node.repository.cmp(&b.node.repository))
        .then(a.node.kind.cmp(&b.node.kind))
}

pub fn sort_ranked(results: &mut [RetrievalResult]) {
    results.sort_by(rank_order);
}

/// What an independent strategy gets to work with.
#[derive(Debug, Clone, Copy)]
pub struct StrategyInput<'a> {
    pub query: &'a str,
    pub keywords: &'a BTreeSet<String>,
    /// Candidate budget for this strategy.
    pub limit: usize,
    pub repository: Option<&'a str>,
}

#[derive(Error, Debug)]
pub enum StrategyError {
    #[error("embedding service unavailable: {0}")]
    Embedding(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("query embedding has {found} dimensions, expected {expected}")]
    DimensionMismatch { expected: usize, found: usize },
}

#[async_trait]
pub trait Strategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Candidates for the query, best first, scored on this strategy's scale.
    async fn retrieve(
        &self,
        input: &StrategyInput<'_>,
    ) -> Result<Vec<RetrievalResult>, StrategyError>;
}

//! Graph store contract and the in-memory implementation.
//!
//! The engine only reads the graph: nearest-neighbour search over one of
//! the two embedding fields, keyword matching over names and summaries,
//! and one-hop structural neighbours.

use std::cmp::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::graph::{CodeNode, GraphSnapshot, NodeKey, NodeKind, RepositoryGraph};

/// Which stored vector a search compares against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EmbeddingField {
    Summary,
    Code,
}

impl EmbeddingField {
    fn of<'a>(&self, node: &'a CodeNode) -> Option<&'a [f32]> {
        match self {
            EmbeddingField::Summary => node.summary_embedding.as_deref(),
            EmbeddingField::Code => node.code_embedding.as_deref(),
        }
    }
}

/// A node together with its depth in the hierarchy.
#[derive(Debug, Clone)]
pub struct NodeRef {
    pub node: Arc<CodeNode>,
    pub depth: usize,
}

/// Result of a vector search.
#[derive(Debug, Clone)]
pub struct StoreHit {
    pub node: Arc<CodeNode>,
    pub depth: usize,
    /// Cosine similarity to the query vector.
    pub score: f32,
}

/// Result of a keyword search.
#[derive(Debug, Clone)]
pub struct KeywordHit {
    pub node: Arc<CodeNode>,
    pub depth: usize,
    /// Number of distinct keywords found in the name or summary.
    pub matched: usize,
}

/// One-hop structural neighbours of a node.
#[derive(Debug, Clone, Default)]
pub struct Neighbors {
    pub parent: Option<NodeRef>,
    pub children: Vec<NodeRef>,
}

/// Node counts for one repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepositorySummary {
    pub name: String,
    pub files: usize,
    pub classes: usize,
    pub functions: usize,
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("graph store unavailable: {0}")]
    Unavailable(String),

    #[error("node not found: {0}")]
    NotFound(NodeKey),

    #[error("query vector has {found} dimensions, index expects {expected}")]
    DimensionMismatch { expected: usize, found: usize },
}

/// Read access to the code knowledge graph.
///
/// A `repository` filter of `Some(name)` must never yield nodes from any
/// other repository.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Nearest nodes by cosine similarity over `field`, best first.
    /// Nodes without a vector in `field` are skipped.
    async fn vector_search(
        &self,
        field: EmbeddingField,
        vector: &[f32],
        limit: usize,
        repository: Option<&str>,
    ) -> Result<Vec<StoreHit>, StoreError>;

    /// Nodes whose name or summary contains at least one keyword
    /// (case-insensitive substring), most matches first.
    async fn keyword_search(
        &self,
        keywords: &[String],
        limit: usize,
        repository: Option<&str>,
    ) -> Result<Vec<KeywordHit>, StoreError>;

    async fn neighbors(&self, key: &NodeKey) -> Result<Neighbors, StoreError>;

    async fn repositories(&self) -> Result<Vec<RepositorySummary>, StoreError>;
}

/// Cosine similarity. `None` when the lengths differ or either vector is zero.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return None;
    }
    Some(dot / (norm_a.sqrt() * norm_b.sqrt()))
}

/// `GraphStore` over a loaded [`GraphSnapshot`].
pub struct InMemoryGraphStore {
    snapshot: Arc<GraphSnapshot>,
    dimensions: Option<usize>,
}

impl InMemoryGraphStore {
    pub fn new(snapshot: GraphSnapshot) -> Self {
        Self {
            snapshot: Arc::new(snapshot),
            dimensions: None,
        }
    }

    /// Reject query vectors of any other length.
    pub fn with_dimensions(mut self, dimensions: usize) -> Self {
        self.dimensions = Some(dimensions);
        self
    }

    fn scoped<'a>(
        &'a self,
        repository: Option<&'a str>,
    ) -> impl Iterator<Item = &'a RepositoryGraph> + 'a {
        self.snapshot
            .repositories()
            .iter()
            .filter(move |r| repository.map_or(true, |name| r.name() == name))
    }

    fn node_ref(repo: &RepositoryGraph, id: usize) -> Option<NodeRef> {
        Some(NodeRef {
            node: repo.node(id)?.clone(),
            depth: repo.depth(id)?,
        })
    }
}

fn by_key(a: &CodeNode, b: &CodeNode) -> Ordering {
    a.repository
        .cmp(&b.repository)
        .then(a.kind.cmp(&b.kind))
        .then(a.name.cmp(&b.name))
        .then(a.lineno.cmp(&b.lineno))
}

#[async_trait]
impl GraphStore for InMemoryGraphStore {
    async fn vector_search(
        &self,
        field: EmbeddingField,
        vector: &[f32],
        limit: usize,
        repository: Option<&str>,
    ) -> Result<Vec<StoreHit>, StoreError> {
        if let Some(expected) = self.dimensions {
            if vector.len() != expected {
                return Err(StoreError::DimensionMismatch {
                    expected,
                    found: vector.len(),
                });
            }
        }

        let mut skipped = 0usize;
        let mut hits = Vec::new();
        for repo in self.scoped(repository) {
            for (id, node) in repo.iter() {
                let Some(stored) = field.of(node) else {
                    continue;
                };
                match cosine_similarity(vector, stored) {
                    Some(score) => hits.push(StoreHit {
                        node: node.clone(),
                        depth: repo.depth(id).unwrap_or(0),
                        score,
                    }),
                    None => skipped += 1,
                }
            }
        }
        if skipped > 0 {
            warn!(skipped, ?field, "Skipped stored vectors with mismatched dimensions");
        }

        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| by_key(&a.node, &b.node))
        });
        hits.truncate(limit);
        debug!(?field, hits = hits.len(), "Vector search complete");
        Ok(hits)
    }

    async fn keyword_search(
        &self,
        keywords: &[String],
        limit: usize,
        repository: Option<&str>,
    ) -> Result<Vec<KeywordHit>, StoreError> {
        let needles: Vec<String> = keywords.iter().map(|k| k.to_lowercase()).collect();
        let mut hits = Vec::new();
        for repo in self.scoped(repository) {
            for (id, node) in repo.iter() {
                let name = node.name.to_lowercase();
                let summary = node.summary.as_deref().unwrap_or("").to_lowercase();
                let matched = needles
                    .iter()
                    .filter(|k| name.contains(k.as_str()) || summary.contains(k.as_str()))
                    .count();
                if matched > 0 {
                    hits.push(KeywordHit {
                        node: node.clone(),
                        depth: repo.depth(id).unwrap_or(0),
                        matched,
                    });
                }
            }
        }

        hits.sort_by(|a, b| {
            b.matched
                .cmp(&a.matched)
                .then_with(|| by_key(&a.node, &b.node))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    async fn neighbors(&self, key: &NodeKey) -> Result<Neighbors, StoreError> {
        let repo = self
            .snapshot
            .repository(&key.repository)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        let id = repo
            .find(key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;

        Ok(Neighbors {
            parent: repo.parent(id).and_then(|p| Self::node_ref(repo, p)),
            children: repo
                .children(id)
                .iter()
                .filter_map(|&c| Self::node_ref(repo, c))
                .collect(),
        })
    }

    async fn repositories(&self) -> Result<Vec<RepositorySummary>, StoreError> {
        Ok(self
            .snapshot
            .repositories()
            .iter()
            .map(|r| RepositorySummary {
                name: r.name().to_string(),
                files: r.count(NodeKind::File),
                classes: r.count(NodeKind::Class),
                functions: r.count(NodeKind::Function),
            })
            .collect())
    }
}

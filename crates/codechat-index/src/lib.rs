//! Retrieval over a code knowledge graph for CodeChat.
//!
//! This crate provides:
//! - The graph data model (files, classes, functions in a per-repository arena)
//! - The read-only graph store contract and an in-memory implementation
//! - Query embedding via any OpenAI-compatible embeddings endpoint
//! - Query analysis (intent, keywords, multi-part detection)
//! - Semantic, code-embedding, keyword and relationship-expansion strategies
//! - Weighted additive fusion with deterministic ranking

pub mod analyzer;
pub mod embeddings;
pub mod graph;
pub mod retriever;
pub mod search;
pub mod store;

// Re-exports
pub use analyzer::{analyze, QueryAnalysis, QueryType};
pub use embeddings::{EmbeddingError, EmbeddingProvider, HttpEmbeddings};
pub use graph::{CodeNode, GraphError, GraphSnapshot, NodeId, NodeKey, NodeKind, RepositoryGraph};
pub use retriever::{FusionWeights, RetrievalOutcome, Retriever, RetrieverConfig};
pub use search::{
    rank_order, EmbeddingStrategy, KeywordStrategy, RelationshipExpansion, RetrievalResult,
    Strategy, StrategyError, StrategyInput, StrategyKind,
};
pub use store::{
    cosine_similarity, EmbeddingField, GraphStore, InMemoryGraphStore, KeywordHit, Neighbors,
    NodeRef, RepositorySummary, StoreError, StoreHit,
};

/// Default number of results per query.
pub const DEFAULT_TOP_K: usize = 5;

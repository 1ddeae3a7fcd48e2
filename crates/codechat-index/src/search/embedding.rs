use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{RetrievalResult, Strategy, StrategyError, StrategyInput, StrategyKind};
use crate::embeddings::EmbeddingProvider;
use crate::store::{EmbeddingField, GraphStore};

/// Vector search over one of the stored embedding fields.
///
/// The semantic strategy compares the question against node summaries; the
/// code-embedding strategy compares it against the raw code vectors.
pub struct EmbeddingStrategy<E: EmbeddingProvider + ?Sized> {
    kind: StrategyKind,
    field: EmbeddingField,
    embeddings: Arc<E>,
    store: Arc<dyn GraphStore>,
    min_similarity: f32,
}

impl<E: EmbeddingProvider + ?Sized> EmbeddingStrategy<E> {
    pub fn semantic(embeddings: Arc<E>, store: Arc<dyn GraphStore>) -> Self {
        Self {
            kind: StrategyKind::Semantic,
            field: EmbeddingField::Summary,
            embeddings,
            store,
            min_similarity: 0.0,
        }
    }

    pub fn code(embeddings: Arc<E>, store: Arc<dyn GraphStore>) -> Self {
        Self {
            kind: StrategyKind::CodeEmbedding,
            field: EmbeddingField::Code,
            embeddings,
            store,
            min_similarity: 0.0,
        }
    }

    /// Drop hits whose similarity is not strictly above `min`.
    pub fn with_min_similarity(mut self, min: f32) -> Self {
        self.min_similarity = min;
        self
    }
}

#[async_trait]
impl<E: EmbeddingProvider + ?Sized> Strategy for EmbeddingStrategy<E> {
    fn kind(&self) -> StrategyKind {
        self.kind
    }

    async fn retrieve(
        &self,
        input: &StrategyInput<'_>,
    ) -> Result<Vec<RetrievalResult>, StrategyError> {
        let vector = self
            .embeddings
            .embed(input.query)
            .await
            .map_err(|e| StrategyError::Embedding(format!("{e:#}")))?;

        let expected = self.embeddings.dimensions();
        if vector.len() != expected {
            return Err(StrategyError::DimensionMismatch {
                expected,
                found: vector.len(),
            });
        }

        let hits = self
            .store
            .vector_search(self.field, &vector, input.limit, input.repository)
            .await?;

        let results: Vec<RetrievalResult> = hits
            .into_iter()
            .filter(|hit| hit.score > self.min_similarity)
            .map(|hit| RetrievalResult {
                node: hit.node,
                score: hit.score,
                source: self.kind,
                depth: hit.depth,
            })
            .collect();

        debug!(strategy = %self.kind, hits = results.len(), "Strategy complete");
        Ok(results)
    }
}

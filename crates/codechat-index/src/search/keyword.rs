use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{RetrievalResult, Strategy, StrategyError, StrategyInput, StrategyKind};
use crate::store::GraphStore;

/// Keyword matching over node names and summaries.
///
/// A node's score is the fraction of the query's keywords it contains.
pub struct KeywordStrategy {
    store: Arc<dyn GraphStore>,
}

impl KeywordStrategy {
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Strategy for KeywordStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Keyword
    }

    async fn retrieve(
        &self,
        input: &StrategyInput<'_>,
    ) -> Result<Vec<RetrievalResult>, StrategyError> {
        if input.keywords.is_empty() {
            return Ok(Vec::new());
        }

        let keywords: Vec<String> = input.keywords.iter().cloned().collect();
        let total = keywords.len() as f32;
        let hits = self
            .store
            .keyword_search(&keywords, input.limit, input.repository)
            .await?;

        let results: Vec<RetrievalResult> = hits
            .into_iter()
            .map(|hit| RetrievalResult {
                node: hit.node,
                score: hit.matched as f32 / total,
                source: StrategyKind::Keyword,
                depth: hit.depth,
            })
            .collect();

        debug!(keywords = keywords.len(), hits = results.len(), "Keyword strategy complete");
        Ok(results)
    }
}

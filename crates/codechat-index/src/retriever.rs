//! Retrieval orchestration and score fusion.
//!
//! The three independent strategies run concurrently. Their scores are
//! weighted and summed per node, so a node confirmed by several strategies
//! ranks above one found by a single strategy. Relationship expansion then
//! adds structural neighbours of the merged candidates, and the final list
//! is ranked with a total order and cut to the result budget.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::analyzer::QueryAnalysis;
use crate::embeddings::EmbeddingProvider;
use crate::graph::NodeKey;
use crate::search::{
    sort_ranked, EmbeddingStrategy, KeywordStrategy, RelationshipExpansion, RetrievalResult,
    Strategy, StrategyInput, StrategyKind,
};
use crate::store::GraphStore;

/// Per-strategy weights and expansion decays.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusionWeights {
    pub semantic_weight: f32,
    pub keyword_weight: f32,
    pub code_weight: f32,
    pub child_decay: f32,
    pub parent_decay: f32,
}

impl Default for FusionWeights {
    fn default() -> Self {
        Self {
            semantic_weight: 1.0,
            keyword_weight: 0.6,
            code_weight: 0.4,
            child_decay: 0.8,
            parent_decay: 0.7,
        }
    }
}

impl FusionWeights {
    pub fn weight_for(&self, kind: StrategyKind) -> f32 {
        match kind {
            StrategyKind::Semantic => self.semantic_weight,
            StrategyKind::Keyword => self.keyword_weight,
            StrategyKind::CodeEmbedding => self.code_weight,
            // Expansion scores already carry their decay.
            StrategyKind::Relationship | StrategyKind::Hybrid => 1.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetrieverConfig {
    pub weights: FusionWeights,
    /// Each strategy is asked for `effective_top_k * candidate_multiplier`.
    pub candidate_multiplier: usize,
    pub expansion_enabled: bool,
    /// Embedding hits at or below this similarity are discarded.
    pub min_similarity: f32,
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        Self {
            weights: FusionWeights::default(),
            candidate_multiplier: 2,
            expansion_enabled: true,
            min_similarity: 0.0,
        }
    }
}

/// Ranked results plus which strategies could not contribute.
#[derive(Debug, Clone, Default)]
pub struct RetrievalOutcome {
    pub results: Vec<RetrievalResult>,
    pub degraded: Vec<StrategyKind>,
    /// Every strategy that was attempted failed.
    pub all_failed: bool,
}

/// Additive accumulator keyed by node identity.
#[derive(Default)]
struct Fusion {
    entries: HashMap<NodeKey, RetrievalResult>,
}

impl Fusion {
    fn add(&mut self, results: Vec<RetrievalResult>, weight: f32) {
        for result in results {
            let contribution = result.score * weight;
            self.entries
                .entry(result.key())
                .and_modify(|existing| {
                    existing.score += contribution;
                    if existing.source != result.source {
                        existing.source = StrategyKind::Hybrid;
                    }
                })
                .or_insert(RetrievalResult {
                    score: contribution,
                    ..result
                });
        }
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn ranked(&self) -> Vec<RetrievalResult> {
        let mut results: Vec<RetrievalResult> = self.entries.values().cloned().collect();
        sort_ranked(&mut results);
        results
    }
}

/// Runs the strategies for one query and fuses their output.
pub struct Retriever {
    semantic: Arc<dyn Strategy>,
    code: Arc<dyn Strategy>,
    keyword: Arc<dyn Strategy>,
    expansion: RelationshipExpansion,
    config: RetrieverConfig,
}

impl Retriever {
    /// Standard strategy set over one embedding provider and one store.
    pub fn new(
        embeddings: Arc<dyn EmbeddingProvider>,
        store: Arc<dyn GraphStore>,
        config: RetrieverConfig,
    ) -> Self {
        let semantic = EmbeddingStrategy::semantic(embeddings.clone(), store.clone())
            .with_min_similarity(config.min_similarity);
        let code = EmbeddingStrategy::code(embeddings, store.clone())
            .with_min_similarity(config.min_similarity);
        Self::from_strategies(
            Arc::new(semantic),
            Arc::new(code),
            Arc::new(KeywordStrategy::new(store.clone())),
            store,
            config,
        )
    }

    pub fn from_strategies(
        semantic: Arc<dyn Strategy>,
        code: Arc<dyn Strategy>,
        keyword: Arc<dyn Strategy>,
        store: Arc<dyn GraphStore>,
        config: RetrieverConfig,
    ) -> Self {
        let expansion = RelationshipExpansion::new(
            store,
            config.weights.child_decay,
            config.weights.parent_decay,
        );
        Self {
            semantic,
            code,
            keyword,
            expansion,
            config,
        }
    }

    pub async fn retrieve(
        &self,
        query: &str,
        analysis: &QueryAnalysis,
        top_k: usize,
        repository: Option<&str>,
    ) -> RetrievalOutcome {
        let effective_top_k = analysis.effective_top_k(top_k);
        let input = StrategyInput {
            query,
            keywords: &analysis.keywords,
            limit: effective_top_k.saturating_mul(self.config.candidate_multiplier),
            repository,
        };

        let (semantic, code, keyword) = tokio::join!(
            self.semantic.retrieve(&input),
            self.code.retrieve(&input),
            self.keyword.retrieve(&input),
        );

        let mut fusion = Fusion::default();
        let mut degraded = Vec::new();
        let mut attempted = 0;
        for (kind, outcome) in [
            (self.semantic.kind(), semantic),
            (self.code.kind(), code),
            (self.keyword.kind(), keyword),
        ] {
            attempted += 1;
            match outcome {
                Ok(results) => {
                    debug!(strategy = %kind, hits = results.len(), "Merging strategy results");
                    fusion.add(results, self.config.weights.weight_for(kind));
                }
                Err(e) => {
                    warn!(strategy = %kind, error = %e, "Retrieval strategy unavailable, continuing without it");
                    degraded.push(kind);
                }
            }
        }

        if self.config.expansion_enabled && !fusion.is_empty() {
            attempted += 1;
            let mut seeds = fusion.ranked();
            seeds.truncate(effective_top_k);
            match self.expansion.expand(&seeds).await {
                Ok(expanded) => fusion.add(expanded, 1.0),
                Err(e) => {
                    warn!(error = %e, "Relationship expansion unavailable, continuing without it");
                    degraded.push(StrategyKind::Relationship);
                }
            }
        }

        let mut results = fusion.ranked();
        if let Some(repo) = repository {
            results.retain(|r| r.node.repository == repo);
        }
        results.truncate(effective_top_k);

        RetrievalOutcome {
            all_failed: degraded.len() == attempted,
            results,
            degraded,
        }
    }
}

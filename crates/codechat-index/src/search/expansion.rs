use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use tracing::debug;

use super::{sort_ranked, RetrievalResult, StrategyError, StrategyKind};
use crate::graph::NodeKey;
use crate::store::{GraphStore, NodeRef, StoreError};

/// One-hop structural expansion around already retrieved nodes.
///
/// A child inherits `origin × child_decay`, the parent `origin ×
/// parent_decay`. When several origins reach the same neighbour it keeps
/// the best single contribution, so an expanded node never outranks the
/// node that introduced it.
pub struct RelationshipExpansion {
    store: Arc<dyn GraphStore>,
    child_decay: f32,
    parent_decay: f32,
}

impl RelationshipExpansion {
    pub fn new(store: Arc<dyn GraphStore>, child_decay: f32, parent_decay: f32) -> Self {
        Self {
            store,
            child_decay,
            parent_decay,
        }
    }

    pub async fn expand(
        &self,
        seeds: &[RetrievalResult],
    ) -> Result<Vec<RetrievalResult>, StrategyError> {
        let lookups = seeds.iter().map(|seed| async move {
            let key = seed.key();
            (seed.score, self.store.neighbors(&key).await, key)
        });

        let mut best: HashMap<NodeKey, RetrievalResult> = HashMap::new();
        let mut offer = |neighbor: NodeRef, score: f32| {
            let key = neighbor.node.key();
            let candidate = RetrievalResult {
                node: neighbor.node,
                score,
                source: StrategyKind::Relationship,
                depth: neighbor.depth,
            };
            match best.get(&key) {
                Some(existing) if existing.score >= score => {}
                _ => {
                    best.insert(key, candidate);
                }
            }
        };

        for (origin, lookup, key) in join_all(lookups).await {
            let neighbors = match lookup {
                Ok(neighbors) => neighbors,
                // The seed vanished between retrieval and expansion.
                Err(StoreError::NotFound(_)) => {
                    debug!(node = %key, "Expansion seed not found in graph");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            if let Some(parent) = neighbors.parent {
                offer(parent, origin * self.parent_decay);
            }
            for child in neighbors.children {
                offer(child, origin * self.child_decay);
            }
        }

        let mut results: Vec<RetrievalResult> = best.into_values().collect();
        sort_ranked(&mut results);
        debug!(seeds = seeds.len(), expanded = results.len(), "Relationship expansion complete");
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{CodeNode, GraphSnapshot, NodeKind, RepositoryGraph};
    use crate::store::InMemoryGraphStore;

    fn fixture() -> (Arc<dyn GraphStore>, Arc<CodeNode>, Arc<CodeNode>) {
        let mut repo = RepositoryGraph::new("r");
        let file = repo
            .add_node(CodeNode::new("r", NodeKind::File, "shapes.py", 0), None)
            .unwrap();
        let class = repo
            .add_node(CodeNode::new("r", NodeKind::Class, "Circle", 3), Some(file))
            .unwrap();
        let method = repo
            .add_node(CodeNode::new("r", NodeKind::Function, "area", 7), Some(class))
            .unwrap();
        let file_node = repo.node(file).unwrap().clone();
        let method_node = repo.node(method).unwrap().clone();
        let mut snapshot = GraphSnapshot::new();
        snapshot.add_repository(repo).unwrap();
        (
            Arc::new(InMemoryGraphStore::new(snapshot)),
            file_node,
            method_node,
        )
    }

    fn seed(node: Arc<CodeNode>, depth: usize, score: f32) -> RetrievalResult {
        RetrievalResult {
            node,
            score,
            source: StrategyKind::Semantic,
            depth,
        }
    }

    #[tokio::test]
    async fn test_decays_applied() {
        let (store, file, method) = fixture();
        let expansion = RelationshipExpansion::new(store, 0.8, 0.7);
        let results = expansion.expand(&[seed(method, 2, 1.0)]).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].node.name, "Circle");
        assert!((results[0].score - 0.7).abs() < 1e-6);
        assert_eq!(results[0].source, StrategyKind::Relationship);

        let (store, _, _) = fixture();
        let expansion = RelationshipExpansion::new(store, 0.8, 0.7);
        let results = expansion.expand(&[seed(file, 0, 0.5)]).await.unwrap();
        assert_eq!(results[0].node.name, "Circle");
        assert!((results[0].score - 0.4).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_shared_neighbour_keeps_best_contribution() {
        let (store, file, method) = fixture();
        let expansion = RelationshipExpansion::new(store, 0.8, 0.7);
        let results = expansion
            .expand(&[seed(file, 0, 0.9), seed(method, 2, 0.6)])
            .await
            .unwrap();
        let circle = results.iter().find(|r| r.node.name == "Circle").unwrap();
        assert!((circle.score - 0.72).abs() < 1e-6);
        assert!(results.iter().all(|r| r.score < 0.9));
    }

    #[tokio::test]
    async fn test_unknown_seed_is_skipped() {
        let (store, _, _) = fixture();
        let expansion = RelationshipExpansion::new(store, 0.8, 0.7);
        let ghost = Arc::new(CodeNode::new("r", NodeKind::Function, "ghost", 1));
        let results = expansion.expand(&[seed(ghost, 1, 1.0)]).await.unwrap();
        assert!(results.is_empty());
    }
}

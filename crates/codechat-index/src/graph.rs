//! Code knowledge graph: files, classes and functions of a repository.
//!
//! Each repository is stored as an arena. Nodes live in a `Vec` and the
//! structural hierarchy is kept as index vectors (`parents`, `children`),
//! so traversal never needs reference-counted back pointers.
//!
//! # Example
//!
//! ```
//! use codechat_index::graph::{CodeNode, NodeKind, RepositoryGraph};
//!
//! let mut repo = RepositoryGraph::new("acme/widgets");
//! let file = repo
//!     .add_node(CodeNode::new("acme/widgets", NodeKind::File, "app.py", 0), None)
//!     .unwrap();
//! let func = repo
//!     .add_node(CodeNode::new("acme/widgets", NodeKind::Function, "init", 3), Some(file))
//!     .unwrap();
//! assert_eq!(repo.depth(func), Some(1));
//! ```

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Index of a node inside its repository arena.
pub type NodeId = usize;

/// Kind of code entity stored in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NodeKind {
    File,
    Class,
    Function,
}

impl NodeKind {
    /// Display label, as used when citing nodes (`Kind: name`).
    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::File => "File",
            NodeKind::Class => "Class",
            NodeKind::Function => "Function",
        }
    }

    /// Whether nodes of this kind can own children.
    pub fn is_container(&self) -> bool {
        matches!(self, NodeKind::File | NodeKind::Class)
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A file, class or function extracted from a repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeNode {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    #[serde(default)]
    pub lineno: u32,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub parameters: Vec<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub code_embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub summary_embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub repository: String,
}

impl CodeNode {
    pub fn new(
        repository: impl Into<String>,
        kind: NodeKind,
        name: impl Into<String>,
        lineno: u32,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            lineno,
            code: String::new(),
            parameters: Vec::new(),
            summary: None,
            code_embedding: None,
            summary_embedding: None,
            repository: repository.into(),
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = code.into();
        self
    }

    pub fn with_parameters<I, S>(mut self, parameters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.parameters = parameters.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn with_summary_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.summary_embedding = Some(embedding);
        self
    }

    pub fn with_code_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.code_embedding = Some(embedding);
        self
    }

    /// Identity of this node across strategies.
    pub fn key(&self) -> NodeKey {
        NodeKey {
            repository: self.repository.clone(),
            kind: self.kind,
            name: self.name.clone(),
            lineno: self.lineno,
        }
    }
}

/// Identity of a node: `(repository, kind, name, lineno)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeKey {
    pub repository: String,
    pub kind: NodeKind,
    pub name: String,
    pub lineno: u32,
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}@{}",
            self.repository, self.kind, self.name, self.lineno
        )
    }
}

/// Errors raised while building or loading a graph.
#[derive(Error, Debug)]
pub enum GraphError {
    #[error("failed to read graph snapshot: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse graph snapshot: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("duplicate node {0}")]
    DuplicateNode(NodeKey),

    #[error("duplicate repository {0}")]
    DuplicateRepository(String),

    #[error("node {node} references unknown parent index {parent}")]
    UnknownParent { node: NodeKey, parent: NodeId },

    #[error("node {node} cannot be a child of a {parent_kind}")]
    InvalidParent { node: NodeKey, parent_kind: NodeKind },

    #[error("{0} has no parent")]
    MissingParent(NodeKey),

    #[error("file {0} cannot have a parent")]
    FileWithParent(NodeKey),

    #[error("node {node} belongs to repository '{found}', expected '{expected}'")]
    RepositoryMismatch {
        node: String,
        expected: String,
        found: String,
    },
}

/// Arena of the nodes of one repository.
#[derive(Debug, Clone, Default)]
pub struct RepositoryGraph {
    name: String,
    nodes: Vec<Arc<CodeNode>>,
    parents: Vec<Option<NodeId>>,
    children: Vec<Vec<NodeId>>,
    depths: Vec<usize>,
    index: HashMap<NodeKey, NodeId>,
}

impl RepositoryGraph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Add a node under `parent`.
    ///
    /// Parents must already be in the arena, which keeps the hierarchy
    /// acyclic. Files are roots; classes and functions hang off a file or
    /// a class. A node with an empty `repository` is adopted by this arena.
    pub fn add_node(
        &mut self,
        mut node: CodeNode,
        parent: Option<NodeId>,
    ) -> Result<NodeId, GraphError> {
        if node.repository.is_empty() {
            node.repository = self.name.clone();
        } else if node.repository != self.name {
            return Err(GraphError::RepositoryMismatch {
                node: node.name,
                expected: self.name.clone(),
                found: node.repository,
            });
        }

        let key = node.key();
        if self.index.contains_key(&key) {
            return Err(GraphError::DuplicateNode(key));
        }

        let depth = match (node.kind, parent) {
            (NodeKind::File, None) => 0,
            (NodeKind::File, Some(_)) => return Err(GraphError::FileWithParent(key)),
            (_, None) => return Err(GraphError::MissingParent(key)),
            (_, Some(parent_id)) => {
                let parent_node = self.nodes.get(parent_id).ok_or_else(|| {
                    GraphError::UnknownParent {
                        node: key.clone(),
                        parent: parent_id,
                    }
                })?;
                if !parent_node.kind.is_container() {
                    return Err(GraphError::InvalidParent {
                        node: key,
                        parent_kind: parent_node.kind,
                    });
                }
                self.depths[parent_id] + 1
            }
        };

        let id = self.nodes.len();
        self.nodes.push(Arc::new(node));
        self.parents.push(parent);
        self.children.push(Vec::new());
        self.depths.push(depth);
        self.index.insert(key, id);
        if let Some(parent_id) = parent {
            self.children[parent_id].push(id);
        }
        Ok(id)
    }

    pub fn node(&self, id: NodeId) -> Option<&Arc<CodeNode>> {
        self.nodes.get(id)
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.parents.get(id).copied().flatten()
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.children.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of parent hops to the owning file (files are depth 0).
    pub fn depth(&self, id: NodeId) -> Option<usize> {
        self.depths.get(id).copied()
    }

    pub fn find(&self, key: &NodeKey) -> Option<NodeId> {
        self.index.get(key).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Arc<CodeNode>)> {
        self.nodes.iter().enumerate()
    }

    /// Number of nodes of the given kind.
    pub fn count(&self, kind: NodeKind) -> usize {
        self.nodes.iter().filter(|n| n.kind == kind).count()
    }
}

/// On-disk form of a node: the node itself plus its parent's position.
#[derive(Serialize, Deserialize)]
struct SnapshotNode {
    #[serde(flatten)]
    node: CodeNode,
    #[serde(default)]
    parent: Option<NodeId>,
}

#[derive(Serialize, Deserialize)]
struct SnapshotRepository {
    name: String,
    #[serde(default)]
    nodes: Vec<SnapshotNode>,
}

#[derive(Serialize, Deserialize)]
struct SnapshotFile {
    #[serde(default)]
    repositories: Vec<SnapshotRepository>,
}

/// All repositories known to the engine.
#[derive(Debug, Clone, Default)]
pub struct GraphSnapshot {
    repositories: Vec<RepositoryGraph>,
}

impl GraphSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_repository(&mut self, repository: RepositoryGraph) -> Result<(), GraphError> {
        if self.repository(repository.name()).is_some() {
            return Err(GraphError::DuplicateRepository(repository.name.clone()));
        }
        self.repositories.push(repository);
        Ok(())
    }

    pub fn repository(&self, name: &str) -> Option<&RepositoryGraph> {
        self.repositories.iter().find(|r| r.name == name)
    }

    pub fn repositories(&self) -> &[RepositoryGraph] {
        &self.repositories
    }

    /// Parse a JSON snapshot.
    ///
    /// Nodes must be listed after their parent; `parent` is the position of
    /// the parent within the same repository's `nodes` list.
    pub fn from_json(json: &str) -> Result<Self, GraphError> {
        let file: SnapshotFile = serde_json::from_str(json)?;
        let mut snapshot = Self::new();
        for repo in file.repositories {
            let mut graph = RepositoryGraph::new(repo.name);
            for entry in repo.nodes {
                graph.add_node(entry.node, entry.parent)?;
            }
            snapshot.add_repository(graph)?;
        }
        Ok(snapshot)
    }

    pub fn load(path: &Path) -> Result<Self, GraphError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn to_json(&self) -> Result<String, GraphError> {
        let file = SnapshotFile {
            repositories: self
                .repositories
                .iter()
                .map(|repo| SnapshotRepository {
                    name: repo.name.clone(),
                    nodes: repo
                        .iter()
                        .map(|(id, node)| SnapshotNode {
                            node: node.as_ref().clone(),
                            parent: repo.parent(id),
                        })
                        .collect(),
                })
                .collect(),
        };
        Ok(serde_json::to_string_pretty(&file)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_repo() -> RepositoryGraph {
        let mut repo = RepositoryGraph::new("demo");
        let file = repo
            .add_node(CodeNode::new("demo", NodeKind::File, "main.py", 0), None)
            .unwrap();
        let class = repo
            .add_node(CodeNode::new("demo", NodeKind::Class, "Server", 4), Some(file))
            .unwrap();
        repo.add_node(
            CodeNode::new("demo", NodeKind::Function, "start", 8).with_parameters(["self"]),
            Some(class),
        )
        .unwrap();
        repo
    }

    #[test]
    fn test_depth_and_children() {
        let repo = sample_repo();
        assert_eq!(repo.len(), 3);
        assert_eq!(repo.depth(0), Some(0));
        assert_eq!(repo.depth(1), Some(1));
        assert_eq!(repo.depth(2), Some(2));
        assert_eq!(repo.children(0), &[1]);
        assert_eq!(repo.parent(2), Some(1));
        assert_eq!(repo.parent(0), None);
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let mut repo = sample_repo();
        let err = repo
            .add_node(CodeNode::new("demo", NodeKind::Class, "Server", 4), Some(0))
            .unwrap_err();
        assert!(matches!(err, GraphError::DuplicateNode(_)));
    }

    #[test]
    fn test_same_name_different_line_is_distinct() {
        let mut repo = sample_repo();
        assert!(repo
            .add_node(CodeNode::new("demo", NodeKind::Class, "Server", 40), Some(0))
            .is_ok());
    }

    #[test]
    fn test_structural_rules() {
        let mut repo = sample_repo();
        assert!(matches!(
            repo.add_node(CodeNode::new("demo", NodeKind::File, "b.py", 0), Some(0)),
            Err(GraphError::FileWithParent(_))
        ));
        assert!(matches!(
            repo.add_node(CodeNode::new("demo", NodeKind::Function, "f", 1), None),
            Err(GraphError::MissingParent(_))
        ));
        assert!(matches!(
            repo.add_node(CodeNode::new("demo", NodeKind::Function, "g", 1), Some(2)),
            Err(GraphError::InvalidParent { .. })
        ));
        assert!(matches!(
            repo.add_node(CodeNode::new("demo", NodeKind::Function, "h", 1), Some(99)),
            Err(GraphError::UnknownParent { parent: 99, .. })
        ));
    }

    #[test]
    fn test_repository_mismatch() {
        let mut repo = RepositoryGraph::new("demo");
        let err = repo
            .add_node(CodeNode::new("other", NodeKind::File, "a.py", 0), None)
            .unwrap_err();
        assert!(matches!(err, GraphError::RepositoryMismatch { .. }));
    }

    #[test]
    fn test_empty_repository_is_adopted() {
        let mut repo = RepositoryGraph::new("demo");
        let id = repo
            .add_node(CodeNode::new("", NodeKind::File, "a.py", 0), None)
            .unwrap();
        assert_eq!(repo.node(id).unwrap().repository, "demo");
    }

    #[test]
    fn test_snapshot_json() {
        let json = r#"{
            "repositories": [{
                "name": "demo",
                "nodes": [
                    {"name": "app.py", "type": "File"},
                    {"name": "init", "type": "Function", "lineno": 3, "parent": 0,
                     "summary": "Initializes the app", "summary_embedding": [1.0, 0.0]}
                ]
            }]
        }"#;
        let snapshot = GraphSnapshot::from_json(json).unwrap();
        let repo = snapshot.repository("demo").unwrap();
        assert_eq!(repo.len(), 2);
        let init = repo.node(1).unwrap();
        assert_eq!(init.repository, "demo");
        assert_eq!(init.summary_embedding.as_deref(), Some(&[1.0, 0.0][..]));
        assert!(init.code_embedding.is_none());

        let reparsed = GraphSnapshot::from_json(&snapshot.to_json().unwrap()).unwrap();
        assert_eq!(reparsed.repository("demo").unwrap().parent(1), Some(0));
    }

    #[test]
    fn test_snapshot_forward_parent_rejected() {
        let json = r#"{"repositories": [{"name": "demo", "nodes": [
            {"name": "f", "type": "Function", "parent": 1},
            {"name": "a.py", "type": "File"}
        ]}]}"#;
        assert!(matches!(
            GraphSnapshot::from_json(json),
            Err(GraphError::UnknownParent { .. })
        ));
    }

    #[test]
    fn test_snapshot_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.json");
        std::fs::write(
            &path,
            r#"{"repositories": [{"name": "a", "nodes": []}, {"name": "b"}]}"#,
        )
        .unwrap();
        let snapshot = GraphSnapshot::load(&path).unwrap();
        assert_eq!(snapshot.repositories().len(), 2);
    }

    #[test]
    fn test_duplicate_repository() {
        let json = r#"{"repositories": [{"name": "a"}, {"name": "a"}]}"#;
        assert!(matches!(
            GraphSnapshot::from_json(json),
            Err(GraphError::DuplicateRepository(_))
        ));
    }
}

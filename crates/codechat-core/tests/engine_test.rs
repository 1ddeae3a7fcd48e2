//! End-to-end tests of the query pipeline with scripted model and
//! embedding providers over the in-memory graph store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use codechat_core::{
    Conversational, EngineSettings, QueryEngine, QueryError, QueryRequest, SynthesisError,
    SynthesisSettings, NO_RESULTS_ANSWER,
};
use codechat_index::{
    CodeNode, EmbeddingProvider, GraphSnapshot, GraphStore, InMemoryGraphStore, NodeKind,
    RepositoryGraph, StrategyKind,
};
use codechat_providers::{CompletionRequest, CompletionResponse, LLMProvider, Usage};

const DIMS: usize = 3;
const REPO: &str = "demo";

struct CountingEmbeddings {
    calls: AtomicUsize,
    down: bool,
}

impl CountingEmbeddings {
    fn up() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            down: false,
        })
    }

    fn down() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            down: true,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingProvider for CountingEmbeddings {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.down {
            anyhow::bail!("embedding service unreachable");
        }
        Ok(vec![1.0, 0.0, 0.0])
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    fn dimensions(&self) -> usize {
        DIMS
    }

    fn model_name(&self) -> &str {
        "counting"
    }
}

enum Reply {
    Text(&'static str),
    Fail,
    Slow(Duration),
}

struct ScriptedLlm {
    reply: Reply,
    calls: AtomicUsize,
    user_messages: Mutex<Vec<String>>,
}

impl ScriptedLlm {
    fn new(reply: Reply) -> Arc<Self> {
        Arc::new(Self {
            reply,
            calls: AtomicUsize::new(0),
            user_messages: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LLMProvider for ScriptedLlm {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(user) = request.messages.last() {
            self.user_messages.lock().unwrap().push(user.content.clone());
        }
        let content = match &self.reply {
            Reply::Text(text) => text.to_string(),
            Reply::Fail => anyhow::bail!("upstream returned 502"),
            Reply::Slow(delay) => {
                tokio::time::sleep(*delay).await;
                "too late".to_string()
            }
        };
        Ok(CompletionResponse {
            content,
            usage: Usage::default(),
            model: "scripted".to_string(),
            stop_reason: Some("end_turn".to_string()),
        })
    }

    fn name(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        "scripted"
    }
}

/// `app.py` holding `init` (close to the query vector), `parse` (keyword
/// match only) and `helper` (orthogonal, no keyword).
fn demo_graph() -> RepositoryGraph {
    let mut repo = RepositoryGraph::new(REPO);
    let file = repo
        .add_node(
            CodeNode::new(REPO, NodeKind::File, "app.py", 0).with_summary("Application entry"),
            None,
        )
        .unwrap();
    repo.add_node(
        CodeNode::new(REPO, NodeKind::Function, "init", 3)
            .with_summary("Sets up runtime state")
            .with_parameters(["config"])
            .with_summary_embedding(vec![0.9, 0.435_889_9, 0.0]),
        Some(file),
    )
    .unwrap();
    repo.add_node(
        CodeNode::new(REPO, NodeKind::Function, "parse", 12)
            .with_summary("Parses the listed functions"),
        Some(file),
    )
    .unwrap();
    repo.add_node(
        CodeNode::new(REPO, NodeKind::Function, "helper", 30)
            .with_summary("Formats log lines")
            .with_summary_embedding(vec![0.0, 0.0, 1.0]),
        Some(file),
    )
    .unwrap();
    repo
}

fn demo_store() -> Arc<dyn GraphStore> {
    let mut snapshot = GraphSnapshot::new();
    snapshot.add_repository(demo_graph()).unwrap();
    Arc::new(InMemoryGraphStore::new(snapshot).with_dimensions(DIMS))
}

fn settings() -> EngineSettings {
    EngineSettings {
        synthesis: SynthesisSettings {
            timeout: Duration::from_millis(200),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn engine(embeddings: Arc<CountingEmbeddings>, llm: Arc<ScriptedLlm>) -> QueryEngine {
    QueryEngine::new(embeddings, demo_store(), llm, settings())
}

const MAIN_FUNCTIONS: &str = "What are the main functions?";

#[tokio::test]
async fn test_answer_grounded_in_retrieved_nodes() {
    let embeddings = CountingEmbeddings::up();
    let llm = ScriptedLlm::new(Reply::Text("  The main functions are init and parse.\n"));
    let engine = engine(embeddings.clone(), llm.clone());

    let response = engine.answer(&QueryRequest::new(MAIN_FUNCTIONS)).await.unwrap();

    assert_eq!(response.answer, "The main functions are init and parse.");
    assert_eq!(response.sources[0].name, "init");
    assert!(response.sources.iter().all(|s| s.name != "helper"));
    assert!(response.sources.iter().any(|s| s.name == "parse"));
    assert!(response.sources.len() <= 5);

    let meta = &response.metadata;
    assert!(!meta.query_id.is_empty());
    assert!(meta.query_type.is_some());
    assert!(meta.keywords.contains(&"functions".to_string()));
    assert!(meta.degraded_strategies.is_empty());
    assert!(!meta.cached);
    assert_eq!(meta.context_stats.total, response.sources.len());

    // One embedding per vector strategy, one model call.
    assert_eq!(embeddings.calls(), 2);
    assert_eq!(llm.calls(), 1);

    let user = llm.user_messages.lock().unwrap()[0].clone();
    assert!(user.starts_with(MAIN_FUNCTIONS));
    assert!(user.contains("--- RETRIEVED CONTEXT ---"));
    assert!(user.contains("[Function] init (line 3)"));
}

#[tokio::test]
async fn test_invalid_requests_rejected_before_retrieval() {
    let embeddings = CountingEmbeddings::up();
    let llm = ScriptedLlm::new(Reply::Text("unused"));
    let engine = engine(embeddings.clone(), llm.clone());

    for request in [
        QueryRequest::new("   "),
        QueryRequest::new(MAIN_FUNCTIONS).with_top_k(0),
        QueryRequest::new(MAIN_FUNCTIONS).with_top_k(51),
    ] {
        let err = engine.answer(&request).await.unwrap_err();
        assert!(matches!(err, QueryError::InvalidQuery(_)), "{err:?}");
        assert_eq!(err.code(), "invalid_query");
    }
    assert_eq!(embeddings.calls(), 0);
    assert_eq!(llm.calls(), 0);
}

#[tokio::test]
async fn test_small_talk_skips_retrieval() {
    let embeddings = CountingEmbeddings::up();
    let llm = ScriptedLlm::new(Reply::Text("unused"));
    let engine = engine(embeddings.clone(), llm.clone());

    let response = engine.answer(&QueryRequest::new("Hello!")).await.unwrap();
    assert_eq!(
        response.metadata.conversational,
        Some(Conversational::Greeting)
    );
    assert!(response.sources.is_empty());
    assert!(response.metadata.query_type.is_none());
    assert_eq!(embeddings.calls(), 0);
    assert_eq!(llm.calls(), 0);
}

#[tokio::test]
async fn test_no_results_does_not_call_model() {
    let embeddings = CountingEmbeddings::up();
    let llm = ScriptedLlm::new(Reply::Text("unused"));
    let engine = engine(embeddings, llm.clone());

    let request = QueryRequest::new(MAIN_FUNCTIONS).with_repository("unknown-repo");
    let response = engine.answer(&request).await.unwrap();
    assert_eq!(response.answer, NO_RESULTS_ANSWER);
    assert!(response.sources.is_empty());
    assert!(!response.metadata.retrieval_failed);
    assert_eq!(llm.calls(), 0);
}

#[tokio::test]
async fn test_all_strategies_down() {
    let embeddings = CountingEmbeddings::down();
    let llm = ScriptedLlm::new(Reply::Text("unused"));

    struct OfflineStore;

    #[async_trait]
    impl GraphStore for OfflineStore {
        async fn vector_search(
            &self,
            _field: codechat_index::EmbeddingField,
            _vector: &[f32],
            _limit: usize,
            _repository: Option<&str>,
        ) -> Result<Vec<codechat_index::StoreHit>, codechat_index::StoreError> {
            Err(codechat_index::StoreError::Unavailable("offline".into()))
        }

        async fn keyword_search(
            &self,
            _keywords: &[String],
            _limit: usize,
            _repository: Option<&str>,
        ) -> Result<Vec<codechat_index::KeywordHit>, codechat_index::StoreError> {
            Err(codechat_index::StoreError::Unavailable("offline".into()))
        }

        async fn neighbors(
            &self,
            _key: &codechat_index::NodeKey,
        ) -> Result<codechat_index::Neighbors, codechat_index::StoreError> {
            Err(codechat_index::StoreError::Unavailable("offline".into()))
        }

        async fn repositories(
            &self,
        ) -> Result<Vec<codechat_index::RepositorySummary>, codechat_index::StoreError> {
            Err(codechat_index::StoreError::Unavailable("offline".into()))
        }
    }

    let engine = QueryEngine::new(embeddings, Arc::new(OfflineStore), llm.clone(), settings());

    let response = engine.answer(&QueryRequest::new(MAIN_FUNCTIONS)).await.unwrap();
    assert_eq!(response.answer, NO_RESULTS_ANSWER);
    assert!(response.metadata.retrieval_failed);
    assert_eq!(llm.calls(), 0);

    let err = engine
        .retrieve(&QueryRequest::new(MAIN_FUNCTIONS))
        .await
        .unwrap_err();
    assert!(matches!(err, QueryError::AllStrategiesFailed));

    // Failures are never cached.
    engine.answer(&QueryRequest::new(MAIN_FUNCTIONS)).await.unwrap();
    assert_eq!(engine.cache_stats().unwrap().entries, 0);
}

#[tokio::test]
async fn test_embedding_outage_degrades_to_keyword() {
    let embeddings = CountingEmbeddings::down();
    let llm = ScriptedLlm::new(Reply::Text("parse walks the functions"));
    let engine = engine(embeddings, llm.clone());

    let response = engine.answer(&QueryRequest::new(MAIN_FUNCTIONS)).await.unwrap();
    assert_eq!(response.answer, "parse walks the functions");
    assert!(response.sources.iter().any(|s| s.name == "parse"));
    let degraded = &response.metadata.degraded_strategies;
    assert!(degraded.contains(&StrategyKind::Semantic));
    assert!(degraded.contains(&StrategyKind::CodeEmbedding));
    assert!(!response.metadata.retrieval_failed);

    // Degraded answers are not cached, so the model is asked again.
    engine.answer(&QueryRequest::new(MAIN_FUNCTIONS)).await.unwrap();
    assert_eq!(llm.calls(), 2);
}

#[tokio::test]
async fn test_repeated_query_served_from_cache() {
    let embeddings = CountingEmbeddings::up();
    let llm = ScriptedLlm::new(Reply::Text("init and parse"));
    let engine = engine(embeddings.clone(), llm.clone());

    let first = engine.answer(&QueryRequest::new(MAIN_FUNCTIONS)).await.unwrap();
    let second = engine
        .answer(&QueryRequest::new("  what are the MAIN functions? "))
        .await
        .unwrap();

    assert!(second.metadata.cached);
    assert_eq!(second.answer, first.answer);
    assert_eq!(second.sources, first.sources);
    assert_ne!(second.metadata.query_id, first.metadata.query_id);
    assert_eq!(llm.calls(), 1);
    assert_eq!(embeddings.calls(), 2);

    // A different top_k is a different question.
    engine
        .answer(&QueryRequest::new(MAIN_FUNCTIONS).with_top_k(2))
        .await
        .unwrap();
    assert_eq!(llm.calls(), 2);

    assert_eq!(engine.invalidate_repository(REPO), 2);
    engine.answer(&QueryRequest::new(MAIN_FUNCTIONS)).await.unwrap();
    assert_eq!(llm.calls(), 3);
}

#[tokio::test]
async fn test_model_timeout() {
    let llm = ScriptedLlm::new(Reply::Slow(Duration::from_secs(5)));
    let engine = engine(CountingEmbeddings::up(), llm);

    let err = engine
        .answer(&QueryRequest::new(MAIN_FUNCTIONS))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        QueryError::Synthesis(SynthesisError::Timeout(_))
    ));
    assert_eq!(err.code(), "synthesis_timeout");
}

#[tokio::test]
async fn test_model_failure_and_blank_answer() {
    let engine_fail = engine(CountingEmbeddings::up(), ScriptedLlm::new(Reply::Fail));
    let err = engine_fail
        .answer(&QueryRequest::new(MAIN_FUNCTIONS))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        QueryError::Synthesis(SynthesisError::Provider(ref msg)) if msg.contains("502")
    ));

    let engine_blank = engine(CountingEmbeddings::up(), ScriptedLlm::new(Reply::Text(" \n ")));
    let err = engine_blank
        .answer(&QueryRequest::new(MAIN_FUNCTIONS))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        QueryError::Synthesis(SynthesisError::EmptyResponse)
    ));
    assert_eq!(engine_blank.cache_stats().unwrap().entries, 0);
}

#[tokio::test]
async fn test_cancellation() {
    let llm = ScriptedLlm::new(Reply::Slow(Duration::from_secs(5)));
    let engine = QueryEngine::new(
        CountingEmbeddings::up(),
        demo_store(),
        llm.clone(),
        EngineSettings::default(),
    );

    let token = CancellationToken::new();
    let request = QueryRequest::new(MAIN_FUNCTIONS);
    let (result, _) = tokio::join!(engine.answer_with_cancel(&request, &token), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
    });
    let err = result.unwrap_err();
    assert!(matches!(err, QueryError::Synthesis(SynthesisError::Cancelled)));
    assert_eq!(err.code(), "cancelled");

    // Already-cancelled requests never reach the model.
    let calls_before = llm.calls();
    let err = engine
        .answer_with_cancel(&request, &token)
        .await
        .unwrap_err();
    assert!(matches!(err, QueryError::Synthesis(SynthesisError::Cancelled)));
    assert_eq!(llm.calls(), calls_before);
}

#[tokio::test]
async fn test_retrieve_only() {
    let llm = ScriptedLlm::new(Reply::Text("unused"));
    let engine = engine(CountingEmbeddings::up(), llm.clone());

    let (analysis, outcome) = engine
        .retrieve(&QueryRequest::new(MAIN_FUNCTIONS).with_top_k(3))
        .await
        .unwrap();
    assert!(analysis.keywords.contains("functions"));
    assert!(!outcome.results.is_empty());
    assert!(outcome.results.len() <= analysis.effective_top_k(3));
    assert_eq!(outcome.results[0].node.name, "init");
    assert_eq!(llm.calls(), 0);
}

#[tokio::test]
async fn test_engine_over_loaded_snapshot() {
    let mut snapshot = GraphSnapshot::new();
    snapshot.add_repository(demo_graph()).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("graph.json");
    std::fs::write(&path, snapshot.to_json().unwrap()).unwrap();

    let loaded = GraphSnapshot::load(&path).unwrap();
    let store = Arc::new(InMemoryGraphStore::new(loaded).with_dimensions(DIMS));
    let llm = ScriptedLlm::new(Reply::Text("init boots the app"));
    let engine = QueryEngine::new(CountingEmbeddings::up(), store, llm, settings());

    let repos = engine.repositories().await.unwrap();
    assert_eq!(repos.len(), 1);
    assert_eq!(repos[0].name, REPO);
    assert_eq!(repos[0].files, 1);
    assert_eq!(repos[0].functions, 3);

    let response = engine.answer(&QueryRequest::new(MAIN_FUNCTIONS)).await.unwrap();
    assert_eq!(response.sources[0].name, "init");
    assert_eq!(response.sources[0].repository, REPO);
}

#[tokio::test]
async fn test_retrieval_only_engine() {
    let embeddings = CountingEmbeddings::up();
    let engine = QueryEngine::retrieval_only(embeddings.clone(), demo_store(), settings());

    let (_, outcome) = engine
        .retrieve(&QueryRequest::new(MAIN_FUNCTIONS))
        .await
        .unwrap();
    assert_eq!(outcome.results[0].node.name, "init");

    // Same request validation as the answering path.
    for request in [
        QueryRequest::new(""),
        QueryRequest::new(MAIN_FUNCTIONS).with_top_k(0),
        QueryRequest::new(MAIN_FUNCTIONS).with_top_k(51),
    ] {
        let err = engine.retrieve(&request).await.unwrap_err();
        assert!(matches!(err, QueryError::InvalidQuery(_)), "{err:?}");
    }

    let calls_before = embeddings.calls();
    let err = engine
        .answer(&QueryRequest::new(MAIN_FUNCTIONS))
        .await
        .unwrap_err();
    assert!(matches!(err, QueryError::NoLanguageModel));
    assert_eq!(err.code(), "no_language_model");
    assert_eq!(embeddings.calls(), calls_before);
}

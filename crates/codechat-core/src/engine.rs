//! The query pipeline: analyze, retrieve, build context, prompt, answer.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use codechat_config::{resolve_api_key, Config};
use codechat_index::{
    analyze, EmbeddingProvider, FusionWeights, GraphStore, HttpEmbeddings, QueryAnalysis,
    QueryType, RepositorySummary, RetrievalOutcome, Retriever, RetrieverConfig, StoreError,
    StrategyKind, DEFAULT_TOP_K,
};
use codechat_providers::{LLMProvider, OpenAiCompatibleProvider};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, Instrument};
use uuid::Uuid;

use crate::cache::{cache_key, CacheStats, QueryCache};
use crate::context::{ContextBuilder, ContextLimits, ContextStats};
use crate::conversational::Conversational;
use crate::error::QueryError;
use crate::prompts;
use crate::synthesizer::{AnswerSynthesizer, SourceRef, SynthesisSettings};

/// Answer returned when retrieval finds nothing relevant.
pub const NO_RESULTS_ANSWER: &str = "I couldn't find any code in the knowledge graph that is \
relevant to your question. Try rephrasing it, or name the file, class or function you are \
interested in.";

fn default_top_k() -> usize {
    DEFAULT_TOP_K
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub repository: Option<String>,
}

impl QueryRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            top_k: DEFAULT_TOP_K,
            repository: None,
        }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn with_repository(mut self, repository: impl Into<String>) -> Self {
        self.repository = Some(repository.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryMetadata {
    pub query_id: String,
    /// `None` for small talk, which is never classified.
    pub query_type: Option<QueryType>,
    pub keywords: Vec<String>,
    pub is_multi_part: bool,
    pub effective_top_k: usize,
    pub context_stats: ContextStats,
    pub degraded_strategies: Vec<StrategyKind>,
    /// Every retrieval strategy failed; the answer is the no-results reply.
    pub retrieval_failed: bool,
    pub cached: bool,
    pub conversational: Option<Conversational>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub answer: String,
    pub sources: Vec<SourceRef>,
    pub metadata: QueryMetadata,
}

/// Everything the engine needs besides its collaborators.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub max_top_k: usize,
    pub retriever: RetrieverConfig,
    pub context: ContextLimits,
    pub synthesis: SynthesisSettings,
    /// `(ttl, capacity)`; `None` disables caching.
    pub cache: Option<(Duration, usize)>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_top_k: 50,
            retriever: RetrieverConfig::default(),
            context: ContextLimits::default(),
            synthesis: SynthesisSettings::default(),
            cache: Some((Duration::from_secs(300), 256)),
        }
    }
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        let w = &config.engine.weights;
        Self {
            max_top_k: config.engine.max_top_k,
            retriever: RetrieverConfig {
                weights: FusionWeights {
                    semantic_weight: w.semantic_weight,
                    keyword_weight: w.keyword_weight,
                    code_weight: w.code_weight,
                    child_decay: w.child_decay,
                    parent_decay: w.parent_decay,
                },
                candidate_multiplier: config.engine.candidate_multiplier,
                expansion_enabled: config.engine.expansion_enabled,
                min_similarity: config.engine.min_similarity,
            },
            context: ContextLimits {
                max_chars: config.context.max_chars,
                summary_chars: config.context.summary_chars,
                code_chars: config.context.code_chars,
            },
            synthesis: SynthesisSettings {
                temperature: config.llm.temperature,
                max_tokens: config.llm.max_tokens,
                timeout: Duration::from_secs(config.llm.timeout_secs),
            },
            cache: config
                .cache
                .enabled
                .then(|| (Duration::from_secs(config.cache.ttl_secs), config.cache.capacity)),
        }
    }
}

pub struct QueryEngine {
    retriever: Retriever,
    store: Arc<dyn GraphStore>,
    context: ContextBuilder,
    /// `None` for engines that only retrieve.
    synthesizer: Option<AnswerSynthesizer>,
    cache: Option<QueryCache>,
    max_top_k: usize,
}

impl QueryEngine {
    pub fn new(
        embeddings: Arc<dyn EmbeddingProvider>,
        store: Arc<dyn GraphStore>,
        llm: Arc<dyn LLMProvider>,
        settings: EngineSettings,
    ) -> Self {
        let synthesizer = AnswerSynthesizer::new(llm, settings.synthesis);
        Self {
            synthesizer: Some(synthesizer),
            ..Self::retrieval_only(embeddings, store, settings)
        }
    }

    /// An engine without a language model: `retrieve` works, `answer`
    /// fails with [`QueryError::NoLanguageModel`].
    pub fn retrieval_only(
        embeddings: Arc<dyn EmbeddingProvider>,
        store: Arc<dyn GraphStore>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            retriever: Retriever::new(embeddings, store.clone(), settings.retriever),
            store,
            context: ContextBuilder::new(settings.context),
            synthesizer: None,
            cache: settings
                .cache
                .map(|(ttl, capacity)| QueryCache::new(ttl, capacity)),
            max_top_k: settings.max_top_k,
        }
    }

    /// Wire the HTTP embedding and chat clients described by `config`.
    pub fn from_config(config: &Config, store: Arc<dyn GraphStore>) -> Result<Self> {
        let embeddings = http_embeddings(config)?;

        let llm_key =
            resolve_api_key(&config.llm.api_key).context("Failed to resolve LLM API key")?;
        let llm = OpenAiCompatibleProvider::new(
            llm_key,
            Some(config.llm.model.clone()),
            Some(config.llm.base_url.clone()),
            Some(config.llm.max_tokens),
            Some(config.llm.temperature),
        )?;

        info!(
            embedding_model = %config.embeddings.model,
            llm_model = %config.llm.model,
            "Query engine configured"
        );

        Ok(Self::new(
            Arc::new(embeddings),
            store,
            Arc::new(llm),
            EngineSettings::from_config(config),
        ))
    }

    /// Like [`QueryEngine::from_config`] but needs no LLM key.
    pub fn retrieval_from_config(config: &Config, store: Arc<dyn GraphStore>) -> Result<Self> {
        let embeddings = http_embeddings(config)?;
        info!(embedding_model = %config.embeddings.model, "Retrieval engine configured");
        Ok(Self::retrieval_only(
            Arc::new(embeddings),
            store,
            EngineSettings::from_config(config),
        ))
    }

    fn validate(&self, request: &QueryRequest) -> Result<(), QueryError> {
        if request.query.trim().is_empty() {
            return Err(QueryError::InvalidQuery("query must not be empty".into()));
        }
        if request.top_k == 0 {
            return Err(QueryError::InvalidQuery("top_k must be at least 1".into()));
        }
        if request.top_k > self.max_top_k {
            return Err(QueryError::InvalidQuery(format!(
                "top_k must be at most {}",
                self.max_top_k
            )));
        }
        Ok(())
    }

    pub async fn answer(&self, request: &QueryRequest) -> Result<QueryResponse, QueryError> {
        self.answer_with_cancel(request, &CancellationToken::new())
            .await
    }

    /// Run the full pipeline. Cancelling `cancel` aborts a pending model call.
    pub async fn answer_with_cancel(
        &self,
        request: &QueryRequest,
        cancel: &CancellationToken,
    ) -> Result<QueryResponse, QueryError> {
        self.validate(request)?;
        let Some(synthesizer) = &self.synthesizer else {
            return Err(QueryError::NoLanguageModel);
        };

        let query_id = Uuid::new_v4().to_string();
        let span = info_span!("query", query_id = %query_id);
        self.run(synthesizer, request, query_id, cancel)
            .instrument(span)
            .await
    }

    async fn run(
        &self,
        synthesizer: &AnswerSynthesizer,
        request: &QueryRequest,
        query_id: String,
        cancel: &CancellationToken,
    ) -> Result<QueryResponse, QueryError> {
        let started = Instant::now();
        let query = request.query.trim();
        let repository = request.repository.as_deref();

        if let Some(kind) = Conversational::detect(query) {
            debug!(?kind, "Answering small talk without retrieval");
            return Ok(QueryResponse {
                answer: kind.response().to_string(),
                sources: Vec::new(),
                metadata: QueryMetadata {
                    query_id,
                    conversational: Some(kind),
                    elapsed_ms: elapsed_ms(started),
                    ..Default::default()
                },
            });
        }

        let key = cache_key(query, request.top_k, repository);
        if let Some(mut cached) = self.cache.as_ref().and_then(|c| c.get(&key)) {
            debug!("Serving cached answer");
            cached.metadata.query_id = query_id;
            cached.metadata.cached = true;
            cached.metadata.elapsed_ms = elapsed_ms(started);
            return Ok(cached);
        }

        let analysis = analyze(query);
        debug!(
            query_type = %analysis.query_type,
            keywords = ?analysis.keywords,
            multi_part = analysis.is_multi_part,
            "Query analyzed"
        );

        let outcome = self
            .retriever
            .retrieve(query, &analysis, request.top_k, repository)
            .await;
        let mut metadata = base_metadata(query_id, &analysis, request.top_k, &outcome);

        if outcome.all_failed {
            error!(
                degraded = ?outcome.degraded,
                "Every retrieval strategy failed, answering without context"
            );
            metadata.elapsed_ms = elapsed_ms(started);
            return Ok(no_results(metadata));
        }

        if outcome.results.is_empty() {
            info!("No relevant code found");
            metadata.elapsed_ms = elapsed_ms(started);
            let response = no_results(metadata);
            self.remember(key, repository, &outcome, &response);
            return Ok(response);
        }

        if cancel.is_cancelled() {
            return Err(crate::error::SynthesisError::Cancelled.into());
        }

        let context = self.context.build(&outcome.results);
        if context.stats.dropped > 0 {
            debug!(dropped = context.stats.dropped, "Context budget reached");
        }
        let system = prompts::system_prompt(analysis.query_type, &context.stats);
        let user = prompts::user_message(query, &context.text, &analysis);
        metadata.context_stats = context.stats;

        let answer = synthesizer
            .synthesize(system, user, &outcome.results, cancel)
            .await?;

        metadata.elapsed_ms = elapsed_ms(started);
        info!(
            sources = answer.sources.len(),
            elapsed_ms = metadata.elapsed_ms,
            "Query answered"
        );

        let response = QueryResponse {
            answer: answer.answer,
            sources: answer.sources,
            metadata,
        };
        self.remember(key, repository, &outcome, &response);
        Ok(response)
    }

    /// Cache a response unless retrieval was degraded.
    fn remember(
        &self,
        key: String,
        repository: Option<&str>,
        outcome: &RetrievalOutcome,
        response: &QueryResponse,
    ) {
        if let Some(cache) = &self.cache {
            if outcome.degraded.is_empty() {
                cache.insert(key, repository, response.clone());
            }
        }
    }

    /// Retrieval only, without a model call.
    pub async fn retrieve(
        &self,
        request: &QueryRequest,
    ) -> Result<(QueryAnalysis, RetrievalOutcome), QueryError> {
        self.validate(request)?;
        let query = request.query.trim();
        let analysis = analyze(query);
        let outcome = self
            .retriever
            .retrieve(query, &analysis, request.top_k, request.repository.as_deref())
            .await;
        if outcome.all_failed {
            return Err(QueryError::AllStrategiesFailed);
        }
        Ok((analysis, outcome))
    }

    pub async fn repositories(&self) -> Result<Vec<RepositorySummary>, StoreError> {
        self.store.repositories().await
    }

    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.cache.as_ref().map(QueryCache::stats)
    }

    /// Forget cached answers after `repository` is re-ingested.
    pub fn invalidate_repository(&self, repository: &str) -> usize {
        self.cache
            .as_ref()
            .map_or(0, |c| c.invalidate_repository(repository))
    }
}

fn http_embeddings(config: &Config) -> Result<HttpEmbeddings> {
    let key = resolve_api_key(&config.embeddings.api_key)
        .context("Failed to resolve embeddings API key")?;
    Ok(HttpEmbeddings::new(
        key,
        Some(config.embeddings.model.clone()),
        Some(config.embeddings.dimensions),
        Duration::from_secs(config.embeddings.timeout_secs),
    )?
    .with_base_url(config.embeddings.base_url.clone()))
}

fn base_metadata(
    query_id: String,
    analysis: &QueryAnalysis,
    top_k: usize,
    outcome: &RetrievalOutcome,
) -> QueryMetadata {
    QueryMetadata {
        query_id,
        query_type: Some(analysis.query_type),
        keywords: analysis.keywords.iter().cloned().collect(),
        is_multi_part: analysis.is_multi_part,
        effective_top_k: analysis.effective_top_k(top_k),
        degraded_strategies: outcome.degraded.clone(),
        retrieval_failed: outcome.all_failed,
        ..Default::default()
    }
}

fn no_results(metadata: QueryMetadata) -> QueryResponse {
    QueryResponse {
        answer: NO_RESULTS_ANSWER.to_string(),
        sources: Vec::new(),
        metadata,
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis().try_into().unwrap_or(u64::MAX)
}

//! CodeChat query engine.
//!
//! Turns a natural-language question about an indexed repository into an
//! answer: the query is analyzed, candidate nodes are retrieved and fused,
//! a bounded context block is rendered, and one chat completion produces
//! the reply together with the nodes it was grounded on.

pub mod cache;
pub mod context;
pub mod conversational;
pub mod engine;
pub mod error;
pub mod prompts;
pub mod synthesizer;

pub use cache::{cache_key, CacheStats, QueryCache};
pub use context::{BuiltContext, ContextBuilder, ContextLimits, ContextStats};
pub use conversational::Conversational;
pub use engine::{
    EngineSettings, QueryEngine, QueryMetadata, QueryRequest, QueryResponse, NO_RESULTS_ANSWER,
};
pub use error::{QueryError, SynthesisError};
pub use synthesizer::{Answer, AnswerSynthesizer, SourceRef, SynthesisSettings};

//! Error types for the query pipeline.

use std::time::Duration;

use thiserror::Error;

/// Failures of the answer-synthesis step.
#[derive(Error, Debug)]
pub enum SynthesisError {
    #[error("language model did not answer within {0:?}")]
    Timeout(Duration),

    #[error("language model request failed: {0}")]
    Provider(String),

    #[error("language model returned an empty answer")]
    EmptyResponse,

    #[error("query was cancelled")]
    Cancelled,
}

/// Errors surfaced to the caller of [`crate::QueryEngine::answer`].
#[derive(Error, Debug)]
pub enum QueryError {
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error(transparent)]
    Synthesis(#[from] SynthesisError),

    #[error("every retrieval strategy failed")]
    AllStrategiesFailed,

    #[error("no language model configured for this engine")]
    NoLanguageModel,
}

impl QueryError {
    /// Stable identifier for transport layers.
    pub fn code(&self) -> &'static str {
        match self {
            QueryError::InvalidQuery(_) => "invalid_query",
            QueryError::Synthesis(SynthesisError::Timeout(_)) => "synthesis_timeout",
            QueryError::Synthesis(SynthesisError::Cancelled) => "cancelled",
            QueryError::Synthesis(_) => "synthesis_failed",
            QueryError::AllStrategiesFailed => "retrieval_unavailable",
            QueryError::NoLanguageModel => "no_language_model",
        }
    }
}

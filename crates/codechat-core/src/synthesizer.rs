//! Answer synthesis: one chat completion under a deadline.

use std::sync::Arc;
use std::time::Duration;

use codechat_index::{NodeKind, RetrievalResult};
use codechat_providers::{CompletionRequest, LLMProvider, Message};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::SynthesisError;

/// A node cited as a source of the answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    pub summary: Option<String>,
    pub score: f32,
    pub repository: String,
    pub lineno: u32,
}

impl From<&RetrievalResult> for SourceRef {
    fn from(result: &RetrievalResult) -> Self {
        Self {
            name: result.node.name.clone(),
            kind: result.node.kind,
            summary: result.node.summary.clone(),
            score: result.score,
            repository: result.node.repository.clone(),
            lineno: result.node.lineno,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub answer: String,
    pub sources: Vec<SourceRef>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SynthesisSettings {
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
}

impl Default for SynthesisSettings {
    fn default() -> Self {
        Self {
            temperature: 0.2,
            max_tokens: 2048,
            timeout: Duration::from_secs(60),
        }
    }
}

pub struct AnswerSynthesizer {
    provider: Arc<dyn LLMProvider>,
    settings: SynthesisSettings,
}

impl AnswerSynthesizer {
    pub fn new(provider: Arc<dyn LLMProvider>, settings: SynthesisSettings) -> Self {
        Self { provider, settings }
    }

    /// Ask the model once. Sources are the ranked results, unchanged.
    ///
    /// No retry: a timeout, provider error or blank reply fails the query.
    pub async fn synthesize(
        &self,
        system_prompt: String,
        user_message: String,
        results: &[RetrievalResult],
        cancel: &CancellationToken,
    ) -> Result<Answer, SynthesisError> {
        let request = CompletionRequest {
            messages: vec![Message::system(system_prompt), Message::user(user_message)],
            max_tokens: Some(self.settings.max_tokens),
            temperature: Some(self.settings.temperature),
            stop_sequences: Vec::new(),
        };

        debug!(
            provider = self.provider.name(),
            model = self.provider.model(),
            "Requesting answer"
        );

        let call = tokio::time::timeout(self.settings.timeout, self.provider.complete(request));
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(SynthesisError::Cancelled),
            outcome = call => match outcome {
                Err(_) => {
                    error!(timeout = ?self.settings.timeout, "Answer synthesis timed out");
                    return Err(SynthesisError::Timeout(self.settings.timeout));
                }
                Ok(Err(e)) => {
                    error!(error = %e, "Answer synthesis failed");
                    return Err(SynthesisError::Provider(format!("{e:#}")));
                }
                Ok(Ok(response)) => response,
            },
        };

        let answer = response.content.trim();
        if answer.is_empty() {
            error!(model = %response.model, "Language model returned a blank answer");
            return Err(SynthesisError::EmptyResponse);
        }

        debug!(
            chars = answer.len(),
            completion_tokens = response.usage.completion_tokens,
            "Answer received"
        );

        Ok(Answer {
            answer: answer.to_string(),
            sources: results.iter().map(SourceRef::from).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codechat_index::{CodeNode, StrategyKind};

    #[test]
    fn test_source_ref_from_result() {
        let result = RetrievalResult {
            node: Arc::new(
                CodeNode::new("demo", NodeKind::Function, "init", 3).with_summary("Boots the app"),
            ),
            score: 1.25,
            source: StrategyKind::Hybrid,
            depth: 1,
        };
        let source = SourceRef::from(&result);
        assert_eq!(source.name, "init");
        assert_eq!(source.kind, NodeKind::Function);
        assert_eq!(source.summary.as_deref(), Some("Boots the app"));
        assert_eq!(source.score, 1.25);
        assert_eq!(source.repository, "demo");
        assert_eq!(source.lineno, 3);

        let json = serde_json::to_value(&source).unwrap();
        assert_eq!(json["type"], "Function");
    }

    #[test]
    fn test_default_settings() {
        let settings = SynthesisSettings::default();
        assert_eq!(settings.temperature, 0.2);
        assert_eq!(settings.max_tokens, 2048);
        assert_eq!(settings.timeout, Duration::from_secs(60));
    }
}

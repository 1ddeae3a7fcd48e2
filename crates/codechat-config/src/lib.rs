//! Configuration for the CodeChat retrieval engine.
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! environment overrides of the form `CODECHAT__SECTION__KEY`
//! (e.g. `CODECHAT__ENGINE__DEFAULT_TOP_K=8`).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "CODECHAT";

/// Fallback environment variable consulted when no API key is configured.
pub const DEFAULT_API_KEY_ENV: &str = "CODECHAT_API_KEY";

/// Errors produced while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to render configuration: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("missing API key: {0}")]
    MissingApiKey(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub engine: EngineConfig,
    pub context: ContextConfig,
    pub embeddings: EmbeddingsConfig,
    pub llm: LlmConfig,
    pub cache: CacheConfig,
}

/// Retrieval engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// `top_k` used when a request does not specify one
    pub default_top_k: usize,
    /// Largest `top_k` a request may ask for
    pub max_top_k: usize,
    /// Each strategy fetches `top_k * candidate_multiplier` candidates
    pub candidate_multiplier: usize,
    /// Run relationship expansion over merged results
    pub expansion_enabled: bool,
    /// Embedding hits at or below this cosine similarity are ignored
    pub min_similarity: f32,
    /// Strategy weights and expansion decay factors
    pub weights: WeightsConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_top_k: 5,
            max_top_k: 50,
            candidate_multiplier: 2,
            expansion_enabled: true,
            min_similarity: 0.0,
            weights: WeightsConfig::default(),
        }
    }
}

/// Fusion weights applied to strategy-local scores.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeightsConfig {
    pub semantic_weight: f32,
    pub keyword_weight: f32,
    pub code_weight: f32,
    pub child_decay: f32,
    pub parent_decay: f32,
}

impl Default for WeightsConfig {
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

/// Context block limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Character budget for the whole context block
    pub max_chars: usize,
    /// Summaries longer than this are truncated
    pub summary_chars: usize,
    /// Code excerpts (used when a node has no summary) are truncated to this
    pub code_chars: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_chars: 6000,
            summary_chars: 300,
            code_chars: 500,
        }
    }
}

/// Embedding service used for the live query.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingsConfig {
    pub base_url: String,
    pub model: String,
    /// Must match the dimensionality of the stored node embeddings
    pub dimensions: usize,
    /// Literal key or `${ENV_VAR}`
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

impl Default for EmbeddingsConfig {
    fn default() -> Self {
        Self {
            base_url: "https://openrouter.ai/api/v1/embeddings".to_string(),
            model: "google/text-embedding-004".to_string(),
            dimensions: 768,
            api_key: None,
            timeout_secs: 30,
        }
    }
}

/// Generative-language service used for answer synthesis.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    /// Literal key or `${ENV_VAR}`
    pub api_key: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://openrouter.ai/api/v1".to_string(),
            model: "google/gemini-2.0-flash-001".to_string(),
            api_key: None,
            temperature: 0.2,
            max_tokens: 2048,
            timeout_secs: 60,
        }
    }
}

/// Query result cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl_secs: u64,
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 300,
            capacity: 256,
        }
    }
}

impl Config {
    /// Load configuration from defaults, an optional TOML file and the environment.
    ///
    /// When `path` is `None` the per-user config file is used if it exists.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);

        match path {
            Some(path) => {
                builder = builder.add_source(
                    config::File::from(path)
                        .format(config::FileFormat::Toml)
                        .required(true),
                );
            }
            None => {
                if let Some(default_path) = default_config_path() {
                    builder = builder.add_source(
                        config::File::from(default_path)
                            .format(config::FileFormat::Toml)
                            .required(false),
                    );
                }
            }
        }

        let config: Config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Check value ranges that the engine relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let engine = &self.engine;
        if engine.default_top_k == 0 {
            return invalid("engine.default_top_k must be greater than 0");
        }
        if engine.max_top_k < engine.default_top_k {
            return invalid("engine.max_top_k must be at least engine.default_top_k");
        }
        if engine.candidate_multiplier == 0 {
            return invalid("engine.candidate_multiplier must be greater than 0");
        }

        if !(-1.0..1.0).contains(&engine.min_similarity) {
            return invalid("engine.min_similarity must be in [-1, 1)");
        }

        let w = &engine.weights;
        for (name, value) in [
            ("semantic_weight", w.semantic_weight),
            ("keyword_weight", w.keyword_weight),
            ("code_weight", w.code_weight),
        ] {
            if !value.is_finite() || value < 0.0 {
                return invalid(format!("engine.weights.{name} must be a non-negative number"));
            }
        }
        for (name, value) in [("child_decay", w.child_decay), ("parent_decay", w.parent_decay)] {
            if !(0.0..1.0).contains(&value) {
                return invalid(format!("engine.weights.{name} must be in [0, 1)"));
            }
        }

        if self.context.max_chars == 0 {
            return invalid("context.max_chars must be greater than 0");
        }
        if self.embeddings.dimensions == 0 {
            return invalid("embeddings.dimensions must be greater than 0");
        }
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return invalid("llm.temperature must be in [0, 2]");
        }
        if self.llm.timeout_secs == 0 || self.embeddings.timeout_secs == 0 {
            return invalid("timeouts must be greater than 0");
        }
        if self.cache.enabled && self.cache.capacity == 0 {
            return invalid("cache.capacity must be greater than 0 when the cache is enabled");
        }
        Ok(())
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

fn invalid<T>(message: impl Into<String>) -> Result<T, ConfigError> {
    Err(ConfigError::Invalid(message.into()))
}

/// Per-user configuration file location (`<config dir>/codechat/config.toml`).
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("codechat").join("config.toml"))
}

/// Resolve a configured API key.
///
/// `${VAR}` / `$VAR` references are expanded from the environment. When nothing
/// is configured, [`DEFAULT_API_KEY_ENV`] is consulted.
pub fn resolve_api_key(api_key: &Option<String>) -> Result<String, ConfigError> {
    match api_key {
        Some(key) if !key.trim().is_empty() => shellexpand::env(key)
            .map(|expanded| expanded.into_owned())
            .map_err(|e| {
                ConfigError::MissingApiKey(format!(
                    "environment variable '{}' not set (from config value '{}')",
                    e.var_name, key
                ))
            }),
        _ => std::env::var(DEFAULT_API_KEY_ENV).map_err(|_| {
            ConfigError::MissingApiKey(format!(
                "no API key configured; set api_key in config or {DEFAULT_API_KEY_ENV}"
            ))
        }),
    }
}

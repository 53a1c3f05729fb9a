//! Configuration loading, overrides, and validation.
//!
//! Settings resolve in priority order: CLI flags, the config file (explicit
//! `--config` path or `<config_dir>/srf2sql/config.json`), environment
//! variables, then built-in defaults. Retrieval weights live here so ranking
//! can be retuned without a rebuild.
use crate::error::ValidationError;
use crate::retrieval::ScoreWeights;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_SCHEMA_VERSION: u32 = 1;

pub const ENV_LM_COMMAND: &str = "SRF2SQL_LM_COMMAND";
pub const ENV_RETRIEVAL_WEIGHTS: &str = "SRF2SQL_RETRIEVAL_WEIGHTS";
pub const ENV_MAX_RESULTS: &str = "SRF2SQL_MAX_RESULTS";
pub const ENV_CONFIDENCE_THRESHOLD: &str = "SRF2SQL_CONFIDENCE_THRESHOLD";

const DEFAULT_LM_COMMAND: &str = "llm";
const DEFAULT_EMBEDDING_DIMENSIONS: usize = 384;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub schema_version: u32,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub feedback: FeedbackConfig,
    /// Business rules injected into every generation prompt. Empty means the
    /// built-in commission rules.
    #[serde(default)]
    pub static_rules: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            schema_version: CONFIG_SCHEMA_VERSION,
            provider: ProviderConfig::default(),
            embedding: EmbeddingConfig::default(),
            retrieval: RetrievalConfig::default(),
            generation: GenerationConfig::default(),
            feedback: FeedbackConfig::default(),
            static_rules: Vec::new(),
        }
    }
}

/// Which text-generation backend to call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderConfig {
    /// Local command that reads the prompt on stdin and writes text to stdout.
    Command { command: String },
    /// OpenAI-compatible chat completions endpoint.
    Openai {
        base_url: String,
        model: String,
        api_key_env: String,
    },
    /// Ollama `/api/generate` endpoint.
    Ollama { base_url: String, model: String },
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self::Command {
            command: DEFAULT_LM_COMMAND.to_string(),
        }
    }
}

/// Which embedding backend to call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EmbeddingConfig {
    /// Local feature-hashing embedder; no network access.
    Hashing { dimensions: usize },
    /// OpenAI-compatible `/embeddings` endpoint.
    Openai {
        base_url: String,
        model: String,
        api_key_env: String,
        dimensions: usize,
    },
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self::Hashing {
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RetrievalConfig {
    pub max_results: usize,
    pub confidence_threshold: f64,
    pub weights: ScoreWeights,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            max_results: 5,
            confidence_threshold: 0.7,
            weights: ScoreWeights::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct GenerationConfig {
    /// Wall-clock limit for a single provider call.
    pub timeout_secs: u64,
    /// Extra attempts for timeouts and unreachable providers.
    pub provider_retries: u32,
    pub retry_backoff_ms: u64,
    /// Extra metadata prompts after an unparseable response.
    pub parse_retries: u32,
    pub temperature: f64,
    pub max_tokens: u32,
    /// Score each step against the best retrieved example and regenerate
    /// steps that fall below `review_threshold`.
    pub structure_review: bool,
    pub review_threshold: f64,
    /// Generations per step, including the first.
    pub review_attempts: u32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            provider_retries: 1,
            retry_backoff_ms: 500,
            parse_retries: 1,
            temperature: 0.1,
            max_tokens: 4000,
            structure_review: true,
            review_threshold: 0.7,
            review_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct FeedbackConfig {
    pub learning_rate: f64,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self { learning_rate: 0.2 }
    }
}

/// Default location of the user config file.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("srf2sql").join("config.json"))
}

/// Load configuration from an explicit path, the default location, or
/// defaults, then validate.
///
/// Values set in the config file win over environment overrides, which win
/// over built-in defaults. CLI flags are applied by the caller afterwards.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = match path {
        Some(path) => Some(path.to_path_buf()),
        None => default_config_path().filter(|p| p.is_file()),
    };
    let file_layer = match &path {
        Some(path) => Some(read_config_value(path)?),
        None => None,
    };
    let config = resolve_config(file_layer, |key| std::env::var(key).ok())?;
    validate_config(&config)?;
    Ok(config)
}

/// Layer a raw config file over environment overrides over defaults.
pub fn resolve_config<F>(file_layer: Option<Value>, lookup: F) -> Result<Config>
where
    F: Fn(&str) -> Option<String>,
{
    let mut base = Config::default();
    apply_env_overrides(&mut base, lookup)?;
    let Some(file_layer) = file_layer else {
        return Ok(base);
    };
    let mut merged = serde_json::to_value(&base).context("serialize base config")?;
    merge_layer(&mut merged, file_layer);
    serde_json::from_value(merged).context("parse config")
}

/// Recursive object merge. Tagged sections (objects carrying `kind`) are
/// replaced whole so variants never mix.
fn merge_layer(base: &mut Value, layer: Value) {
    match (base, layer) {
        (Value::Object(base), Value::Object(layer)) => {
            for (key, value) in layer {
                if value.get("kind").is_none() {
                    if let Some(existing) = base.get_mut(&key) {
                        merge_layer(existing, value);
                        continue;
                    }
                }
                base.insert(key, value);
            }
        }
        (base, layer) => *base = layer,
    }
}

fn read_config_value(path: &Path) -> Result<Value> {
    let bytes = fs::read(path).with_context(|| format!("read config {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("parse config JSON {}", path.display()))
}

/// Persist a config in a stable JSON format.
pub fn write_config(path: &Path, config: &Config) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let text = serde_json::to_string_pretty(config).context("serialize config")?;
    fs::write(path, text.as_bytes()).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

/// Apply environment overrides. The lookup is injected so tests do not touch
/// the process environment.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(command) = lookup(ENV_LM_COMMAND).filter(|v| !v.trim().is_empty()) {
        config.provider = ProviderConfig::Command { command };
    }
    if let Some(raw) = lookup(ENV_RETRIEVAL_WEIGHTS) {
        config.retrieval.weights =
            parse_weights(&raw).with_context(|| format!("parse {ENV_RETRIEVAL_WEIGHTS}"))?;
    }
    if let Some(raw) = lookup(ENV_MAX_RESULTS) {
        config.retrieval.max_results = raw
            .trim()
            .parse()
            .with_context(|| format!("parse {ENV_MAX_RESULTS}={raw:?}"))?;
    }
    if let Some(raw) = lookup(ENV_CONFIDENCE_THRESHOLD) {
        config.retrieval.confidence_threshold = raw
            .trim()
            .parse()
            .with_context(|| format!("parse {ENV_CONFIDENCE_THRESHOLD}={raw:?}"))?;
    }
    Ok(())
}

/// Parse `semantic,keyword,pattern,historical` weights.
pub fn parse_weights(raw: &str) -> Result<ScoreWeights> {
    let values = raw
        .split(',')
        .map(|part| part.trim().parse::<f64>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("weights must be comma-separated numbers")?;
    let [semantic, keyword, pattern, historical] = values[..] else {
        return Err(anyhow!(
            "expected 4 weights (semantic,keyword,pattern,historical), got {}",
            values.len()
        ));
    };
    let weights = ScoreWeights {
        semantic,
        keyword,
        pattern,
        historical,
    };
    weights.validate()?;
    Ok(weights)
}

/// Validate schema version and value ranges.
pub fn validate_config(config: &Config) -> Result<()> {
    if config.schema_version != CONFIG_SCHEMA_VERSION {
        return Err(anyhow!(
            "unsupported config schema_version {}",
            config.schema_version
        ));
    }
    config.retrieval.weights.validate()?;
    if config.retrieval.max_results < 1 {
        return Err(ValidationError::MaxResults(config.retrieval.max_results).into());
    }
    let threshold = config.retrieval.confidence_threshold;
    if !(0.0..=1.0).contains(&threshold) {
        return Err(ValidationError::Threshold(threshold).into());
    }
    let rate = config.feedback.learning_rate;
    if !(rate > 0.0 && rate <= 1.0) {
        return Err(ValidationError::LearningRate(rate).into());
    }
    if config.generation.timeout_secs == 0 {
        return Err(anyhow!("generation.timeout_secs must be positive"));
    }
    if !(0.0..=1.0).contains(&config.generation.review_threshold) {
        return Err(anyhow!(
            "generation.review_threshold must be between 0 and 1, got {}",
            config.generation.review_threshold
        ));
    }
    if config.generation.review_attempts == 0 {
        return Err(anyhow!("generation.review_attempts must be at least 1"));
    }
    match &config.provider {
        ProviderConfig::Command { command } if command.trim().is_empty() => {
            return Err(anyhow!("provider.command must be non-empty"));
        }
        ProviderConfig::Openai { model, .. } | ProviderConfig::Ollama { model, .. }
            if model.trim().is_empty() =>
        {
            return Err(anyhow!("provider.model must be non-empty"));
        }
        _ => {}
    }
    if let EmbeddingConfig::Hashing { dimensions: 0 } | EmbeddingConfig::Openai { dimensions: 0, .. } =
        config.embedding
    {
        return Err(anyhow!("embedding.dimensions must be positive"));
    }
    Ok(())
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;

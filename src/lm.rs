//! Text-generation capability.
//!
//! Every backend implements [`TextGenerator`]: a prompt goes in, raw text comes
//! out, and failures are classified as [`ProviderError`]s so the workflow can
//! decide whether a step is lost or the whole run fails. Backends:
//!
//! - [`CommandGenerator`]: a local command (parsed via shell-words) that reads
//!   the prompt on stdin and writes the completion to stdout.
//! - [`HttpGenerator`]: OpenAI-compatible chat completions or Ollama.
//! - [`RetryingGenerator`]: wraps any backend and retries transient failures.

mod command;
mod http;
mod retry;

pub use command::CommandGenerator;
pub(crate) use http::http_agent;
pub use http::{classify_transport_error, HttpGenerator, HttpProtocol};
pub use retry::RetryingGenerator;

use crate::config::{Config, ProviderConfig};
use crate::error::ProviderError;
use crate::util::clean_text;
use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;

/// Per-call generation options.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionOptions {
    /// System instructions; command backends receive them prepended to the prompt.
    pub system: Option<String>,
    pub temperature: f64,
    pub max_tokens: u32,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            system: None,
            temperature: 0.1,
            max_tokens: 4000,
        }
    }
}

/// A text-generation backend.
pub trait TextGenerator: Send + Sync {
    fn complete(&self, prompt: &str, options: &CompletionOptions) -> Result<String, ProviderError>;

    /// Short identifier recorded in provider call logs.
    fn name(&self) -> String;
}

impl<T: TextGenerator + ?Sized> TextGenerator for Box<T> {
    fn complete(&self, prompt: &str, options: &CompletionOptions) -> Result<String, ProviderError> {
        (**self).complete(prompt, options)
    }

    fn name(&self) -> String {
        (**self).name()
    }
}

/// Build the configured backend wrapped in retry handling.
pub fn build_generator(config: &Config) -> Box<dyn TextGenerator> {
    let timeout = Duration::from_secs(config.generation.timeout_secs);
    let inner: Box<dyn TextGenerator> = match &config.provider {
        ProviderConfig::Command { command } => {
            Box::new(CommandGenerator::new(command.clone(), timeout))
        }
        ProviderConfig::Openai {
            base_url,
            model,
            api_key_env,
        } => Box::new(HttpGenerator::new(
            HttpProtocol::OpenAiChat {
                api_key_env: api_key_env.clone(),
            },
            base_url.clone(),
            model.clone(),
            timeout,
        )),
        ProviderConfig::Ollama { base_url, model } => Box::new(HttpGenerator::new(
            HttpProtocol::Ollama,
            base_url.clone(),
            model.clone(),
            timeout,
        )),
    };
    Box::new(RetryingGenerator::new(
        inner,
        config.generation.provider_retries,
        Duration::from_millis(config.generation.retry_backoff_ms),
    ))
}

/// Extract a JSON object from free-form model output.
///
/// Code fences win; otherwise the span from the first `{` to the last `}`.
pub fn extract_json(text: &str) -> Option<&str> {
    let text = strip_code_fences(text);
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&text[start..=end])
}

/// Return the body of the first fenced block, or the trimmed text.
pub fn strip_code_fences(text: &str) -> &str {
    let text = text.trim();

    if let Some(start) = text.find("```") {
        let start = start + 3;
        // Skip language identifier if present
        let start = text[start..]
            .find('\n')
            .map(|i| start + i + 1)
            .unwrap_or(start);
        if let Some(end) = text[start..].find("```") {
            return text[start..start + end].trim();
        }
        return text[start..].trim();
    }

    text
}

static THINK_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<think>.*?</think>").expect("regex for think blocks"));

static HASH_COMMENT_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)--#.*?--#").expect("regex for --# comment blocks"));

/// Remove `<think>...</think>` reasoning blocks emitted by some local models.
pub fn strip_think(text: &str) -> String {
    THINK_BLOCK.replace_all(text, "").into_owned()
}

/// Turn a raw step completion into SQL text: reasoning blocks, code fences and
/// `--# ... --#` annotation blocks are removed and whitespace is normalized.
pub fn clean_sql_response(text: &str) -> String {
    let without_think = strip_think(text);
    let unfenced = strip_code_fences(&without_think);
    let without_blocks = HASH_COMMENT_BLOCK.replace_all(unfenced, "");
    clean_text(&without_blocks)
}

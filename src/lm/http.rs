//! HTTP backends: OpenAI-compatible chat completions and Ollama generate.

use super::{strip_think, CompletionOptions, TextGenerator};
use crate::error::{ProviderError, ProviderErrorKind};
use crate::util::truncate_string;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::{Duration, Instant};

const MAX_BODY_IN_ERROR: usize = 500;

/// Wire protocol spoken by an [`HttpGenerator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpProtocol {
    /// `POST {base_url}/chat/completions` with a bearer key read from `api_key_env`.
    OpenAiChat { api_key_env: String },
    /// `POST {base_url}/api/generate` with `stream: false`.
    Ollama,
}

pub struct HttpGenerator {
    protocol: HttpProtocol,
    base_url: String,
    model: String,
    agent: ureq::Agent,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    #[serde(default)]
    response: String,
}

/// Agent that returns non-2xx responses instead of erroring, so status codes
/// can be classified with their bodies.
pub(crate) fn http_agent(timeout: Duration) -> ureq::Agent {
    ureq::Agent::config_builder()
        .timeout_global(Some(timeout))
        .http_status_as_error(false)
        .build()
        .into()
}

/// Map a transport-level failure onto a provider error kind.
pub fn classify_transport_error(err: ureq::Error) -> ProviderError {
    match err {
        ureq::Error::Timeout(_) => ProviderError::timeout(err.to_string()),
        ureq::Error::StatusCode(code) => classify_status(code, ""),
        _ => ProviderError::unreachable(err.to_string()),
    }
}

/// Map an HTTP status onto a provider error kind.
pub(crate) fn classify_status(code: u16, body: &str) -> ProviderError {
    let detail = truncate_string(body.trim(), MAX_BODY_IN_ERROR);
    match code {
        401 | 403 => ProviderError::new(
            ProviderErrorKind::Auth,
            format!("HTTP {code}: invalid or missing API key {detail}"),
        ),
        429 => ProviderError::new(
            ProviderErrorKind::Quota,
            format!("HTTP {code}: rate limit or quota exceeded {detail}"),
        ),
        408 | 504 => ProviderError::timeout(format!("HTTP {code} {detail}")),
        _ => ProviderError::unreachable(format!("HTTP {code} {detail}")),
    }
}

impl HttpGenerator {
    pub fn new(
        protocol: HttpProtocol,
        base_url: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            protocol,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            agent: http_agent(timeout),
        }
    }

    fn post(&self, path: &str, bearer: Option<&str>, body: &Value) -> Result<Value, ProviderError> {
        let url = format!("{}{path}", self.base_url);
        let mut request = self.agent.post(&url);
        if let Some(key) = bearer {
            request = request.header("Authorization", format!("Bearer {key}"));
        }
        let mut response = request.send_json(body).map_err(classify_transport_error)?;
        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let text = response.body_mut().read_to_string().unwrap_or_default();
            return Err(classify_status(status, &text));
        }
        response
            .body_mut()
            .read_json::<Value>()
            .map_err(|err| ProviderError::unreachable(format!("decode response from {url}: {err}")))
    }

    fn complete_chat(
        &self,
        api_key_env: &str,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<String, ProviderError> {
        let key = std::env::var(api_key_env).map_err(|_| {
            ProviderError::new(
                ProviderErrorKind::Auth,
                format!("environment variable {api_key_env} is not set"),
            )
        })?;
        let mut messages = Vec::new();
        if let Some(system) = &options.system {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({"role": "user", "content": prompt}));
        let body = json!({
            "model": self.model,
            "messages": messages,
            "temperature": options.temperature,
            "max_tokens": options.max_tokens,
        });
        let value = self.post("/chat/completions", Some(&key), &body)?;
        let parsed: ChatResponse = serde_json::from_value(value).map_err(|err| {
            ProviderError::unreachable(format!("unexpected chat completion shape: {err}"))
        })?;
        Ok(parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default())
    }

    fn complete_ollama(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<String, ProviderError> {
        let mut body = json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
            "options": {
                "temperature": options.temperature,
                "num_predict": options.max_tokens,
            },
        });
        if let Some(system) = &options.system {
            body["system"] = Value::String(system.clone());
        }
        let value = self.post("/api/generate", None, &body)?;
        let parsed: OllamaResponse = serde_json::from_value(value).map_err(|err| {
            ProviderError::unreachable(format!("unexpected ollama response shape: {err}"))
        })?;
        Ok(strip_think(&parsed.response).trim().to_string())
    }
}

impl TextGenerator for HttpGenerator {
    fn complete(&self, prompt: &str, options: &CompletionOptions) -> Result<String, ProviderError> {
        let start = Instant::now();
        let result = match &self.protocol {
            HttpProtocol::OpenAiChat { api_key_env } => {
                self.complete_chat(api_key_env, prompt, options)
            }
            HttpProtocol::Ollama => self.complete_ollama(prompt, options),
        };
        tracing::info!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            prompt_bytes = prompt.len(),
            response_bytes = result.as_ref().map(|text| text.len()).unwrap_or(0),
            ok = result.is_ok(),
            model = %self.model,
            "lm invoke complete"
        );
        result
    }

    fn name(&self) -> String {
        match self.protocol {
            HttpProtocol::OpenAiChat { .. } => format!("openai:{}", self.model),
            HttpProtocol::Ollama => format!("ollama:{}", self.model),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_kinds() {
        assert_eq!(classify_status(401, "").kind, ProviderErrorKind::Auth);
        assert_eq!(classify_status(403, "").kind, ProviderErrorKind::Auth);
        assert_eq!(classify_status(429, "").kind, ProviderErrorKind::Quota);
        assert_eq!(classify_status(504, "").kind, ProviderErrorKind::Timeout);
        assert_eq!(classify_status(500, "").kind, ProviderErrorKind::Unreachable);
        assert_eq!(classify_status(503, "").kind, ProviderErrorKind::Unreachable);
    }

    #[test]
    fn missing_api_key_is_auth_error() {
        let generator = HttpGenerator::new(
            HttpProtocol::OpenAiChat {
                api_key_env: "SRF2SQL_TEST_KEY_THAT_IS_NEVER_SET".to_string(),
            },
            "http://127.0.0.1:1/v1",
            "gpt-test",
            Duration::from_secs(1),
        );
        let err = generator
            .complete("x", &CompletionOptions::default())
            .expect_err("no key");
        assert_eq!(err.kind, ProviderErrorKind::Auth);
    }

    #[test]
    fn refused_connection_is_unreachable() {
        let generator = HttpGenerator::new(
            HttpProtocol::Ollama,
            "http://127.0.0.1:1",
            "qwen3",
            Duration::from_secs(2),
        );
        let err = generator
            .complete("x", &CompletionOptions::default())
            .expect_err("nothing listens on port 1");
        assert!(err.is_transient());
    }

    #[test]
    fn names_include_model() {
        let generator = HttpGenerator::new(
            HttpProtocol::Ollama,
            "http://localhost:11434/",
            "qwen3",
            Duration::from_secs(1),
        );
        assert_eq!(generator.name(), "ollama:qwen3");
        assert_eq!(generator.base_url, "http://localhost:11434");
    }
}

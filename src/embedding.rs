//! Embedding capability.
//!
//! Text is mapped to a fixed-dimension vector so request texts can be compared
//! by cosine similarity. The local [`HashingEmbedder`] needs no network access
//! and is deterministic, which keeps retrieval reproducible in tests; the
//! [`HttpEmbedder`] talks to an OpenAI-compatible `/embeddings` endpoint.

use crate::config::EmbeddingConfig;
use crate::error::EmbeddingError;
use crate::lm::http_agent;
use crate::retrieval::signals::words;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;

/// Maps text to a vector.
pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    fn dimensions(&self) -> usize;

    /// Identifier stored alongside persisted vectors.
    fn model_id(&self) -> String;
}

impl<T: Embedder + ?Sized> Embedder for Box<T> {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        (**self).embed(text)
    }

    fn dimensions(&self) -> usize {
        (**self).dimensions()
    }

    fn model_id(&self) -> String {
        (**self).model_id()
    }
}

pub fn build_embedder(config: &EmbeddingConfig, timeout: Duration) -> Box<dyn Embedder> {
    match config {
        EmbeddingConfig::Hashing { dimensions } => Box::new(HashingEmbedder::new(*dimensions)),
        EmbeddingConfig::Openai {
            base_url,
            model,
            api_key_env,
            dimensions,
        } => Box::new(HttpEmbedder::new(
            base_url.clone(),
            model.clone(),
            api_key_env.clone(),
            *dimensions,
            timeout,
        )),
    }
}

/// Feature-hashing embedder over word unigrams and bigrams.
///
/// Terms are hashed with FNV-1a into fixed buckets, weighted by term frequency,
/// and the result is L2-normalized.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }

    fn bucket(term: &str, dims: usize) -> usize {
        let mut h: u64 = 0xcbf29ce484222325;
        for b in term.as_bytes() {
            h ^= *b as u64;
            h = h.wrapping_mul(0x100000001b3);
        }
        (h % dims as u64) as usize
    }
}

impl Embedder for HashingEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let tokens = words(text);
        if tokens.is_empty() {
            return Err(EmbeddingError::EmptyInput);
        }

        let mut weights: HashMap<String, f32> = HashMap::new();
        for tok in &tokens {
            *weights.entry(tok.clone()).or_default() += 1.0;
        }
        for pair in tokens.windows(2) {
            *weights.entry(format!("{} {}", pair[0], pair[1])).or_default() += 0.5;
        }

        let mut vec = vec![0.0f32; self.dimensions];
        for (term, weight) in &weights {
            vec[Self::bucket(term, self.dimensions)] += weight;
        }

        let norm: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for v in &mut vec {
                *v /= norm;
            }
        }
        Ok(vec)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_id(&self) -> String {
        format!("hashing-v1-{}", self.dimensions)
    }
}

/// OpenAI-compatible embeddings endpoint.
pub struct HttpEmbedder {
    base_url: String,
    model: String,
    api_key_env: String,
    dimensions: usize,
    agent: ureq::Agent,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

impl HttpEmbedder {
    pub fn new(
        base_url: String,
        model: String,
        api_key_env: String,
        dimensions: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            api_key_env,
            dimensions,
            agent: http_agent(timeout),
        }
    }
}

impl Embedder for HttpEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::EmptyInput);
        }
        let key = std::env::var(&self.api_key_env).map_err(|_| {
            EmbeddingError::Provider(format!(
                "environment variable {} is not set",
                self.api_key_env
            ))
        })?;
        let url = format!("{}/embeddings", self.base_url);
        let mut response = self
            .agent
            .post(&url)
            .header("Authorization", format!("Bearer {key}"))
            .send_json(json!({"model": self.model, "input": text}))
            .map_err(|err| EmbeddingError::Provider(err.to_string()))?;
        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(EmbeddingError::Provider(format!("HTTP {status} from {url}")));
        }
        let parsed: EmbeddingResponse = response
            .body_mut()
            .read_json()
            .map_err(|err| EmbeddingError::Provider(format!("decode embedding: {err}")))?;
        let vector = parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| EmbeddingError::Provider("empty embedding response".to_string()))?;
        if vector.len() != self.dimensions {
            return Err(EmbeddingError::DimensionMismatch {
                expected: self.dimensions,
                actual: vector.len(),
            });
        }
        Ok(vector)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_id(&self) -> String {
        format!("openai:{}", self.model)
    }
}

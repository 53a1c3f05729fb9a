//! Example store: historical SRF/SQL pairs with precomputed embeddings.
//!
//! Base examples are immutable once loaded. Success rates written by feedback
//! live in a concurrent overlay keyed by example id, so readers only contend
//! with writers touching the same example.

use crate::embedding::Embedder;
use crate::error::{EmbeddingError, ValidationError};
use crate::retrieval::signals::detect_markers;
use crate::util::clean_text;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::Path;

pub const STORE_SCHEMA_VERSION: u32 = 1;

/// Success rate given to freshly ingested examples.
pub const INITIAL_SUCCESS_RATE: f64 = 0.5;

/// A historical request/SQL pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Example {
    pub id: String,
    pub request_text: String,
    pub sql_text: String,
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub historical_success_rate: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    /// Supporting table text the pair was written against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supporting_schema: Option<String>,
}

/// Read-mostly access to stored examples.
pub trait ExampleStore: Send + Sync {
    /// All examples ordered by id, with current success rates.
    fn all(&self) -> Vec<Example>;

    fn get(&self, id: &str) -> Option<Example>;

    /// Rate the example was stored with, before any feedback.
    fn base_success_rate(&self, id: &str) -> Option<f64>;

    fn update_success_rate(&self, id: &str, rate: f64) -> Result<(), ValidationError>;
}

/// On-disk store format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreFile {
    pub schema_version: u32,
    pub embedding_model: String,
    pub dimensions: usize,
    pub examples: Vec<Example>,
}

pub struct InMemoryExampleStore {
    embedding_model: String,
    dimensions: usize,
    examples: Vec<Example>,
    index: HashMap<String, usize>,
    rates: DashMap<String, f64>,
}

impl InMemoryExampleStore {
    pub fn new(embedding_model: impl Into<String>, dimensions: usize, mut examples: Vec<Example>) -> Self {
        examples.sort_by(|a, b| a.id.cmp(&b.id));
        let index = examples
            .iter()
            .enumerate()
            .map(|(idx, ex)| (ex.id.clone(), idx))
            .collect();
        Self {
            embedding_model: embedding_model.into(),
            dimensions,
            examples,
            index,
            rates: DashMap::new(),
        }
    }

    pub fn from_file(file: StoreFile) -> Self {
        Self::new(file.embedding_model, file.dimensions, file.examples)
    }

    pub fn empty(dimensions: usize) -> Self {
        Self::new("none", dimensions, Vec::new())
    }

    pub fn embedding_model(&self) -> &str {
        &self.embedding_model
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    /// Vectors from different models are not comparable even when their
    /// dimensions agree. An empty store accepts any embedder.
    pub fn check_embedder(&self, embedder: &dyn Embedder) -> Result<(), EmbeddingError> {
        if self.is_empty() {
            return Ok(());
        }
        let model = embedder.model_id();
        if model != self.embedding_model {
            return Err(EmbeddingError::ModelMismatch {
                store: self.embedding_model.clone(),
                embedder: model,
            });
        }
        if embedder.dimensions() != self.dimensions {
            return Err(EmbeddingError::DimensionMismatch {
                expected: self.dimensions,
                actual: embedder.dimensions(),
            });
        }
        Ok(())
    }

    fn with_current_rate(&self, example: &Example) -> Example {
        let mut example = example.clone();
        if let Some(rate) = self.rates.get(&example.id) {
            example.historical_success_rate = *rate;
        }
        example
    }
}

impl ExampleStore for InMemoryExampleStore {
    fn all(&self) -> Vec<Example> {
        self.examples
            .iter()
            .map(|ex| self.with_current_rate(ex))
            .collect()
    }

    fn get(&self, id: &str) -> Option<Example> {
        self.index
            .get(id)
            .map(|idx| self.with_current_rate(&self.examples[*idx]))
    }

    fn base_success_rate(&self, id: &str) -> Option<f64> {
        self.index
            .get(id)
            .map(|idx| self.examples[*idx].historical_success_rate)
    }

    fn update_success_rate(&self, id: &str, rate: f64) -> Result<(), ValidationError> {
        if !(0.0..=1.0).contains(&rate) {
            return Err(ValidationError::SuccessRate(rate));
        }
        if !self.index.contains_key(id) {
            return Err(ValidationError::UnknownExample(id.to_string()));
        }
        self.rates.insert(id.to_string(), rate);
        Ok(())
    }
}

/// Load a store file and check that its vectors match the declared dimension.
pub fn load_store(path: &Path) -> Result<InMemoryExampleStore> {
    let bytes = fs::read(path).with_context(|| format!("read store {}", path.display()))?;
    let file: StoreFile = serde_json::from_slice(&bytes)
        .with_context(|| format!("parse store JSON {}", path.display()))?;
    if file.schema_version != STORE_SCHEMA_VERSION {
        return Err(anyhow!(
            "unsupported store schema_version {} in {}",
            file.schema_version,
            path.display()
        ));
    }
    for example in &file.examples {
        if example.embedding.len() != file.dimensions {
            return Err(EmbeddingError::DimensionMismatch {
                expected: file.dimensions,
                actual: example.embedding.len(),
            })
            .with_context(|| format!("example {} in {}", example.id, path.display()));
        }
    }
    tracing::info!(
        examples = file.examples.len(),
        model = %file.embedding_model,
        "loaded example store"
    );
    Ok(InMemoryExampleStore::from_file(file))
}

pub fn write_store(path: &Path, file: &StoreFile) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let text = serde_json::to_string_pretty(file).context("serialize store")?;
    fs::write(path, text.as_bytes()).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

/// One raw training pair as exported from the commission archive.
#[derive(Debug, Clone, Deserialize)]
pub struct RawPair {
    pub srf: String,
    pub sql: String,
    #[serde(default)]
    pub supporting_table: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Read JSONL pairs; corrupt lines are skipped with a warning.
pub fn load_pairs(path: &Path) -> Result<Vec<RawPair>> {
    let file = File::open(path).with_context(|| format!("open pairs {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut pairs = Vec::new();

    for (line_num, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("read line {} of pairs", line_num + 1))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<RawPair>(&line) {
            Ok(pair) => pairs.push(pair),
            Err(err) => {
                tracing::warn!(line = line_num + 1, error = %err, "skip corrupt pair");
            }
        }
    }
    Ok(pairs)
}

/// Clean, tag and embed raw pairs into a new store.
pub fn ingest(pairs: &[RawPair], embedder: &dyn Embedder) -> Result<StoreFile, EmbeddingError> {
    let mut examples = Vec::new();
    for pair in pairs {
        let request_text = clean_text(&pair.srf);
        let sql_text = clean_text(&pair.sql);
        if request_text.is_empty() || sql_text.is_empty() {
            tracing::warn!("skip pair with empty SRF or SQL");
            continue;
        }
        let embedding = embedder.embed(&request_text)?;
        let mut tags = detect_markers(&request_text);
        tags.extend(
            pair.tags
                .iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty()),
        );
        examples.push(Example {
            id: format!("ex-{:04}", examples.len() + 1),
            request_text,
            sql_text,
            embedding,
            tags,
            historical_success_rate: INITIAL_SUCCESS_RATE,
            last_used_at: None,
            supporting_schema: pair
                .supporting_table
                .as_deref()
                .map(clean_text)
                .filter(|s| !s.is_empty()),
        });
    }
    tracing::info!(
        pairs = pairs.len(),
        examples = examples.len(),
        "ingest complete"
    );
    Ok(StoreFile {
        schema_version: STORE_SCHEMA_VERSION,
        embedding_model: embedder.model_id(),
        dimensions: embedder.dimensions(),
        examples,
    })
}

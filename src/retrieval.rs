//! Multi-signal retrieval over the example store.
//!
//! Every stored example is scored on four signals, each in `[0, 1]`:
//!
//! - semantic: cosine similarity of request embeddings
//! - keyword: share of the query's non-stop-word tokens found in the example
//! - pattern: share of the query's business-pattern markers the example shares
//! - historical: the example's feedback-derived success rate
//!
//! The combined score is a weighted sum ([`ScoreWeights`]). Results are
//! threshold-filtered, ordered by combined score (ties: higher success rate,
//! then lower id) and truncated. An empty result means "no prior art" and is
//! not an error.

pub mod signals;

use crate::embedding::Embedder;
use crate::error::{EmbeddingError, ValidationError};
use crate::store::{Example, ExampleStore};
use serde::{Deserialize, Serialize};
use signals::{cosine_similarity, detect_markers, is_marker, keyword_score, keywords, pattern_score};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;

const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

/// Weights of the four signals in the combined score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScoreWeights {
    pub semantic: f64,
    pub keyword: f64,
    pub pattern: f64,
    pub historical: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            semantic: 0.5,
            keyword: 0.2,
            pattern: 0.2,
            historical: 0.1,
        }
    }
}

impl ScoreWeights {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let parts = [self.semantic, self.keyword, self.pattern, self.historical];
        let sum: f64 = parts.iter().sum();
        if parts.iter().any(|w| !w.is_finite() || *w < 0.0)
            || (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE
        {
            return Err(ValidationError::Weights(sum));
        }
        Ok(())
    }

    pub fn combine(&self, semantic: f64, keyword: f64, pattern: f64, historical: f64) -> f64 {
        (self.semantic * semantic
            + self.keyword * keyword
            + self.pattern * pattern
            + self.historical * historical)
            .clamp(0.0, 1.0)
    }
}

/// One retrieval request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalQuery {
    pub request_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supporting_schema_text: Option<String>,
    pub max_results: usize,
    pub confidence_threshold: f64,
}

impl RetrievalQuery {
    pub const DEFAULT_MAX_RESULTS: usize = 5;
    pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.7;

    pub fn new(
        request_text: impl Into<String>,
        max_results: usize,
        confidence_threshold: f64,
    ) -> Result<Self, ValidationError> {
        if max_results < 1 {
            return Err(ValidationError::MaxResults(max_results));
        }
        if !(0.0..=1.0).contains(&confidence_threshold) {
            return Err(ValidationError::Threshold(confidence_threshold));
        }
        Ok(Self {
            request_text: request_text.into(),
            supporting_schema_text: None,
            max_results,
            confidence_threshold,
        })
    }

    pub fn with_defaults(request_text: impl Into<String>) -> Self {
        Self {
            request_text: request_text.into(),
            supporting_schema_text: None,
            max_results: Self::DEFAULT_MAX_RESULTS,
            confidence_threshold: Self::DEFAULT_CONFIDENCE_THRESHOLD,
        }
    }

    pub fn with_schema(mut self, schema: Option<String>) -> Self {
        self.supporting_schema_text = schema.filter(|s| !s.trim().is_empty());
        self
    }
}

/// An example with its per-signal scores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredExample {
    pub example: Example,
    pub semantic_score: f64,
    pub keyword_score: f64,
    pub pattern_score: f64,
    pub historical_score: f64,
    pub combined_score: f64,
}

/// Overall judgement of how well the store covers a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityVerdict {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl std::fmt::Display for QualityVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Excellent => write!(f, "excellent"),
            Self::Good => write!(f, "good"),
            Self::Fair => write!(f, "fair"),
            Self::Poor => write!(f, "poor"),
        }
    }
}

/// Summary of the unfiltered candidate scores for one query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalQuality {
    pub candidates: usize,
    pub average_score: f64,
    pub above_threshold_ratio: f64,
    pub verdict: QualityVerdict,
    pub recommendation: String,
}

impl RetrievalQuality {
    pub fn assess(scored: &[ScoredExample], threshold: f64) -> Self {
        if scored.is_empty() {
            return Self {
                candidates: 0,
                average_score: 0.0,
                above_threshold_ratio: 0.0,
                verdict: QualityVerdict::Poor,
                recommendation: "Example store is empty; generation relies on schema and rules only."
                    .to_string(),
            };
        }
        let n = scored.len() as f64;
        let average_score = scored.iter().map(|s| s.combined_score).sum::<f64>() / n;
        let above = scored
            .iter()
            .filter(|s| s.combined_score >= threshold)
            .count();
        let above_threshold_ratio = above as f64 / n;
        let (verdict, recommendation) = if average_score >= 0.8 && above_threshold_ratio >= 0.6 {
            (QualityVerdict::Excellent, "Retrieved examples closely match the request.")
        } else if average_score >= 0.7 && above_threshold_ratio >= 0.4 {
            (QualityVerdict::Good, "Retrieved examples are relevant; review rates and dates.")
        } else if average_score >= 0.6 {
            (
                QualityVerdict::Fair,
                "Examples are loosely related; review the generated SQL carefully.",
            )
        } else {
            (
                QualityVerdict::Poor,
                "Few similar examples; consider adding comparable SRF/SQL pairs to the store.",
            )
        };
        Self {
            candidates: scored.len(),
            average_score,
            above_threshold_ratio,
            verdict,
            recommendation: recommendation.to_string(),
        }
    }
}

/// Scores and ranks stored examples for a request.
#[derive(Clone)]
pub struct RetrievalEngine {
    store: Arc<dyn ExampleStore>,
    embedder: Arc<dyn Embedder>,
    weights: ScoreWeights,
}

impl RetrievalEngine {
    pub fn new(
        store: Arc<dyn ExampleStore>,
        embedder: Arc<dyn Embedder>,
        weights: ScoreWeights,
    ) -> Self {
        Self {
            store,
            embedder,
            weights,
        }
    }

    pub fn weights(&self) -> ScoreWeights {
        self.weights
    }

    /// Ranked, threshold-filtered, truncated examples for `query`.
    pub fn retrieve(&self, query: &RetrievalQuery) -> Result<Vec<ScoredExample>, EmbeddingError> {
        let (retrieved, _) = self.retrieve_with_quality(query)?;
        Ok(retrieved)
    }

    /// Like [`retrieve`](Self::retrieve), also assessing the unfiltered candidates.
    pub fn retrieve_with_quality(
        &self,
        query: &RetrievalQuery,
    ) -> Result<(Vec<ScoredExample>, RetrievalQuality), EmbeddingError> {
        let candidates = self.score_all(query)?;
        let quality = RetrievalQuality::assess(&candidates, query.confidence_threshold);
        let retrieved: Vec<ScoredExample> = candidates
            .into_iter()
            .filter(|s| s.combined_score >= query.confidence_threshold)
            .take(query.max_results)
            .collect();
        tracing::info!(
            candidates = quality.candidates,
            retrieved = retrieved.len(),
            threshold = query.confidence_threshold,
            verdict = %quality.verdict,
            "retrieval complete"
        );
        Ok((retrieved, quality))
    }

    /// Every stored example scored and ranked, without filtering.
    pub fn score_all(&self, query: &RetrievalQuery) -> Result<Vec<ScoredExample>, EmbeddingError> {
        let examples = self.store.all();
        if examples.is_empty() {
            return Ok(Vec::new());
        }

        let query_vector = self.embedder.embed(&query.request_text)?;
        let query_keywords = keywords(&query.request_text);
        let query_markers = detect_markers(&query.request_text);

        let mut scored = Vec::with_capacity(examples.len());
        for example in examples {
            if example.embedding.len() != query_vector.len() {
                return Err(EmbeddingError::DimensionMismatch {
                    expected: example.embedding.len(),
                    actual: query_vector.len(),
                });
            }
            let semantic = cosine_similarity(&query_vector, &example.embedding);
            let keyword = keyword_score(&query_keywords, &keywords(&example.request_text));
            let pattern = pattern_score(&query_markers, &example_markers(&example));
            let historical = example.historical_success_rate.clamp(0.0, 1.0);
            let combined = self.weights.combine(semantic, keyword, pattern, historical);
            tracing::debug!(
                id = %example.id,
                semantic,
                keyword,
                pattern,
                historical,
                combined,
                "scored example"
            );
            scored.push(ScoredExample {
                example,
                semantic_score: semantic,
                keyword_score: keyword,
                pattern_score: pattern,
                historical_score: historical,
                combined_score: combined,
            });
        }
        scored.sort_by(rank_order);
        Ok(scored)
    }
}

fn example_markers(example: &Example) -> BTreeSet<String> {
    let mut markers = detect_markers(&example.request_text);
    markers.extend(example.tags.iter().filter(|t| is_marker(t)).cloned());
    markers
}

/// Combined score descending, then success rate descending, then id ascending.
fn rank_order(a: &ScoredExample, b: &ScoredExample) -> Ordering {
    b.combined_score
        .total_cmp(&a.combined_score)
        .then_with(|| b.historical_score.total_cmp(&a.historical_score))
        .then_with(|| a.example.id.cmp(&b.example.id))
}

#[cfg(test)]
#[path = "retrieval_tests.rs"]
mod tests;

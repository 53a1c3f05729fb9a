//! Error taxonomy for retrieval and the generation workflow.
//!
//! Each capability boundary has its own error enum so callers can tell a
//! provider outage from a malformed response. `StageError` is what a workflow
//! stage reports back to the orchestrator; it maps onto the `CauseKind` stored
//! in a failed run.
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure of the embedding capability.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EmbeddingError {
    #[error("cannot embed empty text")]
    EmptyInput,

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("embedding provider failed: {0}")]
    Provider(String),

    #[error("store was embedded with {store:?} but the configured embedder is {embedder:?}; re-run ingest")]
    ModelMismatch { store: String, embedder: String },
}

/// Failure classes of the text-generation capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProviderErrorKind {
    Timeout,
    Auth,
    Quota,
    Unreachable,
}

impl std::fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::Auth => write!(f, "auth"),
            Self::Quota => write!(f, "quota"),
            Self::Unreachable => write!(f, "unreachable"),
        }
    }
}

/// Failure of a single `complete` call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("provider {kind}: {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Timeout, message)
    }

    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Unreachable, message)
    }

    /// Transient failures are worth one more attempt; auth and quota are not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            ProviderErrorKind::Timeout | ProviderErrorKind::Unreachable
        )
    }
}

/// A provider response that could not be mapped onto the expected shape.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("SRF text is empty")]
    EmptyInput,

    #[error("response has no JSON object delimiters")]
    MissingDelimiters,

    #[error("response is not valid JSON at line {line}, column {column}: {message}")]
    InvalidJson {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("field `{field}` has unexpected type: {message}")]
    FieldType { field: String, message: String },

    #[error("response contained none of the metadata fields")]
    NoFields,
}

/// Failure while producing SQL steps.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GenerationError {
    #[error("provider unavailable while generating {category} step: {source}")]
    Provider {
        category: String,
        #[source]
        source: ProviderError,
    },

    #[error("provider returned no SQL for required {category} step")]
    EmptyContent { category: String },
}

/// Malformed feedback, query parameters, or configuration values.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("max_results must be at least 1 (got {0})")]
    MaxResults(usize),

    #[error("confidence_threshold must be within [0, 1] (got {0})")]
    Threshold(f64),

    #[error("score weights must be non-negative and sum to 1 (got {0})")]
    Weights(f64),

    #[error("unknown feedback outcome {0:?}")]
    UnknownOutcome(String),

    #[error("feedback must reference at least one example")]
    NoExamples,

    #[error("unknown example id {0:?}")]
    UnknownExample(String),

    #[error("success rate must be within [0, 1] (got {0})")]
    SuccessRate(f64),

    #[error("learning rate must be within (0, 1] (got {0})")]
    LearningRate(f64),
}

/// Script compilation failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CompileError {
    #[error("no compilable steps: all {0} steps failed syntax validation")]
    NoCompilableSteps(usize),
}

/// What ended a run, as recorded in `ErrorInfo`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CauseKind {
    Embedding,
    Provider,
    Parse,
    Generation,
    Validation,
    Compile,
    Cancelled,
}

impl std::fmt::Display for CauseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Embedding => write!(f, "EmbeddingError"),
            Self::Provider => write!(f, "ProviderError"),
            Self::Parse => write!(f, "ParseError"),
            Self::Generation => write!(f, "GenerationError"),
            Self::Validation => write!(f, "ValidationError"),
            Self::Compile => write!(f, "CompileError"),
            Self::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Unrecoverable failure reported by a workflow stage.
#[derive(Debug, Clone, Error)]
pub enum StageError {
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error("run cancelled before {0}")]
    Cancelled(String),
}

impl StageError {
    pub fn cause_kind(&self) -> CauseKind {
        match self {
            Self::Embedding(_) => CauseKind::Embedding,
            Self::Provider(_) => CauseKind::Provider,
            Self::Parse(_) => CauseKind::Parse,
            Self::Generation(_) => CauseKind::Generation,
            Self::Validation(_) => CauseKind::Validation,
            Self::Compile(_) => CauseKind::Compile,
            Self::Cancelled(_) => CauseKind::Cancelled,
        }
    }
}

//! Run state for one SRF submission.
//!
//! A [`WorkflowRun`] moves through the stages in a fixed order; every
//! transition is appended to `stage_log`, which is never rewritten. Provider
//! calls made on behalf of the run are kept alongside for `lm_log.jsonl`.

use super::metadata::Metadata;
use super::review::StructureReview;
use crate::error::{CauseKind, ProviderError, ProviderErrorKind, StageError};
use crate::lm::{CompletionOptions, TextGenerator};
use crate::retrieval::{RetrievalQuality, ScoredExample};
use crate::util::now_epoch_ms;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use uuid::Uuid;

pub const RUN_SCHEMA_VERSION: u32 = 1;
pub const PROVIDER_CALL_SCHEMA_VERSION: u32 = 1;

/// Workflow stage. `Done` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Extracting,
    Generating,
    Validating,
    Compiling,
    Reporting,
    Done,
    Failed,
}

impl Stage {
    /// The stage that follows on success.
    pub fn next(self) -> Option<Stage> {
        match self {
            Self::Extracting => Some(Self::Generating),
            Self::Generating => Some(Self::Validating),
            Self::Validating => Some(Self::Compiling),
            Self::Compiling => Some(Self::Reporting),
            Self::Reporting => Some(Self::Done),
            Self::Done | Self::Failed => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Extracting => write!(f, "EXTRACTING"),
            Self::Generating => write!(f, "GENERATING"),
            Self::Validating => write!(f, "VALIDATING"),
            Self::Compiling => write!(f, "COMPILING"),
            Self::Reporting => write!(f, "REPORTING"),
            Self::Done => write!(f, "DONE"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    Entered,
    Completed,
    Failed,
}

/// One entry of the append-only stage log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageEvent {
    pub stage: Stage,
    pub transition: Transition,
    pub at_epoch_ms: u64,
}

/// Why a run failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub stage: Stage,
    pub cause_kind: CauseKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationStatus {
    Pending,
    Passed,
    Warning,
    Failed,
}

impl std::fmt::Display for ValidationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Passed => write!(f, "PASSED"),
            Self::Warning => write!(f, "WARNING"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// Conceptual step categories, in script order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepCategory {
    Setup,
    Mapping,
    KpiFilter,
    Aggregation,
    Commission,
    FinalOutput,
    ValidationQueries,
}

impl StepCategory {
    pub const ALL: [StepCategory; 7] = [
        Self::Setup,
        Self::Mapping,
        Self::KpiFilter,
        Self::Aggregation,
        Self::Commission,
        Self::FinalOutput,
        Self::ValidationQueries,
    ];

    /// Setup and final output must always produce SQL.
    pub fn is_required(self) -> bool {
        matches!(self, Self::Setup | Self::FinalOutput)
    }

    /// Identifier used in prompts (`TASK: step_<slug>`) and logs.
    pub fn slug(self) -> &'static str {
        match self {
            Self::Setup => "setup",
            Self::Mapping => "mapping",
            Self::KpiFilter => "kpi_filter",
            Self::Aggregation => "aggregation",
            Self::Commission => "commission",
            Self::FinalOutput => "final_output",
            Self::ValidationQueries => "validation_queries",
        }
    }

    /// Step name written into the script.
    pub fn step_name(self) -> &'static str {
        match self {
            Self::Setup => "SETUP",
            Self::Mapping => "MAPPING",
            Self::KpiFilter => "KPI_FILTER",
            Self::Aggregation => "AGGREGATION",
            Self::Commission => "COMMISSION_CALCULATION",
            Self::FinalOutput => "FINAL_OUTPUT",
            Self::ValidationQueries => "VALIDATION_QUERIES",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::Setup => "Drop and recreate working tables; clean input data",
            Self::Mapping => "Map receivers (dealers, retailers, agents) to the commission channel",
            Self::KpiFilter => "Filter KPI transactions to the campaign period and KPI types",
            Self::Aggregation => "Aggregate KPI values per receiver",
            Self::Commission => "Apply commission rates, slabs and bonus rules",
            Self::FinalOutput => "Produce the final payout table",
            Self::ValidationQueries => "Sanity-check totals and row counts",
        }
    }
}

impl std::fmt::Display for StepCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.slug())
    }
}

/// One generated SQL step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlStep {
    pub order: u32,
    pub category: StepCategory,
    pub name: String,
    pub description: String,
    pub sql_text: String,
    pub validation_status: ValidationStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review: Option<StructureReview>,
}

/// A step left out of the compiled script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedStep {
    pub order: u32,
    pub name: String,
    pub reason: String,
}

/// Scores of an example used for generation; the vector itself is omitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedExample {
    pub id: String,
    pub combined_score: f64,
    pub semantic_score: f64,
    pub keyword_score: f64,
    pub pattern_score: f64,
    pub historical_score: f64,
}

impl From<&ScoredExample> for RetrievedExample {
    fn from(scored: &ScoredExample) -> Self {
        Self {
            id: scored.example.id.clone(),
            combined_score: scored.combined_score,
            semantic_score: scored.semantic_score,
            keyword_score: scored.keyword_score,
            pattern_score: scored.pattern_score,
            historical_score: scored.historical_score,
        }
    }
}

/// A single call to the text-generation capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderCall {
    pub schema_version: u32,
    pub ts: u64,
    pub stage: Stage,
    /// `metadata`, `metadata_retry`, `step_<category>` or `review_<category>`.
    pub purpose: String,
    pub provider: String,
    pub duration_ms: u64,
    pub prompt_bytes: usize,
    pub response_bytes: usize,
    pub succeeded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ProviderErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Call the generator and record the call in `calls`.
pub fn invoke_provider(
    generator: &dyn TextGenerator,
    stage: Stage,
    purpose: &str,
    prompt: &str,
    options: &CompletionOptions,
    calls: &mut Vec<ProviderCall>,
) -> Result<String, ProviderError> {
    let ts = now_epoch_ms();
    let start = Instant::now();
    let result = generator.complete(prompt, options);
    let duration_ms = start.elapsed().as_millis() as u64;
    calls.push(ProviderCall {
        schema_version: PROVIDER_CALL_SCHEMA_VERSION,
        ts,
        stage,
        purpose: purpose.to_string(),
        provider: generator.name(),
        duration_ms,
        prompt_bytes: prompt.len(),
        response_bytes: result.as_ref().map(|text| text.len()).unwrap_or(0),
        succeeded: result.is_ok(),
        error_kind: result.as_ref().err().map(|err| err.kind),
        error: result.as_ref().err().map(|err| err.to_string()),
    });
    result
}

/// Full state of one workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub schema_version: u32,
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub srf_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supporting_schema_text: Option<String>,
    pub stage: Stage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    #[serde(default)]
    pub retrieved: Vec<RetrievedExample>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retrieval_quality: Option<RetrievalQuality>,
    #[serde(default)]
    pub steps: Vec<SqlStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compiled_script: Option<String>,
    #[serde(default)]
    pub skipped_steps: Vec<SkippedStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    /// Recovered conditions worth showing in the report.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
    pub stage_log: Vec<StageEvent>,
    #[serde(default)]
    pub provider_calls: Vec<ProviderCall>,
}

impl WorkflowRun {
    pub fn new(srf_text: impl Into<String>, supporting_schema_text: Option<String>) -> Self {
        Self {
            schema_version: RUN_SCHEMA_VERSION,
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            srf_text: srf_text.into(),
            supporting_schema_text,
            stage: Stage::Extracting,
            metadata: None,
            retrieved: Vec::new(),
            retrieval_quality: None,
            steps: Vec::new(),
            compiled_script: None,
            skipped_steps: Vec::new(),
            report: None,
            error: None,
            notes: Vec::new(),
            stage_log: Vec::new(),
            provider_calls: Vec::new(),
        }
    }

    /// Whether `stage` may be entered from the current state.
    pub fn can_enter(&self, stage: Stage) -> bool {
        if self.stage.is_terminal() || stage.is_terminal() {
            return false;
        }
        if self.stage_log.is_empty() {
            return stage == Stage::Extracting;
        }
        self.stage.next() == Some(stage)
    }

    pub(crate) fn enter(&mut self, stage: Stage) {
        debug_assert!(self.can_enter(stage), "illegal transition {} -> {stage}", self.stage);
        self.stage = stage;
        self.log(stage, Transition::Entered);
        tracing::info!(run_id = %self.run_id, stage = %stage, "stage entered");
    }

    pub(crate) fn complete(&mut self, stage: Stage) {
        self.log(stage, Transition::Completed);
        tracing::info!(run_id = %self.run_id, stage = %stage, "stage completed");
    }

    pub(crate) fn finish(&mut self) {
        self.stage = Stage::Done;
    }

    /// Record that `stage` failed and move to `Failed`. `stage` is the stage
    /// that was running, or the one about to be entered when the run stopped
    /// at a boundary.
    pub(crate) fn fail(&mut self, stage: Stage, err: &StageError) {
        self.log(stage, Transition::Failed);
        self.error = Some(ErrorInfo {
            stage,
            cause_kind: err.cause_kind(),
            message: err.to_string(),
        });
        self.stage = Stage::Failed;
        tracing::warn!(
            run_id = %self.run_id,
            stage = %stage,
            cause = %err.cause_kind(),
            error = %err,
            "stage failed"
        );
    }

    fn log(&mut self, stage: Stage, transition: Transition) {
        self.stage_log.push(StageEvent {
            stage,
            transition,
            at_epoch_ms: now_epoch_ms(),
        });
    }

    /// Stages in the order they were entered.
    pub fn stage_history(&self) -> Vec<Stage> {
        self.stage_log
            .iter()
            .filter(|event| event.transition == Transition::Entered)
            .map(|event| event.stage)
            .collect()
    }

    pub fn succeeded(&self) -> bool {
        self.stage == Stage::Done
    }

    pub fn used_example_ids(&self) -> Vec<String> {
        self.retrieved.iter().map(|r| r.id.clone()).collect()
    }
}

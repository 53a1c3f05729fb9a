//! Generation workflow: SRF text to a compiled SQL script and report.
//!
//! The orchestrator drives five stages strictly in order:
//!
//! ```text
//! EXTRACTING -> GENERATING -> VALIDATING -> COMPILING -> REPORTING -> DONE
//! ```
//!
//! Retrieval and context assembly happen inside EXTRACTING. Any stage error
//! moves the run to FAILED with `{stage, cause_kind, message}` and no later
//! stage runs; a report is still rendered for the failed run. Provider
//! retries live at the provider boundary and structural regeneration inside
//! the step generator, never here.

pub mod compile;
pub mod metadata;
pub mod report;
pub mod review;
pub mod run;
pub mod steps;
pub mod validate;

use crate::config::Config;
use crate::context::{ContextBuilder, GenerationContext};
use crate::error::StageError;
use crate::lm::{CompletionOptions, TextGenerator};
use crate::retrieval::{RetrievalEngine, RetrievalQuery};
use compile::ScriptCompiler;
use metadata::{Metadata, MetadataExtractor};
use report::ReportGenerator;
use review::ReviewSettings;
use run::{RetrievedExample, Stage, WorkflowRun};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use steps::StepGenerator;
use validate::StepValidator;

const SYSTEM_PROMPT: &str = "You are an expert Oracle SQL developer who writes telecom commission calculation scripts.";

/// Cooperative cancellation, checked at every stage boundary.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-run input.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub srf_text: String,
    pub supporting_schema_text: Option<String>,
    pub max_results: Option<usize>,
    pub confidence_threshold: Option<f64>,
}

impl RunRequest {
    pub fn new(srf_text: impl Into<String>) -> Self {
        Self {
            srf_text: srf_text.into(),
            ..Self::default()
        }
    }
}

/// Knobs shared by every run of an orchestrator.
#[derive(Debug, Clone)]
pub struct WorkflowSettings {
    pub max_results: usize,
    pub confidence_threshold: f64,
    pub static_rules: Vec<String>,
    pub completion: CompletionOptions,
    pub parse_retries: u32,
    pub review: ReviewSettings,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            max_results: RetrievalQuery::DEFAULT_MAX_RESULTS,
            confidence_threshold: RetrievalQuery::DEFAULT_CONFIDENCE_THRESHOLD,
            static_rules: Vec::new(),
            completion: CompletionOptions {
                system: Some(SYSTEM_PROMPT.to_string()),
                ..CompletionOptions::default()
            },
            parse_retries: 1,
            review: ReviewSettings::default(),
        }
    }
}

impl WorkflowSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_results: config.retrieval.max_results,
            confidence_threshold: config.retrieval.confidence_threshold,
            static_rules: config.static_rules.clone(),
            completion: CompletionOptions {
                system: Some(SYSTEM_PROMPT.to_string()),
                temperature: config.generation.temperature,
                max_tokens: config.generation.max_tokens,
            },
            parse_retries: config.generation.parse_retries,
            review: ReviewSettings {
                enabled: config.generation.structure_review,
                threshold: config.generation.review_threshold,
                max_attempts: config.generation.review_attempts,
            },
        }
    }
}

/// A stage error paired with the stage it is charged to.
struct StageFailure {
    stage: Stage,
    error: StageError,
}

/// Owns the collaborators; each call to [`run`](Self::run) is an independent run.
pub struct WorkflowOrchestrator {
    retrieval: RetrievalEngine,
    generator: Arc<dyn TextGenerator>,
    settings: WorkflowSettings,
}

impl WorkflowOrchestrator {
    pub fn new(
        retrieval: RetrievalEngine,
        generator: Arc<dyn TextGenerator>,
        settings: WorkflowSettings,
    ) -> Self {
        Self {
            retrieval,
            generator,
            settings,
        }
    }

    /// Execute one run to DONE or FAILED. Never panics on stage errors; the
    /// returned run always carries a report.
    pub fn run(&self, request: RunRequest, cancel: &CancellationToken) -> WorkflowRun {
        let mut run = WorkflowRun::new(
            request.srf_text.clone(),
            request
                .supporting_schema_text
                .clone()
                .filter(|s| !s.trim().is_empty()),
        );
        tracing::info!(run_id = %run.run_id, srf_bytes = run.srf_text.len(), "run started");

        if let Err(failure) = self.run_stages(&mut run, &request, cancel) {
            run.fail(failure.stage, &failure.error);
            run.report = Some(ReportGenerator.render(&run));
        }
        tracing::info!(run_id = %run.run_id, stage = %run.stage, "run finished");
        run
    }

    fn run_stages(
        &self,
        run: &mut WorkflowRun,
        request: &RunRequest,
        cancel: &CancellationToken,
    ) -> Result<(), StageFailure> {
        let (metadata, context) = self.stage(run, Stage::Extracting, cancel, |this, run| {
            this.extract(run, request)
        })?;

        self.stage(run, Stage::Generating, cancel, |this, run| {
            let generator = StepGenerator::new(
                this.generator.as_ref(),
                &this.settings.completion,
                &this.settings.review,
            );
            let mut calls = Vec::new();
            let mut notes = Vec::new();
            let result = generator.generate(&metadata, &context, &mut calls, &mut notes);
            run.provider_calls.extend(calls);
            run.notes.extend(notes);
            run.steps = result?;
            Ok(())
        })?;

        self.stage(run, Stage::Validating, cancel, |_, run| {
            StepValidator.validate(&mut run.steps, &metadata);
            Ok(())
        })?;

        self.stage(run, Stage::Compiling, cancel, |_, run| {
            let compiled =
                ScriptCompiler.compile(&run.steps, &metadata, run.run_id, run.started_at)?;
            run.compiled_script = Some(compiled.script);
            run.skipped_steps = compiled.skipped;
            Ok(())
        })?;

        self.stage(run, Stage::Reporting, cancel, |_, run| {
            run.report = Some(ReportGenerator.render(run));
            Ok(())
        })?;

        run.finish();
        Ok(())
    }

    /// Enter `stage`, run `body`, and record completion. A cancelled token
    /// stops the run before the stage is entered.
    fn stage<T, F>(
        &self,
        run: &mut WorkflowRun,
        stage: Stage,
        cancel: &CancellationToken,
        body: F,
    ) -> Result<T, StageFailure>
    where
        F: FnOnce(&Self, &mut WorkflowRun) -> Result<T, StageError>,
    {
        let failed = |error| StageFailure { stage, error };
        if cancel.is_cancelled() {
            return Err(failed(StageError::Cancelled(stage.to_string())));
        }
        run.enter(stage);
        let value = body(self, run).map_err(failed)?;
        run.complete(stage);
        Ok(value)
    }

    fn extract(
        &self,
        run: &mut WorkflowRun,
        request: &RunRequest,
    ) -> Result<(Metadata, GenerationContext), StageError> {
        MetadataExtractor::check_input(&request.srf_text)?;

        let query = RetrievalQuery::new(
            request.srf_text.clone(),
            request.max_results.unwrap_or(self.settings.max_results),
            request
                .confidence_threshold
                .unwrap_or(self.settings.confidence_threshold),
        )?
        .with_schema(run.supporting_schema_text.clone());
        let (retrieved, quality) = self.retrieval.retrieve_with_quality(&query)?;
        run.retrieved = retrieved.iter().map(RetrievedExample::from).collect();
        run.retrieval_quality = Some(quality);

        let context = ContextBuilder.build(
            retrieved,
            query.supporting_schema_text.as_deref(),
            &self.settings.static_rules,
        );
        if !context.has_prior_art() {
            run.notes.push(
                "No prior art: no stored example met the confidence threshold.".to_string(),
            );
        }

        let extractor = MetadataExtractor::new(
            self.generator.as_ref(),
            &self.settings.completion,
            self.settings.parse_retries,
        );
        let mut calls = Vec::new();
        let result = extractor.extract(&request.srf_text, &context, &mut calls);
        run.provider_calls.extend(calls);
        let metadata = result?;
        run.metadata = Some(metadata.clone());
        Ok((metadata, context))
    }
}

#[cfg(test)]
#[path = "workflow_tests.rs"]
mod tests;

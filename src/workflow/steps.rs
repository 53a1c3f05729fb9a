//! Step generation: one provider call per applicable step category, plus a
//! structural review round trip per attempt when prior art was retrieved.

use super::metadata::Metadata;
use super::review::{render_correction, ReviewSettings, StructureReview, StructureReviewer};
use super::run::{invoke_provider, ProviderCall, SqlStep, Stage, StepCategory, ValidationStatus};
use crate::context::GenerationContext;
use crate::error::GenerationError;
use crate::retrieval::ScoredExample;
use crate::lm::{clean_sql_response, CompletionOptions, TextGenerator};

const STEP_PROMPT: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/prompts/step.md"));

/// Categories the metadata justifies, in script order. Setup, final output
/// and validation queries are always planned.
pub fn plan_categories(metadata: &Metadata) -> Vec<StepCategory> {
    StepCategory::ALL
        .into_iter()
        .filter(|category| match category {
            StepCategory::Setup | StepCategory::FinalOutput | StepCategory::ValidationQueries => {
                true
            }
            StepCategory::Mapping => {
                !metadata.mapping_rules.is_empty() || metadata.receiver_channel.is_some()
            }
            StepCategory::KpiFilter => !metadata.kpi_list.is_empty(),
            StepCategory::Aggregation => {
                !metadata.kpi_list.is_empty() || !metadata.calculation_rules.is_empty()
            }
            StepCategory::Commission => {
                !metadata.calculation_rules.is_empty() || !metadata.bonus_rules.is_empty()
            }
        })
        .collect()
}

fn render_previous(steps: &[SqlStep]) -> String {
    if steps.is_empty() {
        return "None yet; this is the first step.".to_string();
    }
    steps
        .iter()
        .map(|step| format!("-- STEP {}: {}\n{}", step.order, step.name, step.sql_text))
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub fn build_step_prompt(
    category: StepCategory,
    order: u32,
    metadata: &Metadata,
    context: &GenerationContext,
    previous: &[SqlStep],
    correction: Option<&str>,
) -> String {
    let correction = match correction {
        Some(hint) => format!("\n# Structure review of the previous attempt\n\n{hint}\n"),
        None => String::new(),
    };
    let metadata_json =
        serde_json::to_string_pretty(metadata).unwrap_or_else(|_| "{}".to_string());
    STEP_PROMPT
        .replace("{category_slug}", category.slug())
        .replace("{step_order}", &order.to_string())
        .replace("{step_name}", category.step_name())
        .replace("{step_description}", category.description())
        .replace("{metadata_json}", &metadata_json)
        .replace("{previous_queries}", &render_previous(previous))
        .replace("{examples}", &context.render_examples())
        .replace("{schema}", &context.render_schema())
        .replace("{rules}", &context.render_rules())
        .replace("{correction}", &correction)
}

/// Second workflow stage.
pub struct StepGenerator<'a> {
    generator: &'a dyn TextGenerator,
    options: &'a CompletionOptions,
    review: &'a ReviewSettings,
}

impl<'a> StepGenerator<'a> {
    pub fn new(
        generator: &'a dyn TextGenerator,
        options: &'a CompletionOptions,
        review: &'a ReviewSettings,
    ) -> Self {
        Self {
            generator,
            options,
            review,
        }
    }

    /// Generate steps with `order` assigned from 1. Optional categories that
    /// come back empty are dropped and noted in `notes`.
    pub fn generate(
        &self,
        metadata: &Metadata,
        context: &GenerationContext,
        calls: &mut Vec<ProviderCall>,
        notes: &mut Vec<String>,
    ) -> Result<Vec<SqlStep>, GenerationError> {
        let reference = if self.review.enabled && context.has_prior_art() {
            context.retrieved.first()
        } else {
            None
        };
        let mut steps: Vec<SqlStep> = Vec::new();
        for category in plan_categories(metadata) {
            let order = steps.len() as u32 + 1;
            let Some((sql_text, review)) =
                self.generate_step(category, order, metadata, context, &steps, reference, calls)?
            else {
                tracing::warn!(category = %category, "optional step returned no SQL, skipping");
                notes.push(format!(
                    "Optional {} step produced no SQL and was omitted.",
                    category.step_name()
                ));
                continue;
            };

            tracing::info!(
                category = %category,
                order,
                sql_bytes = sql_text.len(),
                score = review.as_ref().map(|r| r.score),
                "step generated"
            );
            steps.push(SqlStep {
                order,
                category,
                name: category.step_name().to_string(),
                description: category.description().to_string(),
                sql_text,
                validation_status: ValidationStatus::Pending,
                issues: Vec::new(),
                review,
            });
        }
        Ok(steps)
    }

    /// One step through up to `max_attempts` generate/review rounds. `None`
    /// means an optional step came back empty.
    #[allow(clippy::too_many_arguments)]
    fn generate_step(
        &self,
        category: StepCategory,
        order: u32,
        metadata: &Metadata,
        context: &GenerationContext,
        previous: &[SqlStep],
        reference: Option<&ScoredExample>,
        calls: &mut Vec<ProviderCall>,
    ) -> Result<Option<(String, Option<StructureReview>)>, GenerationError> {
        let provider_error = |source| GenerationError::Provider {
            category: category.slug().to_string(),
            source,
        };
        let max_attempts = match reference {
            Some(_) => self.review.max_attempts.max(1),
            None => 1,
        };
        let mut correction: Option<String> = None;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let prompt =
                build_step_prompt(category, order, metadata, context, previous, correction.as_deref());
            let response = invoke_provider(
                self.generator,
                Stage::Generating,
                &format!("step_{}", category.slug()),
                &prompt,
                self.options,
                calls,
            )
            .map_err(provider_error)?;

            let sql_text = clean_sql_response(&response);
            if sql_text.is_empty() {
                if category.is_required() {
                    return Err(GenerationError::EmptyContent {
                        category: category.slug().to_string(),
                    });
                }
                return Ok(None);
            }
            let Some(reference) = reference else {
                return Ok(Some((sql_text, None)));
            };

            let reviewer = StructureReviewer::new(self.generator, self.options);
            let Some(verdict) = reviewer
                .review(category, order, reference, &sql_text, calls)
                .map_err(provider_error)?
            else {
                return Ok(Some((sql_text, None)));
            };
            let review = StructureReview {
                reference_id: reference.example.id.clone(),
                passed: verdict.score >= self.review.threshold,
                score: verdict.score,
                differences: verdict.differences,
                attempts: attempt,
            };
            if review.passed {
                return Ok(Some((sql_text, Some(review))));
            }
            if attempt >= max_attempts {
                tracing::warn!(
                    category = %category,
                    score = review.score,
                    threshold = self.review.threshold,
                    attempts = attempt,
                    "step still below structure threshold, keeping last attempt"
                );
                return Ok(Some((sql_text, Some(review))));
            }
            tracing::info!(
                category = %category,
                attempt,
                score = review.score,
                threshold = self.review.threshold,
                "step below structure threshold, regenerating"
            );
            correction = Some(render_correction(&review));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> GenerationContext {
        GenerationContext {
            retrieved: Vec::new(),
            supporting_schema_text: None,
            tables: Vec::new(),
            static_rules: vec!["Terminate every statement with a semicolon.".to_string()],
        }
    }

    #[test]
    fn correction_section_only_when_present() {
        let metadata = Metadata::default();
        let plain = build_step_prompt(StepCategory::Setup, 1, &metadata, &context(), &[], None);
        assert!(plain.starts_with("TASK: step_setup\n"));
        assert!(!plain.contains("Structure review"));
        assert!(!plain.contains("{correction}"));

        let hinted = build_step_prompt(
            StepCategory::Setup,
            1,
            &metadata,
            &context(),
            &[],
            Some("Missing GROUP BY"),
        );
        assert!(hinted.contains("# Structure review of the previous attempt\n\nMissing GROUP BY\n"));
    }

    #[test]
    fn optional_categories_follow_metadata() {
        let bare = plan_categories(&Metadata::default());
        assert_eq!(
            bare,
            [
                StepCategory::Setup,
                StepCategory::FinalOutput,
                StepCategory::ValidationQueries
            ]
        );
        let metadata = Metadata {
            kpi_list: vec!["Airtime revenue".to_string()],
            ..Metadata::default()
        };
        assert!(plan_categories(&metadata).contains(&StepCategory::Aggregation));
        assert!(!plan_categories(&metadata).contains(&StepCategory::Commission));
    }
}

//! Script compilation: validated steps to one executable script.

use super::metadata::Metadata;
use super::run::{SkippedStep, SqlStep, ValidationStatus};
use crate::error::CompileError;
use chrono::{DateTime, Utc};
use uuid::Uuid;

const RULE: &str = "-- ============================================================";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledScript {
    pub script: String,
    pub included: Vec<u32>,
    pub skipped: Vec<SkippedStep>,
}

/// Fourth workflow stage.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScriptCompiler;

impl ScriptCompiler {
    /// Concatenate steps in `order`, leaving out FAILED ones. Fails only when
    /// nothing is left to compile.
    pub fn compile(
        &self,
        steps: &[SqlStep],
        metadata: &Metadata,
        run_id: Uuid,
        generated_at: DateTime<Utc>,
    ) -> Result<CompiledScript, CompileError> {
        let mut ordered: Vec<&SqlStep> = steps.iter().collect();
        ordered.sort_by_key(|step| step.order);

        let (compilable, failed): (Vec<&SqlStep>, Vec<&SqlStep>) = ordered
            .into_iter()
            .partition(|step| step.validation_status != ValidationStatus::Failed);
        if compilable.is_empty() {
            return Err(CompileError::NoCompilableSteps(steps.len()));
        }

        let skipped: Vec<SkippedStep> = failed
            .iter()
            .map(|step| SkippedStep {
                order: step.order,
                name: step.name.clone(),
                reason: if step.issues.is_empty() {
                    "failed syntax validation".to_string()
                } else {
                    step.issues.join("; ")
                },
            })
            .collect();
        for skip in &skipped {
            tracing::warn!(order = skip.order, name = %skip.name, reason = %skip.reason, "step skipped");
        }

        let mut script = String::new();
        script.push_str(RULE);
        script.push('\n');
        push_comment(
            &mut script,
            &format!(
                "Commission: {}",
                metadata.commission_name.as_deref().unwrap_or("Not specified")
            ),
        );
        push_comment(&mut script, &format!("Period: {}", metadata.period()));
        push_comment(
            &mut script,
            &format!(
                "Channel: {}",
                metadata.receiver_channel.as_deref().unwrap_or("Not specified")
            ),
        );
        push_comment(&mut script, &format!("Run: {run_id}"));
        push_comment(&mut script, &format!("Generated: {}", generated_at.to_rfc3339()));
        script.push_str(RULE);
        script.push('\n');

        for step in &compilable {
            script.push('\n');
            push_comment(&mut script, &format!("STEP {}: {}", step.order, step.name));
            if !step.description.is_empty() {
                push_comment(&mut script, &step.description);
            }
            if step.validation_status == ValidationStatus::Warning {
                for issue in &step.issues {
                    push_comment(&mut script, &format!("WARNING: {issue}"));
                }
            }
            script.push_str(step.sql_text.trim_end());
            script.push('\n');
        }

        script.push('\n');
        script.push_str(RULE);
        script.push('\n');
        push_comment(
            &mut script,
            &format!(
                "End of script: {} step(s) compiled, {} skipped",
                compilable.len(),
                skipped.len()
            ),
        );
        for skip in &skipped {
            push_comment(
                &mut script,
                &format!("SKIPPED STEP {}: {} ({})", skip.order, skip.name, skip.reason),
            );
        }
        script.push_str(RULE);
        script.push('\n');

        Ok(CompiledScript {
            script,
            included: compilable.iter().map(|step| step.order).collect(),
            skipped,
        })
    }
}

/// Single-line `-- ` comment. Line breaks in model-supplied text would
/// otherwise turn the remainder into executable SQL.
pub fn comment_line(text: &str) -> String {
    let flat = text
        .split(['\r', '\n'])
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    format!("-- {flat}")
}

fn push_comment(script: &mut String, text: &str) {
    script.push_str(&comment_line(text));
    script.push('\n');
}

/// Number of `-- STEP n:` block headers in a compiled script.
pub fn count_step_blocks(script: &str) -> usize {
    script
        .lines()
        .filter(|line| line.starts_with("-- STEP "))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::run::StepCategory;

    fn step(order: u32, category: StepCategory, status: ValidationStatus) -> SqlStep {
        SqlStep {
            order,
            category,
            name: category.step_name().to_string(),
            description: category.description().to_string(),
            sql_text: format!("SELECT {order} FROM dual;"),
            validation_status: status,
            issues: if status == ValidationStatus::Passed {
                Vec::new()
            } else {
                vec![format!("issue in {order}")]
            },
            review: None,
        }
    }

    #[test]
    fn failed_step_is_left_out_and_recorded() {
        let steps = vec![
            step(1, StepCategory::Setup, ValidationStatus::Passed),
            step(2, StepCategory::Mapping, ValidationStatus::Failed),
            step(3, StepCategory::FinalOutput, ValidationStatus::Warning),
        ];
        let compiled = ScriptCompiler
            .compile(&steps, &Metadata::default(), Uuid::nil(), Utc::now())
            .expect("compile");
        assert_eq!(count_step_blocks(&compiled.script), 2);
        assert_eq!(compiled.included, [1, 3]);
        assert_eq!(compiled.skipped.len(), 1);
        assert_eq!(compiled.skipped[0].order, 2);
        assert!(!compiled.script.contains("SELECT 2 FROM dual;"));
        assert!(compiled.script.contains("-- WARNING: issue in 3"));
        assert!(compiled.script.contains("-- SKIPPED STEP 2: MAPPING"));
    }

    #[test]
    fn steps_are_emitted_in_order() {
        let steps = vec![
            step(3, StepCategory::FinalOutput, ValidationStatus::Passed),
            step(1, StepCategory::Setup, ValidationStatus::Passed),
            step(2, StepCategory::Aggregation, ValidationStatus::Passed),
        ];
        let compiled = ScriptCompiler
            .compile(&steps, &Metadata::default(), Uuid::nil(), Utc::now())
            .expect("compile");
        let first = compiled.script.find("-- STEP 1:").expect("step 1");
        let second = compiled.script.find("-- STEP 2:").expect("step 2");
        let third = compiled.script.find("-- STEP 3:").expect("step 3");
        assert!(first < second && second < third);
        assert!(compiled.script.contains("-- Commission: Not specified"));
    }

    #[test]
    fn metadata_line_breaks_stay_inside_comments() {
        let metadata = Metadata {
            commission_name: Some("June Plan\nDELETE FROM payouts;".to_string()),
            receiver_channel: Some("Dealer\r\nUPDATE dealers SET tier = 1;".to_string()),
            start_date: Some("2024-06-01\nDROP TABLE payouts;".to_string()),
            ..Metadata::default()
        };
        let mut warned = step(2, StepCategory::KpiFilter, ValidationStatus::Warning);
        warned.issues = vec!["no date-range predicate for\nTRUNCATE TABLE kpi;".to_string()];
        let steps = vec![step(1, StepCategory::Setup, ValidationStatus::Passed), warned];

        let compiled = ScriptCompiler
            .compile(&steps, &metadata, Uuid::nil(), Utc::now())
            .expect("compile");
        let executable: Vec<&str> = compiled
            .script
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with("--"))
            .collect();
        assert_eq!(executable, ["SELECT 1 FROM dual;", "SELECT 2 FROM dual;"]);
        assert!(compiled
            .script
            .contains("-- Commission: June Plan DELETE FROM payouts;"));
    }

    #[test]
    fn comment_line_flattens_breaks() {
        assert_eq!(comment_line("a\r\n\nb "), "-- a b");
        assert_eq!(comment_line("plain"), "-- plain");
    }

    #[test]
    fn nothing_compilable_is_an_error() {
        let steps = vec![
            step(1, StepCategory::Setup, ValidationStatus::Failed),
            step(2, StepCategory::FinalOutput, ValidationStatus::Failed),
        ];
        assert_eq!(
            ScriptCompiler.compile(&steps, &Metadata::default(), Uuid::nil(), Utc::now()),
            Err(CompileError::NoCompilableSteps(2))
        );
    }
}

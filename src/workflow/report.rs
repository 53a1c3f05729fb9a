//! Markdown run report. Rendering never fails and covers failed runs too.

use super::run::{Stage, WorkflowRun};

fn cell(text: &str) -> String {
    text.replace('|', "\\|").replace('\n', " ")
}

/// "0 steps skipped.", "1 step skipped.", "3 steps skipped."
pub fn skipped_line(count: usize) -> String {
    if count == 1 {
        "1 step skipped.".to_string()
    } else {
        format!("{count} steps skipped.")
    }
}

/// Fifth workflow stage.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReportGenerator;

impl ReportGenerator {
    pub fn render(&self, run: &WorkflowRun) -> String {
        let mut out = String::new();
        // The report is rendered while REPORTING, just before the run is marked DONE.
        let status = match run.stage {
            Stage::Failed => "FAILED".to_string(),
            Stage::Reporting | Stage::Done => "DONE".to_string(),
            other => format!("IN PROGRESS ({other})"),
        };
        let history = run
            .stage_history()
            .iter()
            .map(|stage| stage.to_string())
            .collect::<Vec<_>>()
            .join(" -> ");

        out.push_str("# SRF to SQL run report\n\n");
        out.push_str(&format!("- Run: `{}`\n", run.run_id));
        out.push_str(&format!("- Status: {status}\n"));
        out.push_str(&format!("- Started: {}\n", run.started_at.to_rfc3339()));
        out.push_str(&format!("- Stages: {history}\n"));

        if let Some(error) = &run.error {
            out.push_str("\n## Failure\n\n");
            out.push_str(&format!("- Stage: {}\n", error.stage));
            out.push_str(&format!("- Cause: {}\n", error.cause_kind));
            out.push_str(&format!("- Message: {}\n", error.message));
            out.push_str("\nNo script was produced from the failed stage onward.\n");
        }

        if let Some(metadata) = &run.metadata {
            out.push_str("\n## Metadata\n\n| Field | Value |\n| --- | --- |\n");
            let text = |value: &Option<String>| {
                value
                    .as_deref()
                    .map(cell)
                    .unwrap_or_else(|| "Not specified".to_string())
            };
            let list = |values: &[String]| {
                if values.is_empty() {
                    "Not specified".to_string()
                } else {
                    cell(&values.join("; "))
                }
            };
            out.push_str(&format!("| Commission | {} |\n", text(&metadata.commission_name)));
            out.push_str(&format!("| Period | {} |\n", cell(&metadata.period())));
            out.push_str(&format!("| Channel | {} |\n", text(&metadata.receiver_channel)));
            out.push_str(&format!("| KPIs | {} |\n", list(&metadata.kpi_list)));
            out.push_str(&format!("| Mapping rules | {} |\n", list(&metadata.mapping_rules)));
            out.push_str(&format!(
                "| Calculation rules | {} |\n",
                list(&metadata.calculation_rules)
            ));
            out.push_str(&format!("| Bonus rules | {} |\n", list(&metadata.bonus_rules)));
        }

        if let Some(quality) = &run.retrieval_quality {
            out.push_str("\n## Retrieval\n\n");
            out.push_str(&format!(
                "Quality: {} (average score {:.2} over {} candidates, {:.0}% above threshold). {}\n\n",
                quality.verdict,
                quality.average_score,
                quality.candidates,
                quality.above_threshold_ratio * 100.0,
                quality.recommendation
            ));
            if run.retrieved.is_empty() {
                out.push_str("No prior art: no example met the confidence threshold; generation used the schema and business rules only.\n");
            } else {
                out.push_str("| Example | Combined | Semantic | Keyword | Pattern | Historical |\n| --- | --- | --- | --- | --- | --- |\n");
                for r in &run.retrieved {
                    out.push_str(&format!(
                        "| {} | {:.2} | {:.2} | {:.2} | {:.2} | {:.2} |\n",
                        r.id,
                        r.combined_score,
                        r.semantic_score,
                        r.keyword_score,
                        r.pattern_score,
                        r.historical_score
                    ));
                }
            }
        }

        if !run.steps.is_empty() {
            out.push_str("\n## Steps\n\n| # | Step | Status | Structure | Issues |\n| --- | --- | --- | --- | --- |\n");
            for step in &run.steps {
                let issues = if step.issues.is_empty() {
                    "-".to_string()
                } else {
                    cell(&step.issues.join("; "))
                };
                let structure = match &step.review {
                    Some(review) => format!("{:.2} ({} attempt(s))", review.score, review.attempts),
                    None => "-".to_string(),
                };
                out.push_str(&format!(
                    "| {} | {} | {} | {} | {} |\n",
                    step.order, step.name, step.validation_status, structure, issues
                ));
            }
        }

        out.push_str("\n## Compilation\n\n");
        if run.compiled_script.is_some() {
            out.push_str(&skipped_line(run.skipped_steps.len()));
            out.push('\n');
            for skip in &run.skipped_steps {
                out.push_str(&format!(
                    "- Step {} {} skipped: {}\n",
                    skip.order, skip.name, skip.reason
                ));
            }
        } else {
            out.push_str("No script was compiled.\n");
        }

        if !run.notes.is_empty() {
            out.push_str("\n## Notes\n\n");
            for note in &run.notes {
                out.push_str(&format!("- {note}\n"));
            }
        }

        let failed_calls = run.provider_calls.iter().filter(|c| !c.succeeded).count();
        let total_ms: u64 = run.provider_calls.iter().map(|c| c.duration_ms).sum();
        out.push_str(&format!(
            "\n## Provider calls\n\n{} call(s), {} failed, {} ms total.\n",
            run.provider_calls.len(),
            failed_calls,
            total_ms
        ));
        out
    }
}

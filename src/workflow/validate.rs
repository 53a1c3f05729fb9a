//! Step validation.
//!
//! Syntax problems (unbalanced parentheses or quotes, missing terminator,
//! no statements) mark a step FAILED and keep it out of the script. Domain
//! findings (missing date predicates, KPI filters that name no KPI,
//! destructive statements outside setup, a structure review that never
//! reached its threshold) mark it WARNING; the step still compiles and the
//! finding is surfaced in the report.

use super::metadata::Metadata;
use super::run::{SqlStep, StepCategory, ValidationStatus};
use regex::Regex;
use std::sync::LazyLock;

static DESTRUCTIVE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(DROP|TRUNCATE|DELETE|ALTER)\b").expect("regex for destructive statements")
});

static DATE_PREDICATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bBETWEEN\b|\bTO_DATE\b|\bADD_MONTHS\b|\bTRUNC\s*\(|\bDATE\s*''|>=|<=")
        .expect("regex for date predicates")
});

/// SQL with comments removed and string literals emptied, plus any syntax issues.
#[derive(Debug, Default, PartialEq, Eq)]
struct Scan {
    code: String,
    issues: Vec<String>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Code,
    LineComment,
    BlockComment,
    SingleQuote,
    DoubleQuote,
}

fn scan(sql: &str) -> Scan {
    let chars: Vec<char> = sql.chars().collect();
    let mut code = String::with_capacity(sql.len());
    let mut issues = Vec::new();
    let mut state = ScanState::Code;
    let mut depth: i64 = 0;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match state {
            ScanState::Code => match (c, next) {
                ('-', Some('-')) => {
                    state = ScanState::LineComment;
                    i += 1;
                }
                ('/', Some('*')) => {
                    state = ScanState::BlockComment;
                    i += 1;
                }
                ('\'', _) => {
                    state = ScanState::SingleQuote;
                    code.push('\'');
                }
                ('"', _) => {
                    state = ScanState::DoubleQuote;
                    code.push('"');
                }
                ('(', _) => {
                    depth += 1;
                    code.push(c);
                }
                (')', _) => {
                    depth -= 1;
                    if depth < 0 {
                        issues.push("closing parenthesis without matching opening parenthesis".to_string());
                        depth = 0;
                    }
                    code.push(c);
                }
                _ => code.push(c),
            },
            ScanState::LineComment => {
                if c == '\n' {
                    state = ScanState::Code;
                    code.push('\n');
                }
            }
            ScanState::BlockComment => {
                if c == '*' && next == Some('/') {
                    state = ScanState::Code;
                    code.push(' ');
                    i += 1;
                }
            }
            ScanState::SingleQuote => {
                if c == '\'' {
                    if next == Some('\'') {
                        i += 1;
                    } else {
                        state = ScanState::Code;
                        code.push('\'');
                    }
                }
            }
            ScanState::DoubleQuote => {
                if c == '"' {
                    state = ScanState::Code;
                    code.push('"');
                }
            }
        }
        i += 1;
    }

    match state {
        ScanState::SingleQuote => issues.push("unterminated string literal".to_string()),
        ScanState::DoubleQuote => issues.push("unterminated quoted identifier".to_string()),
        ScanState::BlockComment => issues.push("unterminated block comment".to_string()),
        ScanState::Code | ScanState::LineComment => {}
    }
    if depth > 0 {
        issues.push(format!("{depth} unclosed parenthesis(es)"));
    }
    Scan { code, issues }
}

fn syntax_issues(sql: &str, scanned: &Scan) -> Vec<String> {
    let mut issues = scanned.issues.clone();
    let code = scanned.code.trim();
    if sql.trim().is_empty() || code.is_empty() {
        issues.push("step contains no SQL statements".to_string());
        return issues;
    }
    if !(code.ends_with(';') || code.ends_with('/')) {
        issues.push("final statement is not terminated with ';'".to_string());
    }
    issues
}

fn kpi_terms(kpi: &str) -> Vec<String> {
    kpi.split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|w| w.chars().count() >= 3)
        .map(|w| w.to_lowercase())
        .collect()
}

fn domain_issues(step: &SqlStep, scanned: &Scan, metadata: &Metadata) -> Vec<String> {
    let mut issues = Vec::new();

    if step.category != StepCategory::Setup {
        let mut found: Vec<String> = DESTRUCTIVE
            .find_iter(&scanned.code)
            .map(|m| m.as_str().to_uppercase())
            .collect();
        found.sort();
        found.dedup();
        if !found.is_empty() {
            issues.push(format!(
                "destructive statement ({}) outside the setup step",
                found.join(", ")
            ));
        }
    }

    if metadata.has_dates()
        && matches!(step.category, StepCategory::KpiFilter | StepCategory::Aggregation)
    {
        let mentions_date = [&metadata.start_date, &metadata.end_date]
            .into_iter()
            .flatten()
            .any(|date| step.sql_text.contains(date.as_str()));
        if !mentions_date && !DATE_PREDICATE.is_match(&scanned.code) {
            issues.push(format!(
                "no date-range predicate for the campaign period ({})",
                metadata.period()
            ));
        }
    }

    if step.category == StepCategory::KpiFilter && !metadata.kpi_list.is_empty() {
        let sql = step.sql_text.to_lowercase();
        let referenced = metadata
            .kpi_list
            .iter()
            .flat_map(|kpi| kpi_terms(kpi.as_str()))
            .any(|term| sql.contains(&term));
        if !referenced {
            issues.push(format!(
                "KPI filter references none of the KPIs: {}",
                metadata.kpi_list.join(", ")
            ));
        }
    }

    if let Some(review) = step.review.as_ref().filter(|r| !r.passed) {
        issues.push(format!(
            "structure differs from {} (score {:.2} after {} attempts)",
            review.reference_id, review.score, review.attempts
        ));
    }

    issues
}

/// Third workflow stage. Never fails; findings are recorded on each step.
#[derive(Debug, Default, Clone, Copy)]
pub struct StepValidator;

impl StepValidator {
    pub fn validate(&self, steps: &mut [SqlStep], metadata: &Metadata) {
        for step in steps.iter_mut() {
            let scanned = scan(&step.sql_text);
            let syntax = syntax_issues(&step.sql_text, &scanned);
            let domain = domain_issues(step, &scanned, metadata);
            step.validation_status = if !syntax.is_empty() {
                ValidationStatus::Failed
            } else if !domain.is_empty() {
                ValidationStatus::Warning
            } else {
                ValidationStatus::Passed
            };
            step.issues = syntax.into_iter().chain(domain).collect();
            tracing::info!(
                order = step.order,
                name = %step.name,
                status = %step.validation_status,
                issues = step.issues.len(),
                "step validated"
            );
        }
    }
}

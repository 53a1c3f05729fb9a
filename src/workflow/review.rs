//! Structural review of generated steps against the best retrieved example.
//!
//! Both SQL texts are masked first: literals become `VALUE_X`, table
//! references become `TABLE_X`, comments go and whitespace collapses. The
//! provider then scores how closely the step follows the reference's flow of
//! SQL blocks. A score below the threshold sends the step back for
//! regeneration with the reported differences as a hint.

use super::run::{invoke_provider, ProviderCall, Stage, StepCategory};
use crate::error::{ParseError, ProviderError};
use crate::lm::{extract_json, CompletionOptions, TextGenerator};
use crate::retrieval::ScoredExample;
use crate::util::truncate_string;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::LazyLock;

const REVIEW_PROMPT: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/prompts/review.md"));
const MAX_REFERENCE_BYTES: usize = 6000;

static STRING_LITERAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"'[^']*'").expect("regex for string literals"));
static LINE_COMMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"--[^\n]*").expect("regex for line comments"));
static BLOCK_COMMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)/\*.*?\*/").expect("regex for block comments"));
static DATE_LITERAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b\d{1,2}-[A-Za-z]{3}-\d{2,4}\b").expect("regex for date literals")
});
static NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d+(?:\.\d+)?\b").expect("regex for numbers"));
static TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\w$#.]+|\s+|[^\w\s]").expect("regex for SQL tokens"));
static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("regex for whitespace"));

const TABLE_KEYWORDS: &[&str] = &["FROM", "JOIN", "INTO", "TABLE", "UPDATE", "USING", "EXEC"];
const CLAUSE_KEYWORDS: &[&str] = &[
    "WHERE", "ON", "SET", "SELECT", "GROUP", "ORDER", "HAVING", "VALUES", "UNION", "MINUS",
    "INTERSECT", "LEFT", "RIGHT", "INNER", "OUTER", "FULL", "CROSS", "NATURAL", "CONNECT",
    "START", "PARTITION", "WHEN", "THEN", "AS",
];

/// Review knobs; the loop is skipped when disabled or nothing was retrieved.
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewSettings {
    pub enabled: bool,
    pub threshold: f64,
    /// Generations per step, including the first.
    pub max_attempts: u32,
}

impl Default for ReviewSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 0.7,
            max_attempts: 3,
        }
    }
}

/// Outcome of the last review of a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructureReview {
    pub reference_id: String,
    pub score: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub differences: Vec<String>,
    pub attempts: u32,
    pub passed: bool,
}

/// Parsed reviewer response.
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewVerdict {
    pub score: f64,
    pub differences: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum TableScan {
    Idle,
    ExpectTable,
    AfterTable,
    AfterAlias,
}

fn is_keyword(upper: &str) -> bool {
    TABLE_KEYWORDS.contains(&upper) || CLAUSE_KEYWORDS.contains(&upper)
}

/// Replace table names after FROM, JOIN, INTO and friends, including
/// comma-separated lists with aliases.
fn mask_tables(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut state = TableScan::Idle;
    for token in TOKEN.find_iter(text).map(|m| m.as_str()) {
        if token.trim().is_empty() {
            out.push_str(token);
            continue;
        }
        let upper = token.to_ascii_uppercase();
        let is_name =
            token.starts_with(|c: char| c.is_alphabetic() || c == '_') && !is_keyword(&upper);
        let masked = state == TableScan::ExpectTable && is_name;
        state = match state {
            TableScan::ExpectTable if is_name => TableScan::AfterTable,
            TableScan::AfterTable if upper == "AS" => TableScan::AfterTable,
            TableScan::AfterTable if is_name => TableScan::AfterAlias,
            TableScan::AfterTable | TableScan::AfterAlias if token == "," => TableScan::ExpectTable,
            _ if TABLE_KEYWORDS.contains(&upper.as_str()) => TableScan::ExpectTable,
            _ => TableScan::Idle,
        };
        out.push_str(if masked { "TABLE_X" } else { token });
    }
    out
}

/// Mask literals, table names and comments so only the block structure remains.
pub fn normalize_sql(sql: &str) -> String {
    let text = STRING_LITERAL.replace_all(sql, "'VALUE_X'");
    let text = BLOCK_COMMENT.replace_all(&text, " ");
    let text = LINE_COMMENT.replace_all(&text, " ");
    let text = DATE_LITERAL.replace_all(&text, "VALUE_X");
    let text = NUMBER.replace_all(&text, "VALUE_X");
    let text = mask_tables(&text);
    WHITESPACE.replace_all(&text, " ").trim().to_string()
}

fn score_of(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Parse `{"confident_score": <0..1>, "differences": [...]}`.
pub fn parse_review_response(text: &str) -> Result<ReviewVerdict, ParseError> {
    let json = extract_json(text).ok_or(ParseError::MissingDelimiters)?;
    let value: Value = serde_json::from_str(json).map_err(|err| ParseError::InvalidJson {
        line: err.line(),
        column: err.column(),
        message: err.to_string(),
    })?;
    let raw = value
        .get("confident_score")
        .or_else(|| value.get("score"))
        .ok_or(ParseError::NoFields)?;
    let score = score_of(raw)
        .filter(|s| (0.0..=1.0).contains(s))
        .ok_or_else(|| ParseError::FieldType {
            field: "confident_score".to_string(),
            message: format!("expected a number between 0 and 1, got {raw}"),
        })?;
    let differences = match value.get("differences") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::String(s)) if s.trim().is_empty() => Vec::new(),
        Some(Value::String(s)) => vec![s.trim().to_string()],
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => s.trim().to_string(),
                other => other.to_string(),
            })
            .filter(|s| !s.is_empty())
            .collect(),
        Some(other) => {
            return Err(ParseError::FieldType {
                field: "differences".to_string(),
                message: format!("expected a list of strings, got {other}"),
            })
        }
    };
    Ok(ReviewVerdict { score, differences })
}

pub fn build_review_prompt(
    category: StepCategory,
    order: u32,
    reference: &ScoredExample,
    generated_sql: &str,
) -> String {
    let reference_sql = normalize_sql(&reference.example.sql_text);
    REVIEW_PROMPT
        .replace("{category_slug}", category.slug())
        .replace("{step_order}", &order.to_string())
        .replace("{step_name}", category.step_name())
        .replace("{step_description}", category.description())
        .replace("{reference_id}", &reference.example.id)
        .replace("{reference_sql}", &truncate_string(&reference_sql, MAX_REFERENCE_BYTES))
        .replace("{generated_sql}", &normalize_sql(generated_sql))
}

/// Hint appended to the step prompt after a failed review.
pub fn render_correction(review: &StructureReview) -> String {
    let mut out = format!(
        "The previous attempt scored {:.2} against the structure of {}.",
        review.score, review.reference_id
    );
    if review.differences.is_empty() {
        out.push_str(" Follow the reference's sequence of SQL blocks more closely.");
    } else {
        out.push_str(" Fix these differences:");
        for diff in &review.differences {
            out.push_str(&format!("\n- {diff}"));
        }
    }
    out
}

pub struct StructureReviewer<'a> {
    generator: &'a dyn TextGenerator,
    options: &'a CompletionOptions,
}

impl<'a> StructureReviewer<'a> {
    pub fn new(generator: &'a dyn TextGenerator, options: &'a CompletionOptions) -> Self {
        Self { generator, options }
    }

    /// Score one step. `Ok(None)` means the response could not be read; the
    /// caller keeps the step as generated.
    pub fn review(
        &self,
        category: StepCategory,
        order: u32,
        reference: &ScoredExample,
        generated_sql: &str,
        calls: &mut Vec<ProviderCall>,
    ) -> Result<Option<ReviewVerdict>, ProviderError> {
        let prompt = build_review_prompt(category, order, reference, generated_sql);
        let response = invoke_provider(
            self.generator,
            Stage::Generating,
            &format!("review_{}", category.slug()),
            &prompt,
            self.options,
            calls,
        )?;
        match parse_review_response(&response) {
            Ok(verdict) => Ok(Some(verdict)),
            Err(err) => {
                tracing::warn!(category = %category, error = %err, "review response unparseable, keeping step");
                Ok(None)
            }
        }
    }
}

//! Metadata extraction: SRF text to structured commission metadata.
//!
//! The provider is asked for a JSON object. Parsing is strict about shape
//! (an object with at least one recognised field) and lenient about values:
//! "Not specified" style placeholders become absent, list fields accept a
//! single string, and dates are normalised to `YYYY-MM-DD` when recognisable.

use super::run::{invoke_provider, ProviderCall, Stage};
use crate::context::GenerationContext;
use crate::error::{ParseError, StageError};
use crate::lm::{extract_json, CompletionOptions, TextGenerator};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

const METADATA_PROMPT: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/prompts/metadata.md"));
const RETRY_PARSE_PROMPT: &str =
    include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/prompts/retry_parse.md"));

const PLACEHOLDER_VALUES: &[&str] = &["", "not specified", "n/a", "na", "none", "null", "unknown", "-"];
// Two-digit years are tried first: `%Y` would read "24" as year 24.
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d-%b-%y", "%d-%b-%Y", "%d/%m/%Y"];
const MAX_PREVIOUS_RESPONSE_BYTES: usize = 4000;

/// Business-rule metadata; every field may be absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commission_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_channel: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kpi_list: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mapping_rules: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub calculation_rules: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bonus_rules: Vec<String>,
}

impl Metadata {
    pub fn is_empty(&self) -> bool {
        self == &Metadata::default()
    }

    pub fn has_dates(&self) -> bool {
        self.start_date.is_some() || self.end_date.is_some()
    }

    /// Human-readable campaign period.
    pub fn period(&self) -> String {
        match (&self.start_date, &self.end_date) {
            (Some(start), Some(end)) => format!("{start} to {end}"),
            (Some(start), None) => format!("from {start}"),
            (None, Some(end)) => format!("until {end}"),
            (None, None) => "Not specified".to_string(),
        }
    }
}

/// Parse a provider response into [`Metadata`].
pub fn parse_metadata_response(text: &str) -> Result<Metadata, ParseError> {
    let json = extract_json(text).ok_or(ParseError::MissingDelimiters)?;
    let value: Value = serde_json::from_str(json).map_err(|err| ParseError::InvalidJson {
        line: err.line(),
        column: err.column(),
        message: err.to_string(),
    })?;
    let Value::Object(raw) = value else {
        return Err(ParseError::FieldType {
            field: "<root>".to_string(),
            message: "expected a JSON object".to_string(),
        });
    };
    let fields: Map<String, Value> = raw
        .into_iter()
        .map(|(key, value)| (normalize_key(&key), value))
        .collect();

    let metadata = Metadata {
        commission_name: text_field(&fields, "commission_name")?,
        start_date: text_field(&fields, "start_date")?.map(|d| normalize_date(&d)),
        end_date: text_field(&fields, "end_date")?.map(|d| normalize_date(&d)),
        receiver_channel: text_field(&fields, "receiver_channel")?,
        kpi_list: list_field(&fields, "kpi_list")?,
        mapping_rules: list_field(&fields, "mapping_rules")?,
        calculation_rules: list_field(&fields, "calculation_rules")?,
        bonus_rules: list_field(&fields, "bonus_rules")?,
    };
    if metadata.is_empty() {
        return Err(ParseError::NoFields);
    }
    Ok(metadata)
}

fn normalize_key(key: &str) -> String {
    key.trim().to_lowercase().replace([' ', '-'], "_")
}

fn is_placeholder(text: &str) -> bool {
    PLACEHOLDER_VALUES.contains(&text.trim().to_lowercase().as_str())
}

fn scalar_text(field: &str, value: &Value) -> Result<Option<String>, ParseError> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) if is_placeholder(s) => Ok(None),
        Value::String(s) => Ok(Some(s.trim().to_string())),
        Value::Number(n) => Ok(Some(n.to_string())),
        Value::Bool(b) => Ok(Some(b.to_string())),
        _ => Err(ParseError::FieldType {
            field: field.to_string(),
            message: "expected a string".to_string(),
        }),
    }
}

fn text_field(fields: &Map<String, Value>, name: &str) -> Result<Option<String>, ParseError> {
    match fields.get(name) {
        Some(value) => scalar_text(name, value),
        None => Ok(None),
    }
}

fn list_field(fields: &Map<String, Value>, name: &str) -> Result<Vec<String>, ParseError> {
    let Some(value) = fields.get(name) else {
        return Ok(Vec::new());
    };
    match value {
        Value::Array(items) => {
            let mut out = Vec::new();
            for item in items {
                let text = match item {
                    Value::Object(_) => Some(item.to_string()),
                    other => scalar_text(name, other)?,
                };
                out.extend(text);
            }
            Ok(out)
        }
        Value::Object(_) => Ok(vec![value.to_string()]),
        other => Ok(scalar_text(name, other)?.into_iter().collect()),
    }
}

/// `YYYY-MM-DD` when the text matches a known format, otherwise unchanged.
pub fn normalize_date(text: &str) -> String {
    let trimmed = text.trim();
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(trimmed, fmt).ok())
        .map(|date| date.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| trimmed.to_string())
}

pub fn build_metadata_prompt(srf_text: &str, context: &GenerationContext) -> String {
    METADATA_PROMPT
        .replace("{srf_text}", srf_text.trim())
        .replace("{examples}", &context.render_examples())
        .replace("{schema}", &context.render_schema())
        .replace("{rules}", &context.render_rules())
}

fn build_retry_prompt(original_prompt: &str, error: &str, previous_response: &str) -> String {
    RETRY_PARSE_PROMPT
        .replace("{error}", error)
        .replace(
            "{previous_response}",
            &crate::util::truncate_string(previous_response, MAX_PREVIOUS_RESPONSE_BYTES),
        )
        .replace("{original_prompt}", original_prompt)
}

/// First workflow stage's provider-facing half.
pub struct MetadataExtractor<'a> {
    generator: &'a dyn TextGenerator,
    options: &'a CompletionOptions,
    parse_retries: u32,
}

impl<'a> MetadataExtractor<'a> {
    pub fn new(
        generator: &'a dyn TextGenerator,
        options: &'a CompletionOptions,
        parse_retries: u32,
    ) -> Self {
        Self {
            generator,
            options,
            parse_retries,
        }
    }

    /// Empty SRF text is rejected before any provider call.
    pub fn check_input(srf_text: &str) -> Result<(), ParseError> {
        if srf_text.trim().is_empty() {
            return Err(ParseError::EmptyInput);
        }
        Ok(())
    }

    pub fn extract(
        &self,
        srf_text: &str,
        context: &GenerationContext,
        calls: &mut Vec<ProviderCall>,
    ) -> Result<Metadata, StageError> {
        Self::check_input(srf_text)?;
        let prompt = build_metadata_prompt(srf_text, context);

        let mut last_error: Option<ParseError> = None;
        let mut last_response = String::new();
        for attempt in 0..=self.parse_retries {
            let (purpose, attempt_prompt) = match &last_error {
                None => ("metadata", prompt.clone()),
                Some(err) => {
                    tracing::warn!(
                        attempt,
                        retries = self.parse_retries,
                        error = %err,
                        "metadata response unparseable, re-prompting"
                    );
                    (
                        "metadata_retry",
                        build_retry_prompt(&prompt, &err.to_string(), &last_response),
                    )
                }
            };
            let response = invoke_provider(
                self.generator,
                Stage::Extracting,
                purpose,
                &attempt_prompt,
                self.options,
                calls,
            )?;
            match parse_metadata_response(&response) {
                Ok(metadata) => return Ok(metadata),
                Err(err) => {
                    last_error = Some(err);
                    last_response = response;
                }
            }
        }
        Err(last_error.unwrap_or(ParseError::NoFields).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fenced_json_and_normalizes_values() {
        let text = r#"Sure.
```json
{
  "Commission Name": "June Dealer Airtime",
  "start_date": "01-Jun-2024",
  "end_date": "30/06/2024",
  "receiver_channel": "Not specified",
  "kpi_list": "Airtime revenue",
  "calculation_rules": ["2% of revenue", {"slab": "100k+", "rate": 0.03}],
  "bonus_rules": null
}
```"#;
        let metadata = parse_metadata_response(text).expect("parse");
        assert_eq!(metadata.commission_name.as_deref(), Some("June Dealer Airtime"));
        assert_eq!(metadata.start_date.as_deref(), Some("2024-06-01"));
        assert_eq!(metadata.end_date.as_deref(), Some("2024-06-30"));
        assert_eq!(metadata.receiver_channel, None);
        assert_eq!(metadata.kpi_list, ["Airtime revenue"]);
        assert_eq!(metadata.calculation_rules.len(), 2);
        assert!(metadata.calculation_rules[1].contains("slab"));
        assert!(metadata.bonus_rules.is_empty());
    }

    #[test]
    fn unrecognised_dates_are_kept_verbatim() {
        assert_eq!(normalize_date("end of Q2"), "end of Q2");
        assert_eq!(normalize_date(" 2024-07-31 "), "2024-07-31");
        assert_eq!(normalize_date("15-Mar-24"), "2024-03-15");
    }

    #[test]
    fn shape_errors_are_parse_errors() {
        assert_eq!(
            parse_metadata_response("no json here"),
            Err(ParseError::MissingDelimiters)
        );
        assert!(matches!(
            parse_metadata_response("{\"commission_name\": }"),
            Err(ParseError::InvalidJson { .. })
        ));
        assert_eq!(
            parse_metadata_response(r#"{"commission_name": "Not specified", "other": 1}"#),
            Err(ParseError::NoFields)
        );
        assert!(matches!(
            parse_metadata_response(r#"{"commission_name": ["a"]}"#),
            Err(ParseError::FieldType { .. })
        ));
    }

    #[test]
    fn empty_input_is_rejected() {
        assert_eq!(
            MetadataExtractor::check_input("  \n\t"),
            Err(ParseError::EmptyInput)
        );
        assert!(MetadataExtractor::check_input("pay dealers").is_ok());
    }

    #[test]
    fn period_describes_partial_dates() {
        let metadata = Metadata {
            end_date: Some("2024-06-30".to_string()),
            ..Metadata::default()
        };
        assert_eq!(metadata.period(), "until 2024-06-30");
        assert!(metadata.has_dates());
        assert_eq!(Metadata::default().period(), "Not specified");
    }
}

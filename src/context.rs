//! Generation context: retrieved examples, supporting schema, and business
//! rules assembled once per run and read by every later stage.

use crate::retrieval::ScoredExample;
use crate::util::truncate_string;
use serde::{Deserialize, Serialize};

/// Rules applied when the configuration supplies none.
pub const DEFAULT_STATIC_RULES: &[&str] = &[
    "Use only the rates, targets and slabs stated in the current SRF; never reuse incentive values from prior examples.",
    "Derive BASE_CYCLE from the month of the campaign end date.",
    "Restrict every KPI query to the campaign start and end dates.",
    "Keep DROP, TRUNCATE, DELETE and ALTER statements in the setup step only.",
    "Terminate every statement with a semicolon.",
];

const DEFAULT_COLUMN_TYPE: &str = "VARCHAR2(100)";
const MAX_EXAMPLE_SQL_BYTES: usize = 6000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub data_type: String,
    pub description: String,
}

/// A table parsed from supporting schema text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSpec>,
}

/// Read-only inputs shared by all generation stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationContext {
    pub retrieved: Vec<ScoredExample>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supporting_schema_text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tables: Vec<TableSchema>,
    pub static_rules: Vec<String>,
}

impl GenerationContext {
    pub fn has_prior_art(&self) -> bool {
        !self.retrieved.is_empty()
    }

    pub fn example_ids(&self) -> Vec<String> {
        self.retrieved.iter().map(|s| s.example.id.clone()).collect()
    }

    /// Examples section of a prompt.
    pub fn render_examples(&self) -> String {
        if self.retrieved.is_empty() {
            return "No similar historical examples were found. Work from the SRF, schema and rules only."
                .to_string();
        }
        let mut out = String::new();
        for (idx, scored) in self.retrieved.iter().enumerate() {
            out.push_str(&format!(
                "### Example {} ({}, score {:.2})\nSRF:\n{}\n\nSQL:\n{}\n\n",
                idx + 1,
                scored.example.id,
                scored.combined_score,
                scored.example.request_text,
                truncate_string(&scored.example.sql_text, MAX_EXAMPLE_SQL_BYTES)
            ));
        }
        out.trim_end().to_string()
    }

    /// Schema section of a prompt: parsed tables, or the raw text when nothing parsed.
    pub fn render_schema(&self) -> String {
        if !self.tables.is_empty() {
            let mut out = String::new();
            for table in &self.tables {
                out.push_str(&format!("{}:\n", table.name));
                for col in &table.columns {
                    out.push_str(&format!(
                        "  - {} {} -- {}\n",
                        col.name, col.data_type, col.description
                    ));
                }
            }
            return out.trim_end().to_string();
        }
        match &self.supporting_schema_text {
            Some(text) => text.clone(),
            None => "No supporting schema provided.".to_string(),
        }
    }

    pub fn render_rules(&self) -> String {
        self.static_rules
            .iter()
            .enumerate()
            .map(|(idx, rule)| format!("{}. {rule}", idx + 1))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Assembles a [`GenerationContext`]; pure and deterministic.
#[derive(Debug, Default, Clone, Copy)]
pub struct ContextBuilder;

impl ContextBuilder {
    pub fn build(
        &self,
        retrieved: Vec<ScoredExample>,
        supporting_schema_text: Option<&str>,
        static_rules: &[String],
    ) -> GenerationContext {
        let supporting_schema_text = supporting_schema_text
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let tables = supporting_schema_text
            .as_deref()
            .map(parse_schema_text)
            .unwrap_or_default();
        let static_rules = if static_rules.is_empty() {
            DEFAULT_STATIC_RULES.iter().map(|r| r.to_string()).collect()
        } else {
            static_rules.to_vec()
        };
        GenerationContext {
            retrieved,
            supporting_schema_text,
            tables,
            static_rules,
        }
    }
}

fn is_table_header(line: &str) -> bool {
    let Some(name) = line.strip_suffix(':') else {
        return false;
    };
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_uppercase() || c == '_')
        && chars.all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}

/// Split on commas outside parentheses so `NUMBER(10,2)` stays one field.
fn split_fields(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();
    for ch in line.chars() {
        match ch {
            '(' => {
                depth += 1;
                current.push(ch);
            }
            ')' => {
                depth = depth.saturating_sub(1);
                current.push(ch);
            }
            ',' if depth == 0 => fields.push(std::mem::take(&mut current).trim().to_string()),
            _ => current.push(ch),
        }
    }
    fields.push(current.trim().to_string());
    fields
}

fn title_case(name: &str) -> String {
    name.split('_')
        .filter(|w| !w.is_empty())
        .map(|w| {
            let lower = w.to_lowercase();
            let mut chars = lower.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse `TABLE_NAME:` blocks of `COLUMN, TYPE[, description]` lines.
/// Tables with no columns are dropped.
pub fn parse_schema_text(text: &str) -> Vec<TableSchema> {
    let mut tables: Vec<TableSchema> = Vec::new();
    let mut current: Option<TableSchema> = None;

    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with("--") {
            continue;
        }
        if is_table_header(line) {
            if let Some(table) = current.take().filter(|t| !t.columns.is_empty()) {
                tables.push(table);
            }
            current = Some(TableSchema {
                name: line.trim_end_matches(':').to_string(),
                columns: Vec::new(),
            });
            continue;
        }
        let Some(table) = current.as_mut() else {
            continue;
        };
        let line = line.trim_end_matches(',').trim();
        let fields = split_fields(line);
        let name = fields[0].to_uppercase();
        if name.is_empty() || name.starts_with('-') {
            continue;
        }
        let data_type = fields
            .get(1)
            .filter(|t| !t.is_empty())
            .cloned()
            .unwrap_or_else(|| DEFAULT_COLUMN_TYPE.to_string());
        let description = fields
            .get(2..)
            .map(|rest| rest.join(", "))
            .filter(|d| !d.trim().is_empty())
            .unwrap_or_else(|| title_case(&name));
        table.columns.push(ColumnSpec {
            name,
            data_type,
            description,
        });
    }
    if let Some(table) = current.filter(|t| !t.columns.is_empty()) {
        tables.push(table);
    }
    tables
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tables_with_defaults_and_comments() {
        let text = "DEALER_PAYOUT:\nMSISDN, NUMBER, Subscriber number\n# ignored\nAMOUNT, NUMBER(10,2)\nREGION\n\nKPI_SUMMARY:\n-- nothing here\nKPI_NAME, VARCHAR2(50),\n";
        let tables = parse_schema_text(text);
        assert_eq!(tables.len(), 2);
        assert_eq!(tables[0].name, "DEALER_PAYOUT");
        assert_eq!(tables[0].columns.len(), 3);
        assert_eq!(tables[0].columns[0].description, "Subscriber number");
        assert_eq!(tables[0].columns[1].data_type, "NUMBER(10,2)");
        assert_eq!(tables[0].columns[1].description, "Amount");
        assert_eq!(tables[0].columns[2].data_type, "VARCHAR2(100)");
        assert_eq!(tables[1].columns[0].name, "KPI_NAME");
        assert_eq!(tables[1].columns[0].data_type, "VARCHAR2(50)");
        assert_eq!(tables[1].columns[0].description, "Kpi Name");
    }

    #[test]
    fn free_text_schema_passes_through() {
        let ctx = ContextBuilder.build(Vec::new(), Some("  use table sales_daily  "), &[]);
        assert!(ctx.tables.is_empty());
        assert_eq!(ctx.render_schema(), "use table sales_daily");
        assert!(!ctx.has_prior_art());
        assert!(ctx.render_examples().contains("No similar historical examples"));
    }

    #[test]
    fn default_rules_apply_when_none_configured() {
        let ctx = ContextBuilder.build(Vec::new(), None, &[]);
        assert_eq!(ctx.static_rules.len(), DEFAULT_STATIC_RULES.len());
        assert!(ctx.render_rules().starts_with("1. Use only the rates"));

        let custom = vec!["Pay in local currency.".to_string()];
        let ctx = ContextBuilder.build(Vec::new(), Some("   "), &custom);
        assert_eq!(ctx.static_rules, custom);
        assert_eq!(ctx.supporting_schema_text, None);
        assert_eq!(ctx.render_schema(), "No supporting schema provided.");
    }
}

//! Run output directory.
//!
//! Layout written by [`write_run_outputs`]:
//!
//! - `script.sql`: compiled script (absent when the run failed before compiling)
//! - `report.md`: markdown report, always written
//! - `metadata.json`: extracted metadata, when extraction succeeded
//! - `run.json`: full run snapshot including the stage log
//! - `lm_log.jsonl`: one line per provider call, appended across runs
use crate::util::display_path;
use crate::workflow::run::WorkflowRun;
use anyhow::{Context, Result};
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const SCRIPT_FILE: &str = "script.sql";
pub const REPORT_FILE: &str = "report.md";
pub const METADATA_FILE: &str = "metadata.json";
pub const RUN_FILE: &str = "run.json";
pub const LM_LOG_FILE: &str = "lm_log.jsonl";

fn write_bytes(root: &Path, rel_path: &str, bytes: &[u8]) -> Result<PathBuf> {
    let path = root.join(rel_path);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    fs::write(&path, bytes).with_context(|| format!("write {}", path.display()))?;
    Ok(path)
}

fn write_json<T: Serialize>(root: &Path, rel_path: &str, value: &T) -> Result<PathBuf> {
    let bytes = serde_json::to_vec_pretty(value).with_context(|| format!("serialize {rel_path}"))?;
    write_bytes(root, rel_path, &bytes)
}

fn append_jsonl<T: Serialize>(path: &Path, entries: &[T]) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {} for append", path.display()))?;
    for entry in entries {
        let line = serde_json::to_string(entry).context("serialize lm_log entry")?;
        writeln!(file, "{line}").context("write lm_log entry")?;
    }
    Ok(())
}

/// Write every output of `run` under `dir`; returns the paths written,
/// relative to `dir`.
pub fn write_run_outputs(dir: &Path, run: &WorkflowRun) -> Result<Vec<String>> {
    fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    let mut written = Vec::new();

    if let Some(script) = &run.compiled_script {
        let mut text = script.clone();
        if !text.ends_with('\n') {
            text.push('\n');
        }
        written.push(write_bytes(dir, SCRIPT_FILE, text.as_bytes())?);
    }
    if let Some(report) = &run.report {
        written.push(write_bytes(dir, REPORT_FILE, report.as_bytes())?);
    }
    if let Some(metadata) = &run.metadata {
        written.push(write_json(dir, METADATA_FILE, metadata)?);
    }
    written.push(write_json(dir, RUN_FILE, run)?);

    let log_path = dir.join(LM_LOG_FILE);
    append_jsonl(&log_path, &run.provider_calls)?;
    written.push(log_path);

    tracing::info!(dir = %dir.display(), files = written.len(), "run outputs written");
    Ok(written
        .iter()
        .map(|path| display_path(path, Some(dir)))
        .collect())
}

/// Read a run snapshot back from `run.json`.
pub fn load_run(dir: &Path) -> Result<WorkflowRun> {
    let path = dir.join(RUN_FILE);
    let bytes = fs::read(&path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("parse {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ParseError, StageError};
    use crate::workflow::run::Stage;

    #[test]
    fn failed_run_writes_report_and_snapshot_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut run = WorkflowRun::new("", None);
        run.fail(Stage::Extracting, &StageError::from(ParseError::EmptyInput));
        run.report = Some("# report\n".to_string());

        let written = write_run_outputs(dir.path(), &run).expect("write");
        assert_eq!(written, [REPORT_FILE, RUN_FILE, LM_LOG_FILE]);
        assert!(!dir.path().join(SCRIPT_FILE).exists());

        let loaded = load_run(dir.path()).expect("load");
        assert_eq!(loaded, run);
    }

    #[test]
    fn lm_log_appends_across_runs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut run = WorkflowRun::new("srf", None);
        run.compiled_script = Some("SELECT 1 FROM dual;".to_string());
        run.provider_calls.push(crate::workflow::run::ProviderCall {
            schema_version: 1,
            ts: 1,
            stage: crate::workflow::run::Stage::Extracting,
            purpose: "metadata".to_string(),
            provider: "scripted".to_string(),
            duration_ms: 3,
            prompt_bytes: 10,
            response_bytes: 20,
            succeeded: true,
            error_kind: None,
            error: None,
        });

        write_run_outputs(dir.path(), &run).expect("first");
        write_run_outputs(dir.path(), &run).expect("second");

        let log = fs::read_to_string(dir.path().join(LM_LOG_FILE)).expect("log");
        assert_eq!(log.lines().count(), 2);
        assert!(log.lines().all(|line| !line.contains("\"error\"")));
        let script = fs::read_to_string(dir.path().join(SCRIPT_FILE)).expect("script");
        assert!(script.ends_with(";\n"));
    }
}

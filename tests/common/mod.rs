//! Shared test infrastructure for integration tests.
//!
//! A fixture under `tests/fixtures/<name>/` holds an SRF, optional schema
//! text, raw example pairs and canned LM responses. The binary is driven with
//! `tests/mock-lm.sh <fixture>` as its LM command and an isolated config file.

use serde::Deserialize;
use std::env;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use tempfile::TempDir;

/// Fixture metadata loaded from fixture.json.
#[derive(Debug, Deserialize)]
pub struct FixtureConfig {
    pub srf: String,
    #[serde(default)]
    pub schema: Option<String>,
    pub pairs: String,
}

pub struct TestFixture {
    pub fixture_dir: PathBuf,
    pub config: FixtureConfig,
    /// Scratch space: config file, store, run outputs.
    pub work: TempDir,
}

fn manifest_dir() -> PathBuf {
    PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap_or_else(|_| ".".into()))
}

const TEST_CONFIG: &str = r#"{
  "schema_version": 1,
  "embedding": {"kind": "hashing", "dimensions": 128},
  "generation": {"timeout_secs": 30, "provider_retries": 0}
}"#;

impl TestFixture {
    /// Load a fixture by name from tests/fixtures/{name}/.
    pub fn load(name: &str) -> anyhow::Result<Self> {
        let fixture_dir = manifest_dir().join("tests/fixtures").join(name);
        let config_path = fixture_dir.join("fixture.json");
        let config: FixtureConfig =
            serde_json::from_str(&std::fs::read_to_string(&config_path).map_err(|e| {
                anyhow::anyhow!("Failed to read {}: {}", config_path.display(), e)
            })?)?;
        let work = TempDir::new()?;
        std::fs::write(work.path().join("config.json"), TEST_CONFIG)?;
        Ok(Self {
            fixture_dir,
            config,
            work,
        })
    }

    /// Replace the isolated config file.
    pub fn write_config(&self, text: &str) -> anyhow::Result<()> {
        std::fs::write(self.work_path("config.json"), text)?;
        Ok(())
    }

    /// The mock LM is a shell script; skip when `sh` is unavailable.
    pub fn skip_if_shell_missing(&self) -> bool {
        let missing = Command::new("sh")
            .args(["-c", "exit 0"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_err();
        if missing {
            eprintln!("Skipping: sh not available");
        }
        missing
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.fixture_dir.join(rel)
    }

    pub fn work_path(&self, rel: &str) -> PathBuf {
        self.work.path().join(rel)
    }

    pub fn store_path(&self) -> PathBuf {
        self.work_path("store.json")
    }

    /// LM command answering from this fixture's responses/ directory.
    pub fn lm_command(&self) -> String {
        let mock_script = manifest_dir().join("tests/mock-lm.sh");
        let abs_fixture = self.fixture_dir.canonicalize().expect("fixture dir exists");
        shell_words::join([
            "sh".to_string(),
            mock_script.display().to_string(),
            abs_fixture.display().to_string(),
        ])
    }

    /// Run the binary with the isolated config and `args`.
    pub fn srf2sql<I, S>(&self, args: I) -> Output
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        Command::new(env!("CARGO_BIN_EXE_srf2sql"))
            .arg("--config")
            .arg(self.work_path("config.json"))
            .args(args)
            .env_remove("SRF2SQL_LM_COMMAND")
            .env_remove("SRF2SQL_RETRIEVAL_WEIGHTS")
            .env_remove("SRF2SQL_MAX_RESULTS")
            .env_remove("SRF2SQL_CONFIDENCE_THRESHOLD")
            .env("RUST_LOG", "warn")
            .output()
            .expect("spawn srf2sql")
    }

    /// Ingest the fixture's pairs into the work store.
    pub fn ingest(&self) -> anyhow::Result<PathBuf> {
        let store = self.store_path();
        let args: Vec<OsString> = vec![
            "ingest".into(),
            "--pairs".into(),
            self.path(&self.config.pairs).into(),
            "--out".into(),
            store.clone().into(),
        ];
        let output = self.srf2sql(args);
        if !output.status.success() {
            return Err(anyhow::anyhow!(
                "ingest failed: {}",
                String::from_utf8_lossy(&output.stderr)
            ));
        }
        Ok(store)
    }

    /// Run `generate` for `srf` into `out_dir`.
    pub fn generate(&self, srf: &Path, out_dir: &Path, extra: &[&str]) -> Output {
        let mut args: Vec<OsString> = vec![
            "generate".into(),
            "--srf".into(),
            srf.into(),
            "--store".into(),
            self.store_path().into(),
            "--lm".into(),
            self.lm_command().into(),
            "--out".into(),
            out_dir.into(),
        ];
        if let Some(schema) = &self.config.schema {
            args.push("--schema".into());
            args.push(self.path(schema).into());
        }
        args.extend(extra.iter().map(OsString::from));
        self.srf2sql(args)
    }
}

pub fn stdout_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

pub fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

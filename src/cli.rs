//! CLI argument parsing.
//!
//! The CLI is thin: every command loads config, builds the capabilities and
//! hands off to library code, so the same pipeline can be driven from tests.
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Root CLI entrypoint.
#[derive(Parser, Debug)]
#[command(
    name = "srf2sql",
    version,
    about = "Generate commission SQL scripts from service request forms",
    after_help = "Examples:\n  srf2sql ingest --pairs pairs.jsonl --out store.json\n  srf2sql retrieve --request srf.txt --store store.json\n  srf2sql generate --srf srf.txt --store store.json --out run/\n  srf2sql feedback --store store.json --run run/ --outcome accepted",
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct RootArgs {
    /// Config file (default: <config_dir>/srf2sql/config.json)
    #[arg(long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    Generate(GenerateArgs),
    Retrieve(RetrieveArgs),
    Ingest(IngestArgs),
    Feedback(FeedbackArgs),
}

/// Retrieval overrides shared by `generate` and `retrieve`.
#[derive(Args, Debug, Clone, Default)]
pub struct RetrievalArgs {
    /// Maximum examples to retrieve
    #[arg(long, value_name = "N")]
    pub max_results: Option<usize>,

    /// Minimum combined score in [0, 1]
    #[arg(long, value_name = "F")]
    pub threshold: Option<f64>,
}

#[derive(Parser, Debug)]
#[command(about = "Run the full SRF to SQL workflow")]
pub struct GenerateArgs {
    /// SRF text file
    #[arg(long, value_name = "FILE")]
    pub srf: PathBuf,

    /// Supporting table schema text
    #[arg(long, value_name = "FILE")]
    pub schema: Option<PathBuf>,

    /// Example store produced by `ingest`
    #[arg(long, value_name = "FILE")]
    pub store: PathBuf,

    /// LM command override (prompt on stdin, completion on stdout)
    #[arg(long, value_name = "CMD")]
    pub lm: Option<String>,

    #[command(flatten)]
    pub retrieval: RetrievalArgs,

    /// Output directory for script, report and logs
    #[arg(long, value_name = "DIR")]
    pub out: Option<PathBuf>,

    /// Print the run snapshot as JSON instead of the report
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
#[command(about = "Show the examples a request would retrieve")]
pub struct RetrieveArgs {
    /// Request (SRF) text file
    #[arg(long, value_name = "FILE")]
    pub request: PathBuf,

    /// Supporting table schema text
    #[arg(long, value_name = "FILE")]
    pub schema: Option<PathBuf>,

    /// Example store produced by `ingest`
    #[arg(long, value_name = "FILE")]
    pub store: PathBuf,

    #[command(flatten)]
    pub retrieval: RetrievalArgs,

    /// Emit machine-readable JSON output
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
#[command(about = "Embed raw SRF/SQL pairs into an example store")]
pub struct IngestArgs {
    /// JSONL file of {srf, sql, supporting_table?, tags?} pairs
    #[arg(long, value_name = "FILE")]
    pub pairs: PathBuf,

    /// Store file to write
    #[arg(long, value_name = "FILE")]
    pub out: PathBuf,
}

#[derive(Parser, Debug)]
#[command(about = "Record feedback for examples a run used")]
pub struct FeedbackArgs {
    /// Example store produced by `ingest`
    #[arg(long, value_name = "FILE")]
    pub store: PathBuf,

    /// Example id (repeatable)
    #[arg(
        long = "example",
        value_name = "ID",
        required_unless_present = "run",
        conflicts_with = "run"
    )]
    pub examples: Vec<String>,

    /// Run output directory; the examples that run retrieved get the feedback
    #[arg(long, value_name = "DIR")]
    pub run: Option<PathBuf>,

    /// accepted, rejected or edited
    #[arg(long, value_name = "OUTCOME")]
    pub outcome: String,

    /// Emit machine-readable JSON output
    #[arg(long)]
    pub json: bool,
}

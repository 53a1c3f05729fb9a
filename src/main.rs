use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::Serialize;
use srf2sql::cli::{
    Command, FeedbackArgs, GenerateArgs, IngestArgs, RetrievalArgs, RetrieveArgs, RootArgs,
};
use srf2sql::config::{load_config, Config, ProviderConfig};
use srf2sql::embedding::{build_embedder, Embedder};
use srf2sql::feedback::{
    append_feedback_log, feedback_log_path, load_feedback_log, FeedbackTracker, Outcome,
};
use srf2sql::lm::{build_generator, TextGenerator};
use srf2sql::output::{load_run, write_run_outputs};
use srf2sql::retrieval::{
    RetrievalEngine, RetrievalQuality, RetrievalQuery, ScoreWeights, ScoredExample,
};
use srf2sql::store::{ingest, load_pairs, load_store, write_store, InMemoryExampleStore};
use srf2sql::workflow::{CancellationToken, RunRequest, WorkflowOrchestrator, WorkflowSettings};
use std::fs;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = RootArgs::parse();
    match run(args) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: RootArgs) -> Result<ExitCode> {
    let config = load_config(args.config.as_deref())?;
    match args.command {
        Command::Generate(args) => run_generate(config, &args),
        Command::Retrieve(args) => run_retrieve(&config, &args),
        Command::Ingest(args) => run_ingest(&config, &args),
        Command::Feedback(args) => run_feedback(&config, &args),
    }
}

fn read_text(path: &Path, what: &str) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("read {what} {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("serialize output")?;
    println!("{text}");
    Ok(())
}

fn embedder_for(config: &Config) -> Arc<dyn Embedder> {
    let timeout = Duration::from_secs(config.generation.timeout_secs);
    Arc::from(build_embedder(&config.embedding, timeout))
}

/// Load a store and replay its feedback log so rankings see past outcomes.
fn open_store(config: &Config, path: &Path) -> Result<(Arc<InMemoryExampleStore>, FeedbackTracker)> {
    let store = Arc::new(load_store(path)?);
    tracing::debug!(
        examples = store.len(),
        model = store.embedding_model(),
        dimensions = store.dimensions(),
        "store opened"
    );
    let tracker = FeedbackTracker::new(store.clone(), config.feedback.learning_rate)?;
    let log_path = feedback_log_path(path);
    let events = load_feedback_log(&log_path)?;
    if !events.is_empty() {
        let applied = tracker.replay(events)?;
        tracing::info!(applied, log = %log_path.display(), "feedback replayed");
    }
    Ok((store, tracker))
}

/// Retrieval over `store`, refusing an embedder the store was not built with.
fn retrieval_engine(config: &Config, store: Arc<InMemoryExampleStore>) -> Result<RetrievalEngine> {
    let embedder = embedder_for(config);
    store
        .check_embedder(embedder.as_ref())
        .context("store does not match the embedding config")?;
    Ok(RetrievalEngine::new(store, embedder, config.retrieval.weights))
}

fn retrieval_query(
    config: &Config,
    request_text: String,
    schema_text: Option<String>,
    overrides: &RetrievalArgs,
) -> Result<RetrievalQuery> {
    let query = RetrievalQuery::new(
        request_text,
        overrides.max_results.unwrap_or(config.retrieval.max_results),
        overrides
            .threshold
            .unwrap_or(config.retrieval.confidence_threshold),
    )?;
    Ok(query.with_schema(schema_text))
}

fn run_generate(mut config: Config, args: &GenerateArgs) -> Result<ExitCode> {
    if let Some(command) = args.lm.clone().filter(|c| !c.trim().is_empty()) {
        config.provider = ProviderConfig::Command { command };
    }
    let srf_text = read_text(&args.srf, "SRF")?;
    let schema_text = args
        .schema
        .as_deref()
        .map(|path| read_text(path, "schema"))
        .transpose()?;

    let (store, _tracker) = open_store(&config, &args.store)?;
    let retrieval = retrieval_engine(&config, store)?;
    let generator: Arc<dyn TextGenerator> = Arc::from(build_generator(&config));
    let orchestrator =
        WorkflowOrchestrator::new(retrieval, generator, WorkflowSettings::from_config(&config));

    let request = RunRequest {
        srf_text,
        supporting_schema_text: schema_text,
        max_results: args.retrieval.max_results,
        confidence_threshold: args.retrieval.threshold,
    };
    let run = orchestrator.run(request, &CancellationToken::new());

    if let Some(dir) = &args.out {
        let written = write_run_outputs(dir, &run)?;
        for file in &written {
            eprintln!("wrote {}", dir.join(file).display());
        }
    }
    if args.json {
        print_json(&run)?;
    } else if let Some(report) = &run.report {
        print!("{report}");
    }

    if run.succeeded() {
        Ok(ExitCode::SUCCESS)
    } else {
        if let Some(error) = &run.error {
            eprintln!(
                "run failed at {} ({}): {}",
                error.stage, error.cause_kind, error.message
            );
        }
        Ok(ExitCode::FAILURE)
    }
}

#[derive(Serialize)]
struct RetrieveOutput<'a> {
    weights: ScoreWeights,
    quality: &'a RetrievalQuality,
    results: Vec<RetrieveRow<'a>>,
}

#[derive(Serialize)]
struct RetrieveRow<'a> {
    id: &'a str,
    combined_score: f64,
    semantic_score: f64,
    keyword_score: f64,
    pattern_score: f64,
    historical_score: f64,
    request_text: &'a str,
}

impl<'a> From<&'a ScoredExample> for RetrieveRow<'a> {
    fn from(scored: &'a ScoredExample) -> Self {
        Self {
            id: &scored.example.id,
            combined_score: scored.combined_score,
            semantic_score: scored.semantic_score,
            keyword_score: scored.keyword_score,
            pattern_score: scored.pattern_score,
            historical_score: scored.historical_score,
            request_text: &scored.example.request_text,
        }
    }
}

fn run_retrieve(config: &Config, args: &RetrieveArgs) -> Result<ExitCode> {
    let request_text = read_text(&args.request, "request")?;
    let schema_text = args
        .schema
        .as_deref()
        .map(|path| read_text(path, "schema"))
        .transpose()?;
    let query = retrieval_query(config, request_text, schema_text, &args.retrieval)?;

    let (store, _tracker) = open_store(config, &args.store)?;
    let engine = retrieval_engine(config, store)?;
    let (retrieved, quality) = engine.retrieve_with_quality(&query)?;

    if args.json {
        return print_json(&RetrieveOutput {
            weights: engine.weights(),
            quality: &quality,
            results: retrieved.iter().map(RetrieveRow::from).collect(),
        })
        .map(|()| ExitCode::SUCCESS);
    }

    println!(
        "quality: {} (avg {:.3}, {:.0}% above threshold)",
        quality.verdict,
        quality.average_score,
        quality.above_threshold_ratio * 100.0
    );
    println!("{}", quality.recommendation);
    let weights = engine.weights();
    println!(
        "weights: semantic={:.2} keyword={:.2} pattern={:.2} historical={:.2}",
        weights.semantic, weights.keyword, weights.pattern, weights.historical
    );
    if retrieved.is_empty() {
        println!("no examples met threshold {}", query.confidence_threshold);
    }
    for scored in &retrieved {
        println!(
            "{}  combined={:.3} semantic={:.3} keyword={:.3} pattern={:.3} historical={:.3}",
            scored.example.id,
            scored.combined_score,
            scored.semantic_score,
            scored.keyword_score,
            scored.pattern_score,
            scored.historical_score
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn run_ingest(config: &Config, args: &IngestArgs) -> Result<ExitCode> {
    let pairs = load_pairs(&args.pairs)?;
    let embedder = embedder_for(config);
    let file = ingest(&pairs, embedder.as_ref())
        .with_context(|| format!("embed pairs from {}", args.pairs.display()))?;
    write_store(&args.out, &file)?;
    println!(
        "ingested {} of {} pairs into {} ({} dimensions, {})",
        file.examples.len(),
        pairs.len(),
        args.out.display(),
        file.dimensions,
        file.embedding_model
    );
    Ok(ExitCode::SUCCESS)
}

fn run_feedback(config: &Config, args: &FeedbackArgs) -> Result<ExitCode> {
    let outcome: Outcome = args.outcome.parse()?;
    let examples = match &args.run {
        Some(dir) => {
            let run = load_run(dir)?;
            let ids = run.used_example_ids();
            tracing::debug!(run_id = %run.run_id, examples = ids.len(), "feedback for run");
            if ids.is_empty() {
                bail!("run {} retrieved no examples; nothing to rate", run.run_id);
            }
            ids
        }
        None => args.examples.clone(),
    };
    let (_store, tracker) = open_store(config, &args.store)?;
    let updates = tracker.record(&examples, outcome)?;

    let events: Vec<_> = updates
        .iter()
        .filter_map(|update| tracker.events_for(&update.example_id).last().cloned())
        .collect();
    append_feedback_log(&feedback_log_path(&args.store), &events)?;

    if args.json {
        return print_json(&updates).map(|()| ExitCode::SUCCESS);
    }
    for update in &updates {
        println!(
            "{}: {:.3} -> {:.3} ({outcome})",
            update.example_id, update.previous_rate, update.rate
        );
    }
    Ok(ExitCode::SUCCESS)
}

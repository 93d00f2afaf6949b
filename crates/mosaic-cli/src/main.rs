use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use mosaic_contracts::models::{ModelSelection, ModelSelector, STITCH_CAPABILITY};
use mosaic_contracts::parts::ImagePart;
use mosaic_engine::{
    format_cost, CostEstimator, EstimationResult, ImageNormalizer, NormalizationReport,
    NormalizeProgress, PricingTables, ProcessingOutcome, StitchEngine, StitchError, StitchEvent,
    StitchSettings,
};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "mosaic=info";

#[derive(Debug, Parser)]
#[command(name = "mosaic-rs", version, about = "Stitch overlapping drone images into one map")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Normalize the images and report batches and cost without calling the model.
    Estimate(EstimateArgs),
    /// Normalize, estimate and stitch the images into one composite.
    Stitch(StitchArgs),
}

#[derive(Debug, Args)]
struct SharedArgs {
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    budget_bytes: Option<usize>,
    #[arg(long)]
    max_dimension: Option<u32>,
    #[arg(required = true)]
    files: Vec<PathBuf>,
}

impl SharedArgs {
    fn settings(&self) -> StitchSettings {
        StitchSettings::from_env()
            .with_max_dimension(self.max_dimension)
            .with_budget_bytes(self.budget_bytes)
    }
}

#[derive(Debug, Parser)]
struct EstimateArgs {
    #[command(flatten)]
    shared: SharedArgs,
    /// Print the estimate as one JSON object.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Parser)]
struct StitchArgs {
    #[command(flatten)]
    shared: SharedArgs,
    #[arg(long)]
    out: Option<PathBuf>,
    #[arg(long)]
    events: Option<PathBuf>,
}

fn main() {
    init_tracing();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            if let Some(hint) = failure_hint(&err) {
                eprintln!("{hint}");
            }
            eprintln!("mosaic-rs error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Estimate(args) => run_estimate(args),
        Command::Stitch(args) => run_stitch(args),
    }
}

fn run_estimate(args: EstimateArgs) -> Result<i32> {
    let settings = args.shared.settings();
    let normalizer = ImageNormalizer::new(&settings);
    let report: NormalizationReport = normalizer
        .normalize_files(&args.shared.files)
        .inspect(print_normalize_progress)
        .collect();
    print_failures(&report);

    let selection = ModelSelector::new(None)
        .select(args.shared.model.as_deref(), STITCH_CAPABILITY)
        .map_err(|err| anyhow!(err))?;
    let pricing = PricingTables::load();
    let pricing_key = selection.model.pricing_key.as_deref();
    let estimator = CostEstimator::new(
        settings.budget_bytes,
        pricing.cost_per_image_usd(pricing_key),
    );
    let Some(estimate) = estimator.estimate(&report.parts)? else {
        println!("Add at least two valid images to see a cost estimate.");
        return Ok(0);
    };
    let latency_s = pricing
        .latency_per_batch_s(pricing_key)
        .map(|per_batch| per_batch * estimate.batch_count as f64);

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "batch_count": estimate.batch_count,
                "image_count": estimate.image_count,
                "cost_per_image_usd": estimate.cost_per_image_usd,
                "estimated_cost_usd": estimate.estimated_cost_usd,
                "latency_estimate_s": latency_s,
                "failed_files": report.failures,
                "model": selection.model.name,
            }))?
        );
    } else {
        for line in estimate_lines(&estimate, latency_s, &selection) {
            println!("{line}");
        }
    }
    Ok(0)
}

fn run_stitch(args: StitchArgs) -> Result<i32> {
    let settings = args.shared.settings();
    let out = args.out.clone().unwrap_or_else(default_out_dir);
    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| out.join("events.jsonl"));
    let mut engine = StitchEngine::new(&out, &events_path, args.shared.model.clone(), settings)?;
    info!(
        run_id = engine.run_id(),
        files = args.shared.files.len(),
        events = %events_path.display(),
        "stitch run started"
    );
    let result = stitch_files(&mut engine, &args.shared.files);
    if let Err(err) = &result {
        engine.record_failure(err);
    }
    engine.finish()?;
    let composite_path = result?;
    println!("Stitched map written to {}", composite_path.display());
    println!("Run artifacts: {}", engine.run_dir().display());
    Ok(0)
}

fn stitch_files(engine: &mut StitchEngine, files: &[PathBuf]) -> Result<PathBuf> {
    let report = engine.normalize(files, print_normalize_progress)?;
    print_failures(&report);
    stitch_parts(engine, &report.parts)
}

/// The estimate is advisory: when it fails the run still plans against the
/// composites the model actually returns.
fn stitch_parts(engine: &mut StitchEngine, parts: &[ImagePart]) -> Result<PathBuf> {
    match engine.estimate(parts) {
        Ok(Some(estimate)) => {
            let latency_s = engine.latency_estimate_s(estimate.batch_count);
            let selection = engine.select_model()?;
            for line in estimate_lines(&estimate, latency_s, &selection) {
                println!("{line}");
            }
        }
        Ok(None) => {}
        Err(err) => println!("Estimate unavailable: {err:#}"),
    }

    engine.stitch(parts, |event| match event {
        StitchEvent::BatchStarted(progress) => println!("{}...", progress.message()),
        StitchEvent::BatchCompleted(record) => println!(
            "  batch {} done: {} of {} images stitched",
            record.progress.batch_index,
            record.consumed,
            record.consumed + record.remaining
        ),
        StitchEvent::Succeeded { batch_count, .. } => {
            println!("Stitching complete after {batch_count} batch(es).")
        }
        StitchEvent::Failed(_) => {}
    })
}

fn print_normalize_progress(progress: &NormalizeProgress) {
    match &progress.outcome {
        ProcessingOutcome::Success(_) => println!(
            "Processing images... {}/{} ({})",
            progress.processed, progress.total, progress.file_name
        ),
        ProcessingOutcome::Failure { message, .. } => println!(
            "Processing images... {}/{} ({} failed: {message})",
            progress.processed, progress.total, progress.file_name
        ),
    }
}

fn print_failures(report: &NormalizationReport) {
    if report.failures.is_empty() {
        return;
    }
    println!(
        "{} of {} file(s) could not be processed:",
        report.failures.len(),
        report.total()
    );
    for failure in &report.failures {
        println!("  {}: {}", failure.file_name, failure.message);
    }
}

fn estimate_lines(
    estimate: &EstimationResult,
    latency_s: Option<f64>,
    selection: &ModelSelection,
) -> Vec<String> {
    let mut lines = vec![
        format!(
            "Estimated batches: {} (an estimate, not a guarantee)",
            estimate.batch_count
        ),
        format!(
            "Estimated cost: {} ({} images at {} each)",
            format_cost(Some(estimate.estimated_cost_usd)),
            estimate.image_count,
            format_cost(Some(estimate.cost_per_image_usd))
        ),
    ];
    if let Some(latency_s) = latency_s {
        lines.push(format!("Estimated time: ~{latency_s:.0}s"));
    }
    match selection.fallback_reason.as_deref() {
        Some(reason) => lines.push(format!("Model: {} ({reason})", selection.model.name)),
        None => lines.push(format!("Model: {}", selection.model.name)),
    }
    lines
}

fn failure_hint(err: &anyhow::Error) -> Option<&'static str> {
    let stitch_err = err.downcast_ref::<StitchError>()?;
    if stitch_err.is_quota_exhausted() {
        return Some("The AI service is rate limited right now. Please try again later.");
    }
    match stitch_err {
        StitchError::ImageTooLarge { .. } => {
            Some("Try a lower --max-dimension or remove the oversized image.")
        }
        StitchError::InsufficientImages { .. } => {
            Some("Provide at least two readable images to stitch.")
        }
        _ => None,
    }
}

fn default_out_dir() -> PathBuf {
    let id = uuid::Uuid::new_v4().simple().to_string();
    Path::new("runs").join(format!("stitch-{}", &id[..8]))
}

pub mod error;
pub mod estimate;
pub mod normalize;
pub mod orchestrator;
pub mod payload;
pub mod planner;
pub mod pricing;
pub mod providers;
pub mod settings;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use mosaic_contracts::events::EventWriter;
use mosaic_contracts::models::{ModelSelection, ModelSelector, STITCH_CAPABILITY};
use mosaic_contracts::parts::ImagePart;
use mosaic_contracts::runs::receipts::{build_receipt, write_receipt, BatchSubmission};
use mosaic_contracts::runs::summary::{write_summary, FailedFile, RunSummary};
use serde_json::{json, Map, Value};
use tracing::{info, warn};

pub use error::StitchError;
pub use estimate::{format_cost, CostEstimator, EstimationResult};
pub use normalize::{ImageNormalizer, NormalizationReport, NormalizeProgress, ProcessingOutcome};
pub use orchestrator::{BatchProgress, BatchRecord, RunStatus, StitchEvent, StitchOrchestrator};
pub use pricing::PricingTables;
pub use providers::{
    default_provider_registry, ProviderStitchRequest, ProviderStitchResponse, StitchProvider,
    StitchProviderRegistry,
};
pub use settings::StitchSettings;

/// One stitch session rooted at a run directory.
///
/// Wraps normalization, estimation and the orchestrator with the run's
/// event log, per-batch receipts and the final summary.
pub struct StitchEngine {
    run_dir: PathBuf,
    run_id: String,
    events: EventWriter,
    summary_path: PathBuf,
    started_at: String,
    settings: StitchSettings,
    model_selector: ModelSelector,
    model: Option<String>,
    providers: StitchProviderRegistry,
    pricing: PricingTables,
    last_fallback_reason: Option<String>,
    estimate: Option<EstimationResult>,
    total_files: usize,
    normalized_images: usize,
    failed_files: Vec<FailedFile>,
    batches_submitted: usize,
    status: RunStatus,
    composite_path: Option<PathBuf>,
    error: Option<String>,
}

impl StitchEngine {
    pub fn new(
        run_dir: impl Into<PathBuf>,
        events_path: impl Into<PathBuf>,
        model: Option<String>,
        settings: StitchSettings,
    ) -> Result<Self> {
        let run_dir = run_dir.into();
        fs::create_dir_all(&run_dir)
            .with_context(|| format!("failed to create {}", run_dir.display()))?;
        let run_id = run_dir
            .file_name()
            .and_then(|value| value.to_str())
            .filter(|value| !value.is_empty())
            .unwrap_or("stitch-rs")
            .to_string();
        let events = EventWriter::new(events_path.into(), run_id.clone());
        let summary_path = run_dir.join("summary.json");

        events.emit(
            "run_started",
            map_object(json!({
                "out_dir": run_dir.to_string_lossy().to_string(),
                "max_dimension": settings.max_dimension,
                "jpeg_quality": settings.jpeg_quality,
                "budget_bytes": settings.budget_bytes,
            })),
        )?;

        Ok(Self {
            run_dir,
            run_id,
            events,
            summary_path,
            started_at: now_utc_iso(),
            settings,
            model_selector: ModelSelector::new(None),
            model,
            providers: default_provider_registry(&settings),
            pricing: PricingTables::load(),
            last_fallback_reason: None,
            estimate: None,
            total_files: 0,
            normalized_images: 0,
            failed_files: Vec::new(),
            batches_submitted: 0,
            status: RunStatus::Idle,
            composite_path: None,
            error: None,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn events_path(&self) -> &Path {
        self.events.path()
    }

    pub fn settings(&self) -> &StitchSettings {
        &self.settings
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn set_model(&mut self, model: Option<String>) {
        self.model = model;
    }

    pub fn last_fallback_reason(&self) -> Option<&str> {
        self.last_fallback_reason.as_deref()
    }

    /// Replaces a provider by name, e.g. to point `relay` at another URL.
    pub fn register_provider<P: StitchProvider + 'static>(&mut self, provider: P) {
        self.providers.register(provider);
    }

    pub fn select_model(&self) -> Result<ModelSelection> {
        self.model_selector
            .select(self.model.as_deref(), STITCH_CAPABILITY)
            .map_err(|err| anyhow!(err))
    }

    fn selected_model(&mut self) -> Result<ModelSelection> {
        let selection = self.select_model()?;
        self.last_fallback_reason = selection.fallback_reason.clone();
        Ok(selection)
    }

    /// Nominal wall time for `batch_count` calls of the selected model.
    pub fn latency_estimate_s(&self, batch_count: usize) -> Option<f64> {
        let selection = self.select_model().ok()?;
        self.pricing
            .latency_per_batch_s(selection.model.pricing_key.as_deref())
            .map(|per_batch| per_batch * batch_count as f64)
    }

    /// Normalizes `paths` in order. Files that fail are recorded, not fatal.
    pub fn normalize(
        &mut self,
        paths: &[PathBuf],
        mut observer: impl FnMut(&NormalizeProgress),
    ) -> Result<NormalizationReport> {
        let normalizer = ImageNormalizer::new(&self.settings);
        let mut report = NormalizationReport::default();
        for progress in normalizer.normalize_files(paths) {
            observer(&progress);
            let mut payload = map_object(json!({
                "processed": progress.processed,
                "total": progress.total,
                "file_name": progress.file_name,
            }));
            match &progress.outcome {
                ProcessingOutcome::Success(part) => {
                    payload.insert("ok".to_string(), Value::Bool(true));
                    payload.insert("encoded_bytes".to_string(), json!(part.encoded_len()));
                }
                ProcessingOutcome::Failure { message, .. } => {
                    payload.insert("ok".to_string(), Value::Bool(false));
                    payload.insert("error".to_string(), Value::String(message.clone()));
                }
            }
            self.events.emit("file_processed", payload)?;
            report.push(progress.outcome);
        }

        self.total_files += report.total();
        self.normalized_images += report.parts.len();
        self.failed_files.extend(report.failures.iter().cloned());
        self.events.emit(
            "normalization_finished",
            map_object(json!({
                "normalized": report.parts.len(),
                "failed": report.failures.len(),
                "failures": report.failures,
            })),
        )?;
        info!(
            normalized = report.parts.len(),
            failed = report.failures.len(),
            "normalization finished"
        );
        Ok(report)
    }

    /// Pre-flight estimate for `parts`. Any previous estimate is cleared
    /// first, so a too-large error never leaves a stale figure behind.
    pub fn estimate(&mut self, parts: &[ImagePart]) -> Result<Option<EstimationResult>> {
        self.estimate = None;
        let selection = self.selected_model()?;
        let cost_per_image = self
            .pricing
            .cost_per_image_usd(selection.model.pricing_key.as_deref());
        let estimator = CostEstimator::new(self.settings.budget_bytes, cost_per_image);
        match estimator.estimate(parts) {
            Ok(Some(estimate)) => {
                self.events.emit(
                    "estimate_ready",
                    map_object(json!({
                        "batch_count": estimate.batch_count,
                        "image_count": estimate.image_count,
                        "cost_per_image_usd": estimate.cost_per_image_usd,
                        "estimated_cost_usd": estimate.estimated_cost_usd,
                        "latency_estimate_s": self.latency_estimate_s(estimate.batch_count),
                        "model": selection.model.name,
                        "provider": selection.model.provider,
                        "fallback_reason": selection.fallback_reason,
                    })),
                )?;
                self.estimate = Some(estimate.clone());
                Ok(Some(estimate))
            }
            Ok(None) => {
                self.events.emit(
                    "estimate_cleared",
                    map_object(json!({
                        "reason": "fewer than two images",
                        "image_count": parts.len(),
                    })),
                )?;
                Ok(None)
            }
            Err(err) => {
                self.events.emit(
                    "estimate_cleared",
                    map_object(json!({
                        "reason": err.to_string(),
                        "image_count": parts.len(),
                    })),
                )?;
                Err(err.into())
            }
        }
    }

    fn batch_estimate_for(&self, parts: &[ImagePart]) -> Option<usize> {
        if let Some(estimate) = self.estimate.as_ref().filter(|row| !row.is_stale_for(parts)) {
            return Some(estimate.batch_count);
        }
        CostEstimator::new(self.settings.budget_bytes, 0.0)
            .estimate(parts)
            .ok()
            .flatten()
            .map(|estimate| estimate.batch_count)
    }

    /// Runs the orchestrator over `parts` and writes the composite into the
    /// run directory. `observer` sees every event before it is recorded.
    ///
    /// Any error leaves the run `Failed` with a `stitch_failed` event, even
    /// when it comes from writing run artifacts rather than the provider.
    pub fn stitch(
        &mut self,
        parts: &[ImagePart],
        observer: impl FnMut(&StitchEvent),
    ) -> Result<PathBuf> {
        let result = self.submit_batches(parts, observer);
        if let Err(err) = &result {
            self.record_failure(err);
        }
        result
    }

    /// Marks the run failed with `err` unless a failure is already recorded.
    /// The summary written by [`StitchEngine::finish`] then reports it.
    pub fn record_failure(&mut self, err: &anyhow::Error) {
        if self.status == RunStatus::Failed {
            return;
        }
        let message = error_chain(err);
        let stitch_err = err.downcast_ref::<StitchError>();
        let emitted = self.events.emit(
            "stitch_failed",
            map_object(json!({
                "error": &message,
                "batch_index": Value::Null,
                "batches_submitted": self.batches_submitted,
                "quota_exhausted": stitch_err.is_some_and(StitchError::is_quota_exhausted),
                "retryable_later": stitch_err.is_some_and(StitchError::is_retryable_later),
            })),
        );
        if let Err(emit_err) = emitted {
            warn!(error = %emit_err, "failed to record stitch failure event");
        }
        self.status = RunStatus::Failed;
        self.composite_path = None;
        self.error = Some(message);
    }

    fn submit_batches(
        &mut self,
        parts: &[ImagePart],
        mut observer: impl FnMut(&StitchEvent),
    ) -> Result<PathBuf> {
        let selection = self.selected_model()?;
        let model = selection.model;
        let batch_estimate = self.batch_estimate_for(parts);
        self.status = RunStatus::Running;
        let mut submitted = 0usize;

        let outcome = {
            let Some(provider) = self.providers.get(&model.provider) else {
                bail!("No stitch provider registered for '{}'", model.provider);
            };
            let orchestrator =
                StitchOrchestrator::new(provider, model.api_model.clone(), self.settings.budget_bytes)
                    .with_batch_estimate(batch_estimate);
            match orchestrator.start(parts) {
                Err(err) => Err(err),
                Ok(run) => {
                    let mut result = Err(StitchError::InsufficientImages { found: parts.len() });
                    let mut batch_started_at = Instant::now();
                    for event in run {
                        observer(&event);
                        match event {
                            StitchEvent::BatchStarted(progress) => {
                                batch_started_at = Instant::now();
                                self.events.emit("batch_started", progress_payload(&progress))?;
                            }
                            StitchEvent::BatchCompleted(record) => {
                                submitted += 1;
                                self.batches_submitted += 1;
                                let latency_s = batch_started_at.elapsed().as_secs_f64();
                                let receipt_path = self.run_dir.join(format!(
                                    "receipt-batch-{:02}.json",
                                    record.progress.batch_index
                                ));
                                write_batch_receipt(
                                    &receipt_path,
                                    provider.name(),
                                    &model.name,
                                    &record,
                                    latency_s,
                                )?;
                                self.events.emit(
                                    "batch_completed",
                                    map_object(json!({
                                        "batch_index": record.progress.batch_index,
                                        "consumed": record.consumed,
                                        "remaining": record.remaining,
                                        "composite_bytes": record.composite_bytes,
                                        "latency_s": latency_s,
                                        "warnings": record.warnings,
                                        "receipt_path": receipt_path.to_string_lossy().to_string(),
                                    })),
                                )?;
                            }
                            StitchEvent::Succeeded {
                                composite,
                                batch_count,
                            } => result = Ok((composite, batch_count)),
                            StitchEvent::Failed(err) => result = Err(err),
                        }
                    }
                    result
                }
            }
        };
        match outcome {
            Ok((composite, batch_count)) => {
                let path = self.write_composite(&composite)?;
                self.events.emit(
                    "stitch_succeeded",
                    map_object(json!({
                        "batch_count": batch_count,
                        "composite_path": path.to_string_lossy().to_string(),
                        "mime_type": composite.mime_type(),
                        "model": model.name,
                        "provider": model.provider,
                    })),
                )?;
                self.status = RunStatus::Succeeded;
                self.composite_path = Some(path.clone());
                self.error = None;
                Ok(path)
            }
            Err(err) => {
                let batch_index = match &err {
                    StitchError::RemoteStitch { batch_index, .. } => Some(*batch_index),
                    StitchError::ImageTooLarge { .. } => Some(submitted + 1),
                    _ => None,
                };
                self.status = RunStatus::Failed;
                self.composite_path = None;
                self.error = Some(err.to_string());
                self.events.emit(
                    "stitch_failed",
                    map_object(json!({
                        "error": err.to_string(),
                        "batch_index": batch_index,
                        "batches_submitted": submitted,
                        "quota_exhausted": err.is_quota_exhausted(),
                        "retryable_later": err.is_retryable_later(),
                        "model": model.name,
                        "provider": model.provider,
                    })),
                )?;
                Err(err.into())
            }
        }
    }

    fn write_composite(&self, composite: &ImagePart) -> Result<PathBuf> {
        let path = self.run_dir.join(format!(
            "composite.{}",
            extension_for_mime(composite.mime_type())
        ));
        let bytes = composite
            .decode_bytes()
            .context("stitched image is not valid base64")?;
        fs::write(&path, bytes).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(path)
    }

    pub fn finish(&mut self) -> Result<RunSummary> {
        let summary = RunSummary {
            run_id: self.run_id.clone(),
            started_at: self.started_at.clone(),
            finished_at: now_utc_iso(),
            total_files: self.total_files as u64,
            normalized_images: self.normalized_images as u64,
            failed_files: self.failed_files.clone(),
            batches_submitted: self.batches_submitted as u64,
            outcome: status_label(self.status).to_string(),
            composite_path: self
                .composite_path
                .as_ref()
                .map(|path| path.to_string_lossy().to_string()),
            error: self.error.clone(),
        };
        write_summary(&self.summary_path, &summary)?;
        self.events.emit(
            "run_finished",
            map_object(json!({
                "summary_path": self.summary_path.to_string_lossy().to_string(),
                "outcome": summary.outcome,
            })),
        )?;
        Ok(summary)
    }
}

fn progress_payload(progress: &BatchProgress) -> Map<String, Value> {
    map_object(json!({
        "batch_index": progress.batch_index,
        "total_batches_estimate": progress.total_batches_estimate,
        "first_image_index": progress.first_image_index,
        "image_count": progress.image_count,
        "has_base_image": progress.has_base_image,
        "payload_bytes": progress.payload_bytes,
        "budget_bytes": progress.budget_bytes,
        "message": progress.message(),
    }))
}

fn write_batch_receipt(
    path: &Path,
    provider: &str,
    model: &str,
    record: &BatchRecord,
    latency_s: f64,
) -> Result<()> {
    let progress = &record.progress;
    let submission = BatchSubmission {
        batch_index: progress.batch_index,
        provider: provider.to_string(),
        model: model.to_string(),
        image_count: progress.image_count,
        first_image_index: progress.first_image_index,
        has_base_image: progress.has_base_image,
        payload_bytes: progress.payload_bytes,
        budget_bytes: progress.budget_bytes,
    };
    let result_metadata = map_object(json!({
        "consumed": record.consumed,
        "remaining": record.remaining,
        "composite_bytes": record.composite_bytes,
        "latency_s": latency_s,
    }));
    let receipt = build_receipt(
        &submission,
        &record.provider_request,
        &record.provider_response,
        &record.warnings,
        path,
        &result_metadata,
    );
    write_receipt(path, &receipt)
        .with_context(|| format!("failed to write {}", path.display()))
}

fn status_label(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Idle => "idle",
        RunStatus::Running => "running",
        RunStatus::Succeeded => "succeeded",
        RunStatus::Failed => "failed",
    }
}

fn extension_for_mime(mime_type: &str) -> &'static str {
    let lowered = mime_type.to_ascii_lowercase();
    if lowered.contains("jpeg") || lowered.contains("jpg") {
        return "jpg";
    }
    if lowered.contains("webp") {
        return "webp";
    }
    if lowered.contains("png") {
        return "png";
    }
    "img"
}

/// Every distinct message in `err`'s cause chain, outermost first.
pub(crate) fn error_chain(err: &anyhow::Error) -> String {
    let mut parts = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts
            .last()
            .map(|existing| existing == trimmed)
            .unwrap_or(false)
        {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return err.to_string();
    }
    parts.join(" | caused by: ")
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

pub(crate) fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

fn now_utc_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, false)
}

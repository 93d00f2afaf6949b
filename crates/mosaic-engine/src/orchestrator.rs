//! Sequential batch submission against a running composite.
//!
//! A run is a lazy sequence of [`StitchEvent`]s. Each `next()` performs at
//! most one provider call; dropping the run abandons it.

use std::iter::FusedIterator;

use mosaic_contracts::parts::ImagePart;
use mosaic_contracts::relay::StitchRequest;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::error::StitchError;
use crate::error_chain;
use crate::planner::{BatchChain, BatchPlan};
use crate::providers::{ProviderStitchRequest, StitchProvider};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Idle,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchProgress {
    /// 1-based.
    pub batch_index: usize,
    /// Never below `batch_index`; 1 when no estimate was supplied.
    pub total_batches_estimate: usize,
    pub first_image_index: usize,
    pub image_count: usize,
    pub has_base_image: bool,
    pub payload_bytes: usize,
    pub budget_bytes: usize,
}

impl BatchProgress {
    pub fn message(&self) -> String {
        format!(
            "Stitching Batch {}/{}",
            self.batch_index, self.total_batches_estimate
        )
    }
}

#[derive(Debug, Clone)]
pub struct BatchRecord {
    pub progress: BatchProgress,
    pub consumed: usize,
    pub remaining: usize,
    pub composite_bytes: usize,
    pub provider_request: Map<String, Value>,
    pub provider_response: Map<String, Value>,
    pub warnings: Vec<String>,
}

#[derive(Debug)]
pub enum StitchEvent {
    BatchStarted(BatchProgress),
    BatchCompleted(BatchRecord),
    Succeeded {
        composite: ImagePart,
        batch_count: usize,
    },
    Failed(StitchError),
}

pub struct StitchOrchestrator<'p> {
    provider: &'p dyn StitchProvider,
    model: String,
    budget_bytes: usize,
    batch_estimate: Option<usize>,
}

impl<'p> StitchOrchestrator<'p> {
    pub fn new(provider: &'p dyn StitchProvider, model: impl Into<String>, budget_bytes: usize) -> Self {
        Self {
            provider,
            model: model.into(),
            budget_bytes,
            batch_estimate: None,
        }
    }

    /// Denominator shown in batch progress.
    pub fn with_batch_estimate(mut self, batch_count: Option<usize>) -> Self {
        self.batch_estimate = batch_count;
        self
    }

    /// Rejects fewer than two parts before any work starts.
    pub fn start<'a>(&'a self, parts: &'a [ImagePart]) -> Result<StitchRun<'a>, StitchError> {
        if parts.len() < 2 {
            return Err(StitchError::InsufficientImages { found: parts.len() });
        }
        Ok(StitchRun {
            provider: self.provider,
            model: &self.model,
            batch_estimate: self.batch_estimate,
            chain: BatchChain::new(parts, self.budget_bytes),
            state: RunState::Planning,
            status: RunStatus::Idle,
        })
    }

    /// Drives a run to completion and returns the final composite.
    pub fn run(&self, parts: &[ImagePart]) -> Result<ImagePart, StitchError> {
        for event in self.start(parts)? {
            match event {
                StitchEvent::Succeeded { composite, .. } => return Ok(composite),
                StitchEvent::Failed(err) => return Err(err),
                StitchEvent::BatchStarted(_) | StitchEvent::BatchCompleted(_) => {}
            }
        }
        Err(StitchError::InsufficientImages { found: parts.len() })
    }
}

enum RunState {
    Planning,
    Submitting(BatchPlan, BatchProgress),
    Done,
}

pub struct StitchRun<'a> {
    provider: &'a dyn StitchProvider,
    model: &'a str,
    batch_estimate: Option<usize>,
    chain: BatchChain<'a>,
    state: RunState,
    status: RunStatus,
}

impl<'a> StitchRun<'a> {
    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn batches_submitted(&self) -> usize {
        self.chain.batches_consumed()
    }

    fn fail(&mut self, err: StitchError) -> StitchEvent {
        warn!(
            batch_index = self.chain.batches_consumed() + 1,
            error = %err,
            "stitch run failed"
        );
        self.state = RunState::Done;
        self.status = RunStatus::Failed;
        StitchEvent::Failed(err)
    }

    fn progress_for(&self, plan: BatchPlan) -> BatchProgress {
        let step = self.chain.step(plan);
        BatchProgress {
            batch_index: step.batch_index,
            total_batches_estimate: self.batch_estimate.unwrap_or(1).max(step.batch_index),
            first_image_index: step.first_image_index,
            image_count: step.images.len(),
            has_base_image: step.base.is_some(),
            payload_bytes: step.payload_bytes,
            budget_bytes: self.chain.budget_bytes(),
        }
    }

    fn plan_next(&mut self) -> StitchEvent {
        if self.chain.is_finished() {
            let batch_count = self.chain.batches_consumed();
            let composite = self.chain.take_composite();
            self.state = RunState::Done;
            return match composite {
                Some(composite) => {
                    self.status = RunStatus::Succeeded;
                    info!(batch_count, "stitch run succeeded");
                    StitchEvent::Succeeded {
                        composite,
                        batch_count,
                    }
                }
                None => self.fail(StitchError::InsufficientImages { found: 0 }),
            };
        }
        match self.chain.plan() {
            Ok(plan) => {
                let progress = self.progress_for(plan);
                self.state = RunState::Submitting(plan, progress);
                StitchEvent::BatchStarted(progress)
            }
            Err(err) => self.fail(err),
        }
    }

    fn submit(&mut self, plan: BatchPlan, progress: BatchProgress) -> StitchEvent {
        info!(
            batch_index = progress.batch_index,
            images = progress.image_count,
            payload_bytes = progress.payload_bytes,
            provider = self.provider.name(),
            "submitting batch"
        );
        let response = {
            let step = self.chain.step(plan);
            let request = ProviderStitchRequest {
                model: self.model,
                batch_index: step.batch_index,
                payload: StitchRequest::new(step.images, step.base),
            };
            self.provider.stitch(&request)
        };
        match response {
            Ok(response) => {
                let composite_bytes = response.composite.encoded_len();
                self.chain.advance(plan, response.composite);
                self.state = RunState::Planning;
                StitchEvent::BatchCompleted(BatchRecord {
                    progress,
                    consumed: self.chain.consumed(),
                    remaining: self.chain.remaining().len(),
                    composite_bytes,
                    provider_request: response.provider_request,
                    provider_response: response.provider_response,
                    warnings: response.warnings,
                })
            }
            Err(err) => self.fail(StitchError::RemoteStitch {
                batch_index: progress.batch_index,
                message: error_chain(&err),
            }),
        }
    }
}

impl Iterator for StitchRun<'_> {
    type Item = StitchEvent;

    fn next(&mut self) -> Option<Self::Item> {
        match std::mem::replace(&mut self.state, RunState::Done) {
            RunState::Done => None,
            RunState::Planning => {
                self.status = RunStatus::Running;
                Some(self.plan_next())
            }
            RunState::Submitting(plan, progress) => Some(self.submit(plan, progress)),
        }
    }
}

impl FusedIterator for StitchRun<'_> {}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use anyhow::bail;
    use mosaic_contracts::parts::{ImagePart, JPEG_MIME};
    use serde_json::Map;

    use super::{RunStatus, StitchEvent, StitchOrchestrator};
    use crate::error::StitchError;
    use crate::estimate::CostEstimator;
    use crate::providers::{ProviderStitchRequest, ProviderStitchResponse, StitchProvider};

    const MB: usize = 1_000_000;
    const BUDGET: usize = 3_984_588;

    fn part(len: usize) -> ImagePart {
        ImagePart::new("A".repeat(len), JPEG_MIME)
    }

    fn tagged(tag: char, len: usize) -> ImagePart {
        ImagePart::new(tag.to_string().repeat(len), JPEG_MIME)
    }

    /// Answers every batch with its largest image and records what it saw.
    #[derive(Default)]
    struct MockStitcher {
        calls: AtomicUsize,
        fail_on_batch: Option<usize>,
        seen: Mutex<Vec<(usize, bool, String)>>,
    }

    impl MockStitcher {
        fn failing_on(batch_index: usize) -> Self {
            Self {
                fail_on_batch: Some(batch_index),
                ..Self::default()
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl StitchProvider for MockStitcher {
        fn name(&self) -> &str {
            "mock"
        }

        fn stitch(&self, request: &ProviderStitchRequest<'_>) -> anyhow::Result<ProviderStitchResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let first_chars: String = request
                .payload
                .images
                .iter()
                .filter_map(|image| image.data().chars().next())
                .collect();
            if let Ok(mut seen) = self.seen.lock() {
                seen.push((
                    request.batch_index,
                    request.payload.base_image.is_some(),
                    first_chars,
                ));
            }
            if self.fail_on_batch == Some(request.batch_index) {
                bail!("Failed to stitch images: upstream returned 500");
            }
            let Some(largest) = request
                .payload
                .images
                .iter()
                .reduce(|largest, current| {
                    if current.encoded_len() > largest.encoded_len() {
                        current
                    } else {
                        largest
                    }
                })
            else {
                bail!("empty batch");
            };
            Ok(ProviderStitchResponse {
                composite: largest.clone(),
                provider_request: Map::new(),
                provider_response: Map::new(),
                warnings: Vec::new(),
            })
        }
    }

    #[test]
    fn fewer_than_two_images_fail_before_any_call() {
        let stitcher = MockStitcher::default();
        let orchestrator = StitchOrchestrator::new(&stitcher, "mock-1", BUDGET);
        let err = orchestrator.run(&[part(10)]).unwrap_err();
        assert!(matches!(err, StitchError::InsufficientImages { found: 1 }));
        assert!(orchestrator.start(&[]).is_err());
        assert_eq!(stitcher.calls(), 0);
    }

    #[test]
    fn oversized_image_fails_without_network_call() {
        let stitcher = MockStitcher::default();
        let orchestrator = StitchOrchestrator::new(&stitcher, "mock-1", BUDGET);
        let parts = vec![part(5 * MB), part(10)];
        let mut run = orchestrator.start(&parts).unwrap();
        assert_eq!(run.status(), RunStatus::Idle);
        let events: Vec<StitchEvent> = run.by_ref().collect();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            StitchEvent::Failed(StitchError::ImageTooLarge { image_index: 0, .. })
        ));
        assert_eq!(run.status(), RunStatus::Failed);
        assert_eq!(stitcher.calls(), 0);
    }

    #[test]
    fn remote_failure_on_second_batch_discards_composite() {
        let stitcher = MockStitcher::failing_on(2);
        let orchestrator = StitchOrchestrator::new(&stitcher, "mock-1", BUDGET);
        // Three batches: 3 fresh images, then composite + 2, twice.
        let parts: Vec<ImagePart> = (0..7).map(|_| part(MB)).collect();
        let mut run = orchestrator.start(&parts).unwrap();
        let events: Vec<StitchEvent> = run.by_ref().collect();

        let kinds: Vec<&str> = events
            .iter()
            .map(|event| match event {
                StitchEvent::BatchStarted(_) => "started",
                StitchEvent::BatchCompleted(_) => "completed",
                StitchEvent::Succeeded { .. } => "succeeded",
                StitchEvent::Failed(_) => "failed",
            })
            .collect();
        assert_eq!(kinds, vec!["started", "completed", "started", "failed"]);
        match events.last() {
            Some(StitchEvent::Failed(err)) => {
                assert!(matches!(err, StitchError::RemoteStitch { batch_index: 2, .. }));
                assert_eq!(
                    err.to_string(),
                    "Failed to stitch images: upstream returned 500"
                );
                assert!(err.is_retryable_later());
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(run.status(), RunStatus::Failed);
        assert!(run.next().is_none());
        assert_eq!(stitcher.calls(), 2);
    }

    #[test]
    fn batches_are_submitted_in_input_order_against_prior_composite() -> anyhow::Result<()> {
        let stitcher = MockStitcher::default();
        let orchestrator = StitchOrchestrator::new(&stitcher, "mock-1", BUDGET);
        let parts = vec![
            tagged('a', 1_500_000),
            tagged('b', 1_500_000),
            tagged('c', 1_500_000),
            tagged('d', 10),
        ];
        let composite = orchestrator.run(&parts)?;
        assert_eq!(composite.data().chars().next(), Some('c'));

        let seen = stitcher.seen.lock().map_err(|_| anyhow::anyhow!("poisoned"))?;
        assert_eq!(
            *seen,
            vec![
                (1, false, "ab".to_string()),
                (2, true, "cd".to_string()),
            ]
        );
        Ok(())
    }

    #[test]
    fn progress_denominator_uses_estimate_but_never_lags() -> anyhow::Result<()> {
        let stitcher = MockStitcher::default();
        let parts: Vec<ImagePart> = (0..7).map(|_| part(MB)).collect();

        let orchestrator = StitchOrchestrator::new(&stitcher, "mock-1", BUDGET);
        let messages: Vec<String> = orchestrator
            .start(&parts)?
            .filter_map(|event| match event {
                StitchEvent::BatchStarted(progress) => Some(progress.message()),
                _ => None,
            })
            .collect();
        assert_eq!(messages, vec!["Stitching Batch 1/1", "Stitching Batch 2/2", "Stitching Batch 3/3"]);

        let orchestrator =
            StitchOrchestrator::new(&stitcher, "mock-1", BUDGET).with_batch_estimate(Some(3));
        let messages: Vec<String> = orchestrator
            .start(&parts)?
            .filter_map(|event| match event {
                StitchEvent::BatchStarted(progress) => Some(progress.message()),
                _ => None,
            })
            .collect();
        assert_eq!(messages, vec!["Stitching Batch 1/3", "Stitching Batch 2/3", "Stitching Batch 3/3"]);
        Ok(())
    }

    #[test]
    fn estimator_agrees_with_run_when_composite_matches_stand_in() -> anyhow::Result<()> {
        let inputs: Vec<Vec<usize>> = vec![
            vec![MB, MB, MB],
            vec![1_500_000, 1_500_000, 1_500_000],
            vec![3 * MB, 200_000, 900_000, 2 * MB, 10, 10],
            vec![100, 200, 300, 400],
        ];
        for sizes in inputs {
            let parts: Vec<ImagePart> = sizes.iter().copied().map(part).collect();
            let estimate = CostEstimator::new(BUDGET, 0.0025)
                .estimate(&parts)?
                .ok_or_else(|| anyhow::anyhow!("missing estimate"))?;

            let stitcher = MockStitcher::default();
            let orchestrator = StitchOrchestrator::new(&stitcher, "mock-1", BUDGET);
            let batch_count = orchestrator
                .start(&parts)?
                .find_map(|event| match event {
                    StitchEvent::Succeeded { batch_count, .. } => Some(batch_count),
                    _ => None,
                })
                .ok_or_else(|| anyhow::anyhow!("run did not succeed for {sizes:?}"))?;
            assert_eq!(batch_count, estimate.batch_count, "sizes {sizes:?}");
            assert_eq!(stitcher.calls(), batch_count);
        }
        Ok(())
    }

    #[test]
    fn batch_records_track_consumption() -> anyhow::Result<()> {
        let stitcher = MockStitcher::default();
        let orchestrator = StitchOrchestrator::new(&stitcher, "mock-1", BUDGET);
        let parts = vec![part(MB), part(MB), part(MB), part(MB)];
        let mut run = orchestrator.start(&parts)?;
        let records: Vec<(usize, usize)> = run
            .by_ref()
            .filter_map(|event| match event {
                StitchEvent::BatchCompleted(record) => Some((record.consumed, record.remaining)),
                _ => None,
            })
            .collect();
        assert_eq!(records, vec![(3, 1), (4, 0)]);
        assert_eq!(run.status(), RunStatus::Succeeded);
        assert_eq!(run.batches_submitted(), 2);
        Ok(())
    }

    struct VerboseFailure(String);

    impl StitchProvider for VerboseFailure {
        fn name(&self) -> &str {
            "verbose"
        }

        fn stitch(&self, _request: &ProviderStitchRequest<'_>) -> anyhow::Result<ProviderStitchResponse> {
            bail!(self.0.clone())
        }
    }

    #[test]
    fn long_provider_messages_surface_verbatim() {
        let message = format!("Failed to stitch images: {}", "x".repeat(5000));
        let stitcher = VerboseFailure(message.clone());
        let orchestrator = StitchOrchestrator::new(&stitcher, "mock-1", BUDGET);
        let err = orchestrator.run(&[part(10), part(10)]).unwrap_err();
        match err {
            StitchError::RemoteStitch {
                batch_index,
                message: surfaced,
            } => {
                assert_eq!(batch_index, 1);
                assert_eq!(surfaced, message);
            }
            other => panic!("expected RemoteStitch, got {other:?}"),
        }
    }
}

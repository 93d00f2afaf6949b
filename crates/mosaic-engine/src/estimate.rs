//! Dry-run of the batching loop: how many stitch calls a set of images will
//! take and what it will cost, before any network call.

use mosaic_contracts::parts::ImagePart;
use sha2::{Digest, Sha256};

use crate::error::StitchError;
use crate::planner::{BatchChain, BatchStep, CompositeSource};

#[derive(Debug, Clone, PartialEq)]
pub struct EstimationResult {
    pub batch_count: usize,
    pub image_count: usize,
    pub cost_per_image_usd: f64,
    pub estimated_cost_usd: f64,
    /// Digest of the image set the estimate was computed for.
    pub fingerprint: String,
}

impl EstimationResult {
    /// True when `parts` is not the image set this estimate describes.
    pub fn is_stale_for(&self, parts: &[ImagePart]) -> bool {
        self.fingerprint != image_set_fingerprint(parts)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CostEstimator {
    budget_bytes: usize,
    cost_per_image_usd: f64,
}

impl CostEstimator {
    pub fn new(budget_bytes: usize, cost_per_image_usd: f64) -> Self {
        Self {
            budget_bytes,
            cost_per_image_usd,
        }
    }

    /// `None` for fewer than two images: nothing would be sent to the model.
    ///
    /// The composite size after each batch is unknown until the model
    /// answers, so the largest image of the batch stands in for it. The batch
    /// count is an estimate, not a guarantee.
    pub fn estimate(&self, parts: &[ImagePart]) -> Result<Option<EstimationResult>, StitchError> {
        if parts.len() < 2 {
            return Ok(None);
        }
        let outcome = BatchChain::new(parts, self.budget_bytes).run(&mut LargestImageStandIn)?;
        Ok(Some(EstimationResult {
            batch_count: outcome.batch_count,
            image_count: parts.len(),
            cost_per_image_usd: self.cost_per_image_usd,
            estimated_cost_usd: parts.len() as f64 * self.cost_per_image_usd,
            fingerprint: image_set_fingerprint(parts),
        }))
    }
}

/// Stands in for the model's output with the largest image just consumed.
#[derive(Debug, Clone, Copy, Default)]
pub struct LargestImageStandIn;

impl CompositeSource for LargestImageStandIn {
    fn stitch(&mut self, step: &BatchStep<'_>) -> Result<ImagePart, StitchError> {
        step.images
            .iter()
            .reduce(|largest, current| {
                if current.encoded_len() > largest.encoded_len() {
                    current
                } else {
                    largest
                }
            })
            .cloned()
            .ok_or(StitchError::EmptyBatch {
                first_image_index: step.first_image_index,
            })
    }
}

pub fn image_set_fingerprint(parts: &[ImagePart]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.mime_type().as_bytes());
        hasher.update([0u8]);
        hasher.update(part.data().as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

pub fn format_cost(value: Option<f64>) -> String {
    match value {
        Some(raw) => format!("${raw:.4}"),
        None => "N/A".to_string(),
    }
}

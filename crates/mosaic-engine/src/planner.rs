//! Greedy, order-preserving partition of image parts into budget-bounded
//! batches, chained against a running composite.

use mosaic_contracts::parts::ImagePart;
use tracing::debug;

use crate::error::StitchError;
use crate::payload::measure;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPlan {
    /// Number of leading images of `remaining` that go into this batch.
    pub len: usize,
    /// Measured request size of those images plus the composite.
    pub payload_bytes: usize,
}

/// Takes the longest prefix of `remaining` whose request, together with
/// `composite`, fits in `budget_bytes`. Never skips ahead to a later, smaller
/// image. An empty `remaining` yields an empty plan; a first image that does
/// not fit alone is `ImageTooLarge` (index relative to `remaining`).
pub fn plan_next_batch(
    remaining: &[ImagePart],
    composite: Option<&ImagePart>,
    budget_bytes: usize,
) -> Result<BatchPlan, StitchError> {
    let mut plan = BatchPlan {
        len: 0,
        payload_bytes: measure(&[], composite)?,
    };
    for len in 1..=remaining.len() {
        let payload_bytes = measure(&remaining[..len], composite)?;
        if payload_bytes > budget_bytes {
            if len == 1 {
                return Err(StitchError::ImageTooLarge {
                    image_index: 0,
                    payload_bytes,
                    budget_bytes,
                    with_composite: composite.is_some(),
                });
            }
            break;
        }
        plan = BatchPlan { len, payload_bytes };
    }
    Ok(plan)
}

/// One planned batch, ready to hand to a composite source.
#[derive(Debug, Clone, Copy)]
pub struct BatchStep<'a> {
    /// 1-based.
    pub batch_index: usize,
    /// Index of `images[0]` in the full input sequence.
    pub first_image_index: usize,
    pub images: &'a [ImagePart],
    pub base: Option<&'a ImagePart>,
    pub payload_bytes: usize,
}

/// Produces the composite that stitching a batch onto its base would yield.
pub trait CompositeSource {
    fn stitch(&mut self, step: &BatchStep<'_>) -> Result<ImagePart, StitchError>;
}

/// Fold state over the input sequence: what is left, the composite carried
/// into the next batch, and how many batches were consumed so far.
#[derive(Debug, Clone)]
pub struct BatchChain<'a> {
    parts: &'a [ImagePart],
    cursor: usize,
    composite: Option<ImagePart>,
    budget_bytes: usize,
    batches: usize,
}

impl<'a> BatchChain<'a> {
    pub fn new(parts: &'a [ImagePart], budget_bytes: usize) -> Self {
        Self {
            parts,
            cursor: 0,
            composite: None,
            budget_bytes,
            batches: 0,
        }
    }

    pub fn remaining(&self) -> &'a [ImagePart] {
        let parts = self.parts;
        &parts[self.cursor..]
    }

    pub fn consumed(&self) -> usize {
        self.cursor
    }

    pub fn is_finished(&self) -> bool {
        self.cursor >= self.parts.len()
    }

    pub fn composite(&self) -> Option<&ImagePart> {
        self.composite.as_ref()
    }

    pub fn batches_consumed(&self) -> usize {
        self.batches
    }

    pub fn budget_bytes(&self) -> usize {
        self.budget_bytes
    }

    pub fn plan(&self) -> Result<BatchPlan, StitchError> {
        let plan = plan_next_batch(self.remaining(), self.composite(), self.budget_bytes).map_err(
            |err| match err {
                StitchError::ImageTooLarge {
                    image_index,
                    payload_bytes,
                    budget_bytes,
                    with_composite,
                } => StitchError::ImageTooLarge {
                    image_index: image_index + self.cursor,
                    payload_bytes,
                    budget_bytes,
                    with_composite,
                },
                other => other,
            },
        )?;
        debug!(
            batch_index = self.batches + 1,
            images = plan.len,
            payload_bytes = plan.payload_bytes,
            budget_bytes = self.budget_bytes,
            "planned batch"
        );
        Ok(plan)
    }

    pub fn step(&self, plan: BatchPlan) -> BatchStep<'_> {
        let end = (self.cursor + plan.len).min(self.parts.len());
        BatchStep {
            batch_index: self.batches + 1,
            first_image_index: self.cursor,
            images: &self.parts[self.cursor..end],
            base: self.composite.as_ref(),
            payload_bytes: plan.payload_bytes,
        }
    }

    /// Marks the planned images consumed; `composite` replaces the carried one.
    pub fn advance(&mut self, plan: BatchPlan, composite: ImagePart) {
        self.cursor = (self.cursor + plan.len).min(self.parts.len());
        self.composite = Some(composite);
        self.batches += 1;
    }

    pub fn take_composite(&mut self) -> Option<ImagePart> {
        self.composite.take()
    }

    pub fn into_composite(self) -> Option<ImagePart> {
        self.composite
    }

    /// Runs the whole fold against `source`, returning the final composite.
    pub fn run(mut self, source: &mut impl CompositeSource) -> Result<ChainOutcome, StitchError> {
        while !self.is_finished() {
            let plan = self.plan()?;
            let composite = source.stitch(&self.step(plan))?;
            self.advance(plan, composite);
        }
        let batch_count = self.batches;
        Ok(ChainOutcome {
            batch_count,
            composite: self.into_composite(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChainOutcome {
    pub batch_count: usize,
    pub composite: Option<ImagePart>,
}

//! Error taxonomy for normalization, planning and stitching.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StitchError {
    #[error("Failed to read file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupted image file: {0}")]
    Decode(String),

    #[error("Failed to re-encode image: {0}")]
    Encode(String),

    /// A single image does not fit the budget even alone. When a composite
    /// is already being carried, the composite counts against the budget too.
    #[error(
        "An image is too large to process{}: image {image_index} needs {payload_bytes} bytes against a {budget_bytes} byte budget. Please try smaller images.",
        map_size_suffix(.with_composite)
    )]
    ImageTooLarge {
        image_index: usize,
        payload_bytes: usize,
        budget_bytes: usize,
        with_composite: bool,
    },

    #[error("Please provide at least two valid images to stitch (found {found}).")]
    InsufficientImages { found: usize },

    /// Failure reported by the stitch provider, message passed through.
    #[error("{message}")]
    RemoteStitch { batch_index: usize, message: String },

    #[error("Batch starting at image {first_image_index} has no images to stitch.")]
    EmptyBatch { first_image_index: usize },

    #[error("Request serialization failed: {0}")]
    Payload(#[from] serde_json::Error),
}

impl StitchError {
    /// Quota and rate-limit failures are only distinguishable by message.
    pub fn is_quota_exhausted(&self) -> bool {
        match self {
            Self::RemoteStitch { message, .. } => is_quota_message(message),
            _ => false,
        }
    }

    /// Whether re-running the same input could succeed without user changes.
    pub fn is_retryable_later(&self) -> bool {
        matches!(self, Self::RemoteStitch { .. })
    }
}

fn map_size_suffix(with_composite: &bool) -> &'static str {
    if *with_composite {
        " with the current map size"
    } else {
        ""
    }
}

pub(crate) fn is_quota_message(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    message.contains("429") || message.contains("RESOURCE_EXHAUSTED") || lowered.contains("quota")
}

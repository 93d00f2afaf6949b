use serde::{Deserialize, Serialize};

use crate::parts::ImagePart;

/// Body of one stitch submission.
///
/// `baseImage` is always present on the wire; it is `null` for the first
/// batch of a run. Byte accounting depends on this exact shape.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct StitchRequest<'a> {
    pub images: &'a [ImagePart],
    #[serde(rename = "baseImage")]
    pub base_image: Option<&'a ImagePart>,
}

impl<'a> StitchRequest<'a> {
    pub fn new(images: &'a [ImagePart], base_image: Option<&'a ImagePart>) -> Self {
        Self { images, base_image }
    }
}

/// Relay reply: `{"imageUrl": "data:..."}` on success, `{"error": "..."}`
/// with a non-2xx status on failure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayResponse {
    #[serde(rename = "imageUrl", default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use image::imageops::FilterType;
use image::{DynamicImage, Rgb, RgbImage};
use mosaic_contracts::parts::{ImagePart, JPEG_MIME};
use mosaic_contracts::relay::{RelayResponse, StitchRequest};
use mosaic_contracts::runs::receipts::sanitize_payload;
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Map, Value};

use crate::error::is_quota_message;
use crate::normalize::{encode_jpeg, target_dimensions};
use crate::settings::{non_empty_env, StitchSettings};
use crate::{error_chain, map_object, truncate_text};

pub const PROMPT_WITH_BASE: &str = "Take the first image, which is an existing orthomosaic map, and stitch the subsequent new drone images onto it. The new images may overlap with the map and each other. Align them correctly to expand the map. Output only the final, expanded single image.";
pub const PROMPT_FRESH: &str = "Stitch these top-down drone images into a single, seamless orthomosaic map. The images have overlap. Align them correctly to create a coherent single image of the entire area. Output only the final stitched image.";

pub const QUOTA_EXCEEDED_MESSAGE: &str = "You have exceeded your request quota for the AI service. This is a temporary limit on the free plan. Please wait a few minutes and try again, or check your Google AI billing details for higher limits.";
pub const NO_IMAGE_MESSAGE: &str = "The AI model did not return a valid stitched image.";
pub const RELAY_UNREACHABLE_MESSAGE: &str = "Failed to communicate with the stitching service.";
pub const RELAY_NO_IMAGE_URL_MESSAGE: &str = "The stitching service did not return a valid image URL.";

pub const DEFAULT_RELAY_URL: &str = "http://localhost:3000/api/stitch";
const DEFAULT_GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const REQUEST_TIMEOUT_S: f64 = 180.0;

#[derive(Debug, Clone, Copy)]
pub struct ProviderStitchRequest<'a> {
    pub model: &'a str,
    pub batch_index: usize,
    pub payload: StitchRequest<'a>,
}

impl<'a> ProviderStitchRequest<'a> {
    pub fn prompt(&self) -> &'static str {
        if self.payload.base_image.is_some() {
            PROMPT_WITH_BASE
        } else {
            PROMPT_FRESH
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProviderStitchResponse {
    pub composite: ImagePart,
    pub provider_request: Map<String, Value>,
    pub provider_response: Map<String, Value>,
    pub warnings: Vec<String>,
}

pub trait StitchProvider: Send + Sync {
    fn name(&self) -> &str;
    fn stitch(&self, request: &ProviderStitchRequest<'_>) -> Result<ProviderStitchResponse>;
}

#[derive(Default)]
pub struct StitchProviderRegistry {
    providers: BTreeMap<String, Box<dyn StitchProvider>>,
}

impl StitchProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: StitchProvider + 'static>(&mut self, provider: P) {
        self.providers
            .insert(provider.name().to_string(), Box::new(provider));
    }

    pub fn get(&self, name: &str) -> Option<&dyn StitchProvider> {
        self.providers.get(name).map(|provider| provider.as_ref())
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }
}

pub fn default_provider_registry(settings: &StitchSettings) -> StitchProviderRegistry {
    let mut registry = StitchProviderRegistry::new();
    registry.register(DryrunStitcher::new(settings));
    registry.register(GeminiStitcher::new());
    registry.register(RelayStitcher::new());
    registry
}

/// Rewrites a raw stitch failure the way the relay reports it to clients.
pub fn stitch_failure_message(raw: &str) -> String {
    if is_quota_message(raw) {
        QUOTA_EXCEEDED_MESSAGE.to_string()
    } else {
        format!("Failed to stitch images: {raw}")
    }
}

/// Local stand-in that places the base and the batch images side by side.
pub struct DryrunStitcher {
    max_dimension: u32,
    jpeg_quality: u8,
}

impl DryrunStitcher {
    pub fn new(settings: &StitchSettings) -> Self {
        Self {
            max_dimension: settings.max_dimension.max(1),
            jpeg_quality: settings.jpeg_quality.clamp(1, 100),
        }
    }

    fn compose(&self, images: &[DynamicImage]) -> DynamicImage {
        let width: u32 = images.iter().map(DynamicImage::width).sum::<u32>().max(1);
        let height = images
            .iter()
            .map(DynamicImage::height)
            .max()
            .unwrap_or(1)
            .max(1);
        let mut canvas = RgbImage::from_pixel(width, height, Rgb([255, 255, 255]));
        let mut x = 0i64;
        for image in images {
            image::imageops::overlay(&mut canvas, &image.to_rgb8(), x, 0);
            x += i64::from(image.width());
        }
        let canvas = DynamicImage::ImageRgb8(canvas);
        let (target_width, target_height) = target_dimensions(width, height, self.max_dimension);
        if (target_width, target_height) == (width, height) {
            canvas
        } else {
            canvas.resize_exact(target_width, target_height, FilterType::Triangle)
        }
    }
}

impl StitchProvider for DryrunStitcher {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn stitch(&self, request: &ProviderStitchRequest<'_>) -> Result<ProviderStitchResponse> {
        let mut decoded = Vec::new();
        for (idx, part) in request
            .payload
            .base_image
            .into_iter()
            .chain(request.payload.images.iter())
            .enumerate()
        {
            let bytes = part.decode_bytes()?;
            let image = image::load_from_memory(&bytes)
                .with_context(|| format!("dryrun could not decode input image {idx}"))?;
            decoded.push(image);
        }
        if decoded.is_empty() {
            bail!("dryrun received no images");
        }
        let composite = self.compose(&decoded);
        let bytes = encode_jpeg(&composite, self.jpeg_quality)?;

        let provider_request = map_object(json!({
            "model": request.model,
            "batch_index": request.batch_index,
            "image_count": request.payload.images.len(),
            "has_base_image": request.payload.base_image.is_some(),
            "prompt": request.prompt(),
        }));
        let provider_response = map_object(json!({
            "width": composite.width(),
            "height": composite.height(),
            "bytes": bytes.len(),
        }));
        Ok(ProviderStitchResponse {
            composite: ImagePart::from_bytes(&bytes, JPEG_MIME),
            provider_request,
            provider_response,
            warnings: Vec::new(),
        })
    }
}

/// Direct `generateContent` call against the Gemini API.
pub struct GeminiStitcher {
    api_base: String,
    http: HttpClient,
}

impl GeminiStitcher {
    pub fn new() -> Self {
        Self {
            api_base: non_empty_env("GEMINI_API_BASE")
                .map(|value| value.trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| DEFAULT_GEMINI_API_BASE.to_string()),
            http: HttpClient::new(),
        }
    }

    fn api_key() -> Option<String> {
        non_empty_env("GEMINI_API_KEY")
            .or_else(|| non_empty_env("GOOGLE_API_KEY"))
            .or_else(|| non_empty_env("API_KEY"))
    }

    fn endpoint_for_model(&self, model: &str) -> String {
        let trimmed = model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }

    /// Base image first, then the batch, then the instruction.
    pub fn build_payload(request: &ProviderStitchRequest<'_>) -> Result<Value> {
        let mut parts = Vec::new();
        if let Some(base) = request.payload.base_image {
            parts.push(serde_json::to_value(base)?);
        }
        for image in request.payload.images {
            parts.push(serde_json::to_value(image)?);
        }
        parts.push(json!({ "text": request.prompt() }));
        Ok(json!({
            "contents": [{ "role": "user", "parts": parts }],
            "generationConfig": { "responseModalities": ["IMAGE"] },
        }))
    }

    /// First inline image of the first candidate; data and mime type are
    /// both required.
    pub fn extract_composite(response_payload: &Value) -> Option<ImagePart> {
        let parts = response_payload
            .get("candidates")
            .and_then(Value::as_array)
            .and_then(|candidates| candidates.first())
            .and_then(|candidate| candidate.get("content"))
            .and_then(|content| content.get("parts"))
            .and_then(Value::as_array)?;
        let inline = parts.iter().find_map(|part| {
            part.get("inlineData")
                .or_else(|| part.get("inline_data"))
                .and_then(Value::as_object)
        })?;
        let data = inline
            .get("data")
            .and_then(Value::as_str)
            .filter(|value| !value.is_empty())?;
        let mime_type = inline
            .get("mimeType")
            .or_else(|| inline.get("mime_type"))
            .and_then(Value::as_str)
            .filter(|value| !value.is_empty())?;
        Some(ImagePart::new(data, mime_type))
    }

    fn send(&self, endpoint: &str, api_key: &str, payload: &Value) -> Result<Value> {
        let response = self
            .http
            .post(endpoint)
            .query(&[("key", api_key)])
            .timeout(Duration::from_secs_f64(REQUEST_TIMEOUT_S))
            .json(payload)
            .send()
            .map_err(reqwest::Error::without_url)
            .with_context(|| format!("Gemini request failed ({endpoint})"))?;
        response_json_or_error("Gemini", response)
    }
}

impl Default for GeminiStitcher {
    fn default() -> Self {
        Self::new()
    }
}

impl StitchProvider for GeminiStitcher {
    fn name(&self) -> &str {
        "gemini"
    }

    fn stitch(&self, request: &ProviderStitchRequest<'_>) -> Result<ProviderStitchResponse> {
        let Some(api_key) = Self::api_key() else {
            bail!("GEMINI_API_KEY or GOOGLE_API_KEY or API_KEY not set");
        };
        let endpoint = self.endpoint_for_model(request.model);
        let payload = Self::build_payload(request)?;

        let response_payload = match self.send(&endpoint, &api_key, &payload) {
            Ok(value) => value,
            Err(err) => bail!(stitch_failure_message(&error_chain(&err))),
        };
        let Some(composite) = Self::extract_composite(&response_payload) else {
            bail!(stitch_failure_message(NO_IMAGE_MESSAGE));
        };

        let mut provider_request = map_object(sanitize_payload(&payload));
        provider_request.insert("endpoint".to_string(), Value::String(endpoint));
        Ok(ProviderStitchResponse {
            composite,
            provider_request,
            provider_response: map_object(sanitize_payload(&response_payload)),
            warnings: Vec::new(),
        })
    }
}

/// Sends the batch to a relay that speaks the `{images, baseImage}` protocol.
pub struct RelayStitcher {
    url: String,
    http: HttpClient,
}

impl RelayStitcher {
    pub fn new() -> Self {
        Self::with_url(non_empty_env("MOSAIC_RELAY_URL").unwrap_or_else(|| DEFAULT_RELAY_URL.to_string()))
    }

    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            http: HttpClient::new(),
        }
    }

    /// Turns a relay reply into a composite or the message shown to users.
    pub fn interpret_reply(success: bool, body: &str) -> Result<ImagePart> {
        let reply: Option<RelayResponse> = serde_json::from_str(body).ok();
        if !success {
            let message = reply
                .and_then(|reply| reply.error)
                .filter(|message| !message.trim().is_empty())
                .unwrap_or_else(|| RELAY_UNREACHABLE_MESSAGE.to_string());
            bail!(message);
        }
        let Some(image_url) = reply
            .and_then(|reply| reply.image_url)
            .filter(|url| !url.trim().is_empty())
        else {
            bail!(RELAY_NO_IMAGE_URL_MESSAGE);
        };
        ImagePart::from_data_url(&image_url).map_err(|reason| {
            anyhow::anyhow!("{RELAY_NO_IMAGE_URL_MESSAGE} ({reason})")
        })
    }
}

impl Default for RelayStitcher {
    fn default() -> Self {
        Self::new()
    }
}

impl StitchProvider for RelayStitcher {
    fn name(&self) -> &str {
        "relay"
    }

    fn stitch(&self, request: &ProviderStitchRequest<'_>) -> Result<ProviderStitchResponse> {
        let response = self
            .http
            .post(&self.url)
            .timeout(Duration::from_secs_f64(REQUEST_TIMEOUT_S))
            .json(&request.payload)
            .send()
            .with_context(|| RELAY_UNREACHABLE_MESSAGE.to_string())?;
        let status = response.status();
        let body = response
            .text()
            .with_context(|| RELAY_UNREACHABLE_MESSAGE.to_string())?;
        let composite = Self::interpret_reply(status.is_success(), &body)?;

        let provider_request = map_object(json!({
            "url": self.url,
            "model": request.model,
            "image_count": request.payload.images.len(),
            "has_base_image": request.payload.base_image.is_some(),
        }));
        let provider_response = map_object(json!({
            "status": status.as_u16(),
            "mime_type": composite.mime_type(),
        }));
        Ok(ProviderStitchResponse {
            composite,
            provider_request,
            provider_response,
            warnings: Vec::new(),
        })
    }
}

fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{provider} response body read failed"))?;
    if !status.is_success() {
        let detail = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|parsed| {
                let error = parsed.get("error")?;
                let message = error.get("message").and_then(Value::as_str)?;
                let kind = error.get("status").and_then(Value::as_str).unwrap_or("");
                Some(format!("{kind} {message}").trim().to_string())
            })
            .unwrap_or_else(|| truncate_text(&body, 512));
        bail!("{provider} request failed ({code}): {detail}");
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{provider} returned invalid JSON payload"))?;
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use mosaic_contracts::parts::{ImagePart, JPEG_MIME};
    use mosaic_contracts::relay::StitchRequest;
    use serde_json::json;

    use super::*;
    use crate::normalize::tests::png_bytes;

    fn jpeg_part(width: u32, height: u32, seed: u8) -> anyhow::Result<ImagePart> {
        let image = image::load_from_memory(&png_bytes(width, height, seed))?;
        Ok(ImagePart::from_bytes(&encode_jpeg(&image, 85)?, JPEG_MIME))
    }

    #[test]
    fn gemini_payload_puts_base_first_and_prompt_last() -> anyhow::Result<()> {
        let base = ImagePart::new("BASE", JPEG_MIME);
        let images = vec![ImagePart::new("ONE", JPEG_MIME), ImagePart::new("TWO", JPEG_MIME)];
        let request = ProviderStitchRequest {
            model: "gemini-2.5-flash-image",
            batch_index: 2,
            payload: StitchRequest::new(&images, Some(&base)),
        };
        let payload = GeminiStitcher::build_payload(&request)?;
        let parts = payload["contents"][0]["parts"]
            .as_array()
            .cloned()
            .unwrap_or_default();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0]["inlineData"]["data"], json!("BASE"));
        assert_eq!(parts[1]["inlineData"]["data"], json!("ONE"));
        assert_eq!(parts[2]["inlineData"]["data"], json!("TWO"));
        assert_eq!(parts[3]["text"], json!(PROMPT_WITH_BASE));
        assert_eq!(payload["generationConfig"]["responseModalities"], json!(["IMAGE"]));

        let fresh = ProviderStitchRequest {
            payload: StitchRequest::new(&images, None),
            ..request
        };
        let payload = GeminiStitcher::build_payload(&fresh)?;
        assert_eq!(payload["contents"][0]["parts"][2]["text"], json!(PROMPT_FRESH));
        Ok(())
    }

    #[test]
    fn gemini_composite_requires_inline_data_with_mime() {
        let ok = json!({"candidates": [{"content": {"parts": [
            {"text": "here you go"},
            {"inlineData": {"data": "QUJD", "mimeType": "image/png"}}
        ]}}]});
        let part = GeminiStitcher::extract_composite(&ok);
        assert_eq!(part, Some(ImagePart::new("QUJD", "image/png")));

        let missing_mime = json!({"candidates": [{"content": {"parts": [
            {"inlineData": {"data": "QUJD"}}
        ]}}]});
        assert!(GeminiStitcher::extract_composite(&missing_mime).is_none());
        assert!(GeminiStitcher::extract_composite(&json!({"candidates": []})).is_none());
    }

    #[test]
    fn failure_messages_follow_relay_wording() {
        assert_eq!(
            stitch_failure_message("Gemini request failed (429): RESOURCE_EXHAUSTED"),
            QUOTA_EXCEEDED_MESSAGE
        );
        assert_eq!(
            stitch_failure_message("bad gateway"),
            "Failed to stitch images: bad gateway"
        );
    }

    #[test]
    fn relay_reply_maps_to_user_messages() {
        let err = RelayStitcher::interpret_reply(false, r#"{"error":"Server says no"}"#)
            .unwrap_err();
        assert_eq!(err.to_string(), "Server says no");

        let err = RelayStitcher::interpret_reply(false, "<html>502</html>").unwrap_err();
        assert_eq!(err.to_string(), RELAY_UNREACHABLE_MESSAGE);

        let err = RelayStitcher::interpret_reply(true, "{}").unwrap_err();
        assert_eq!(err.to_string(), RELAY_NO_IMAGE_URL_MESSAGE);

        let part = RelayStitcher::interpret_reply(
            true,
            r#"{"imageUrl":"data:image/png;base64,QUJD"}"#,
        )
        .unwrap();
        assert_eq!(part, ImagePart::new("QUJD", "image/png"));
    }

    #[test]
    fn dryrun_lays_images_side_by_side() -> anyhow::Result<()> {
        let stitcher = DryrunStitcher::new(&StitchSettings::default());
        let base = jpeg_part(40, 30, 1)?;
        let images = vec![jpeg_part(20, 50, 2)?, jpeg_part(10, 10, 3)?];
        let response = stitcher.stitch(&ProviderStitchRequest {
            model: "dryrun-stitch-1",
            batch_index: 2,
            payload: StitchRequest::new(&images, Some(&base)),
        })?;
        assert_eq!(response.composite.mime_type(), JPEG_MIME);
        let decoded = image::load_from_memory(&response.composite.decode_bytes()?)?;
        assert_eq!((decoded.width(), decoded.height()), (70, 50));
        assert_eq!(response.provider_request["has_base_image"], json!(true));
        Ok(())
    }

    #[test]
    fn dryrun_output_respects_max_dimension() -> anyhow::Result<()> {
        let settings = StitchSettings::default().with_max_dimension(Some(64));
        let stitcher = DryrunStitcher::new(&settings);
        let images = vec![jpeg_part(60, 40, 4)?, jpeg_part(60, 40, 5)?];
        let response = stitcher.stitch(&ProviderStitchRequest {
            model: "dryrun-stitch-1",
            batch_index: 1,
            payload: StitchRequest::new(&images, None),
        })?;
        let decoded = image::load_from_memory(&response.composite.decode_bytes()?)?;
        assert_eq!(decoded.width(), 64);
        assert!(decoded.height() <= 64);
        Ok(())
    }

    #[test]
    fn registry_lists_default_providers() {
        let registry = default_provider_registry(&StitchSettings::default());
        assert_eq!(registry.names(), vec!["dryrun", "gemini", "relay"]);
        assert!(registry.get("relay").is_some());
        assert!(registry.get("openai").is_none());
    }
}

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

pub const JPEG_MIME: &str = "image/jpeg";

/// One transmittable image: base64 payload plus its media type.
///
/// Serializes as the inline-data part accepted by the stitching relay and by
/// Gemini `generateContent`:
/// `{"inlineData":{"data":"<base64>","mimeType":"image/jpeg"}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImagePart {
    #[serde(rename = "inlineData")]
    pub inline_data: InlineData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineData {
    pub data: String,
    #[serde(rename = "mimeType")]
    pub mime_type: String,
}

impl ImagePart {
    pub fn new(data: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self {
            inline_data: InlineData {
                data: data.into(),
                mime_type: mime_type.into(),
            },
        }
    }

    pub fn from_bytes(bytes: &[u8], mime_type: impl Into<String>) -> Self {
        Self::new(BASE64.encode(bytes), mime_type)
    }

    pub fn data(&self) -> &str {
        &self.inline_data.data
    }

    pub fn mime_type(&self) -> &str {
        &self.inline_data.mime_type
    }

    /// Length of the base64 payload. Used to rank parts by size without
    /// decoding them.
    pub fn encoded_len(&self) -> usize {
        self.inline_data.data.len()
    }

    pub fn decode_bytes(&self) -> anyhow::Result<Vec<u8>> {
        BASE64
            .decode(self.inline_data.data.as_bytes())
            .map_err(|err| anyhow::anyhow!("image part base64 decode failed: {err}"))
    }

    pub fn to_data_url(&self) -> String {
        format!(
            "data:{};base64,{}",
            self.inline_data.mime_type, self.inline_data.data
        )
    }

    /// Parses `data:<mime>;base64,<payload>` back into a part.
    pub fn from_data_url(url: &str) -> Result<Self, String> {
        let Some(rest) = url.trim().strip_prefix("data:") else {
            return Err("image URL is not a data URL".to_string());
        };
        let Some((header, payload)) = rest.split_once(',') else {
            return Err("data URL has no payload".to_string());
        };
        let Some(mime_type) = header.strip_suffix(";base64") else {
            return Err("data URL payload is not base64".to_string());
        };
        if mime_type.is_empty() {
            return Err("data URL has no media type".to_string());
        }
        if payload.is_empty() {
            return Err("data URL payload is empty".to_string());
        }
        Ok(Self::new(payload, mime_type))
    }
}

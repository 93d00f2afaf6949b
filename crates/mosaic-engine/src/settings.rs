use std::env;

/// Longest edge, in pixels, of a normalized image.
pub const DEFAULT_MAX_DIMENSION: u32 = 1920;
pub const DEFAULT_JPEG_QUALITY: u8 = 85;
/// 3.8 MiB, kept below the relay's hard request limit.
pub const DEFAULT_BUDGET_BYTES: usize = 3_984_588;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StitchSettings {
    pub max_dimension: u32,
    pub jpeg_quality: u8,
    pub budget_bytes: usize,
}

impl Default for StitchSettings {
    fn default() -> Self {
        Self {
            max_dimension: DEFAULT_MAX_DIMENSION,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            budget_bytes: DEFAULT_BUDGET_BYTES,
        }
    }
}

impl StitchSettings {
    /// Defaults overridden by `MOSAIC_MAX_DIMENSION`, `MOSAIC_JPEG_QUALITY`
    /// and `MOSAIC_BUDGET_BYTES`. Out-of-range values are clamped; values that
    /// do not parse are ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let read = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .and_then(|value| value.parse::<f64>().ok())
        };
        Self {
            max_dimension: read("MOSAIC_MAX_DIMENSION")
                .map(|value| value.round().clamp(64.0, 8192.0) as u32)
                .unwrap_or(defaults.max_dimension),
            jpeg_quality: read("MOSAIC_JPEG_QUALITY")
                .map(|value| value.round().clamp(1.0, 100.0) as u8)
                .unwrap_or(defaults.jpeg_quality),
            budget_bytes: read("MOSAIC_BUDGET_BYTES")
                .map(|value| value.floor().clamp(1024.0, 64.0 * 1024.0 * 1024.0) as usize)
                .unwrap_or(defaults.budget_bytes),
        }
    }

    pub fn with_max_dimension(mut self, value: Option<u32>) -> Self {
        if let Some(value) = value.filter(|value| *value > 0) {
            self.max_dimension = value;
        }
        self
    }

    pub fn with_budget_bytes(mut self, value: Option<usize>) -> Self {
        if let Some(value) = value.filter(|value| *value > 0) {
            self.budget_bytes = value;
        }
        self
    }
}

pub(crate) fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

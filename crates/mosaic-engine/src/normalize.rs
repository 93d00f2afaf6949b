//! Turns arbitrary input files into bounded, canonical JPEG image parts.

use std::fs;
use std::path::{Path, PathBuf};

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, Rgb, RgbImage};
use mosaic_contracts::parts::{ImagePart, JPEG_MIME};
use mosaic_contracts::runs::summary::FailedFile;
use tracing::{debug, warn};

use crate::error::StitchError;
use crate::settings::StitchSettings;

#[derive(Debug, Clone, Copy)]
pub struct ImageNormalizer {
    max_dimension: u32,
    jpeg_quality: u8,
}

impl ImageNormalizer {
    pub fn new(settings: &StitchSettings) -> Self {
        Self {
            max_dimension: settings.max_dimension.max(1),
            jpeg_quality: settings.jpeg_quality.clamp(1, 100),
        }
    }

    pub fn normalize_path(&self, path: &Path) -> Result<ImagePart, StitchError> {
        let bytes = fs::read(path).map_err(|source| StitchError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        self.normalize_bytes(&bytes)
    }

    pub fn normalize_bytes(&self, bytes: &[u8]) -> Result<ImagePart, StitchError> {
        let image =
            image::load_from_memory(bytes).map_err(|err| StitchError::Decode(err.to_string()))?;
        let (width, height) = (image.width(), image.height());
        let (target_width, target_height) = target_dimensions(width, height, self.max_dimension);
        let resized = if (target_width, target_height) == (width, height) {
            image
        } else {
            image.resize_exact(target_width, target_height, FilterType::Triangle)
        };
        let encoded = encode_jpeg(&resized, self.jpeg_quality)?;
        debug!(
            width,
            height,
            target_width,
            target_height,
            encoded_bytes = encoded.len(),
            "normalized image"
        );
        Ok(ImagePart::from_bytes(&encoded, JPEG_MIME))
    }

    /// Lazily normalizes `paths` in order, one file per `next()`.
    pub fn normalize_files<'a>(&'a self, paths: &'a [PathBuf]) -> NormalizeFiles<'a> {
        NormalizeFiles {
            normalizer: self,
            paths: paths.iter(),
            processed: 0,
            total: paths.len(),
        }
    }
}

/// Scales so the longest edge equals `max_dimension` when it exceeds it.
/// The shorter edge is rounded to the nearest pixel and never drops to zero.
pub fn target_dimensions(width: u32, height: u32, max_dimension: u32) -> (u32, u32) {
    let longest = width.max(height);
    if longest <= max_dimension {
        return (width, height);
    }
    let scale = f64::from(max_dimension) / f64::from(longest);
    let shrink = |edge: u32| ((f64::from(edge) * scale).round() as u32).max(1);
    if width > height {
        (max_dimension, shrink(height))
    } else {
        (shrink(width), max_dimension)
    }
}

/// JPEG-encodes `image`, flattening any alpha onto white first.
pub(crate) fn encode_jpeg(image: &DynamicImage, quality: u8) -> Result<Vec<u8>, StitchError> {
    let rgb = if image.color().has_alpha() {
        flatten_on_white(image)
    } else {
        image.to_rgb8()
    };
    let mut bytes = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut bytes, quality);
    encoder
        .encode_image(&DynamicImage::ImageRgb8(rgb))
        .map_err(|err| StitchError::Encode(err.to_string()))?;
    Ok(bytes)
}

fn flatten_on_white(image: &DynamicImage) -> RgbImage {
    let rgba = image.to_rgba8();
    let mut flattened = RgbImage::new(rgba.width(), rgba.height());
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let alpha = u16::from(pixel[3]);
        let blend = |channel: u8| -> u8 {
            (((u16::from(channel) * alpha) + (255 * (255 - alpha))) / 255) as u8
        };
        flattened.put_pixel(x, y, Rgb([blend(pixel[0]), blend(pixel[1]), blend(pixel[2])]));
    }
    flattened
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProcessingOutcome {
    Success(ImagePart),
    Failure { file_name: String, message: String },
}

/// Snapshot emitted after each attempted file, success or failure.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizeProgress {
    pub processed: usize,
    pub total: usize,
    pub file_name: String,
    pub outcome: ProcessingOutcome,
}

pub struct NormalizeFiles<'a> {
    normalizer: &'a ImageNormalizer,
    paths: std::slice::Iter<'a, PathBuf>,
    processed: usize,
    total: usize,
}

impl Iterator for NormalizeFiles<'_> {
    type Item = NormalizeProgress;

    fn next(&mut self) -> Option<Self::Item> {
        let path = self.paths.next()?;
        let file_name = display_name(path);
        let outcome = match self.normalizer.normalize_path(path) {
            Ok(part) => ProcessingOutcome::Success(part),
            Err(err) => {
                warn!(file = %file_name, error = %err, "image normalization failed");
                ProcessingOutcome::Failure {
                    file_name: file_name.clone(),
                    message: err.to_string(),
                }
            }
        };
        self.processed += 1;
        Some(NormalizeProgress {
            processed: self.processed,
            total: self.total,
            file_name,
            outcome,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.paths.size_hint()
    }
}

/// Successes and failures of one normalization pass, each in input order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizationReport {
    pub parts: Vec<ImagePart>,
    pub failures: Vec<FailedFile>,
}

impl NormalizationReport {
    pub fn total(&self) -> usize {
        self.parts.len() + self.failures.len()
    }

    pub fn push(&mut self, outcome: ProcessingOutcome) {
        match outcome {
            ProcessingOutcome::Success(part) => self.parts.push(part),
            ProcessingOutcome::Failure { file_name, message } => {
                self.failures.push(FailedFile { file_name, message })
            }
        }
    }
}

impl FromIterator<NormalizeProgress> for NormalizationReport {
    fn from_iter<I: IntoIterator<Item = NormalizeProgress>>(iter: I) -> Self {
        let mut report = Self::default();
        for progress in iter {
            report.push(progress.outcome);
        }
        report
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string_lossy().to_string())
}

#[cfg(test)]
pub(crate) mod tests {
    use std::io::Cursor;
    use std::path::{Path, PathBuf};

    use image::{DynamicImage, ImageFormat, Rgb, RgbImage, Rgba, RgbaImage};
    use mosaic_contracts::parts::{ImagePart, JPEG_MIME};

    use super::{target_dimensions, ImageNormalizer, NormalizationReport, ProcessingOutcome};
    use crate::error::StitchError;
    use crate::settings::StitchSettings;

    pub(crate) fn png_bytes(width: u32, height: u32, seed: u8) -> Vec<u8> {
        let image = RgbImage::from_fn(width, height, |x, y| {
            Rgb([
                (x as u8).wrapping_add(seed),
                (y as u8).wrapping_mul(3),
                seed,
            ])
        });
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(image)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .expect("encode test png");
        bytes
    }

    pub(crate) fn write_png(dir: &Path, name: &str, width: u32, height: u32) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, png_bytes(width, height, name.len() as u8)).expect("write test png");
        path
    }

    fn dimensions(part: &ImagePart) -> anyhow::Result<(u32, u32)> {
        let image = image::load_from_memory(&part.decode_bytes()?)?;
        Ok((image.width(), image.height()))
    }

    fn normalizer() -> ImageNormalizer {
        ImageNormalizer::new(&StitchSettings::default())
    }

    #[test]
    fn target_dimensions_scale_longest_edge() {
        assert_eq!(target_dimensions(3840, 2160, 1920), (1920, 1080));
        assert_eq!(target_dimensions(1000, 3000, 1920), (640, 1920));
        assert_eq!(target_dimensions(4000, 4000, 1920), (1920, 1920));
        assert_eq!(target_dimensions(2000, 3, 1920), (1920, 3));
        assert_eq!(target_dimensions(5000, 1, 1920), (1920, 1));
    }

    #[test]
    fn target_dimensions_leave_small_images_alone() {
        assert_eq!(target_dimensions(800, 600, 1920), (800, 600));
        assert_eq!(target_dimensions(1920, 1080, 1920), (1920, 1080));
        // Only one edge over the limit still triggers the resize.
        assert_eq!(target_dimensions(2400, 600, 1920), (1920, 480));
    }

    #[test]
    fn normalizes_to_jpeg_within_max_dimension() -> anyhow::Result<()> {
        let part = normalizer().normalize_bytes(&png_bytes(2400, 1200, 7))?;
        assert_eq!(part.mime_type(), JPEG_MIME);
        assert_eq!(dimensions(&part)?, (1920, 960));
        Ok(())
    }

    #[test]
    fn normalizing_a_normalized_image_keeps_dimensions() -> anyhow::Result<()> {
        let first = normalizer().normalize_bytes(&png_bytes(1920, 1080, 3))?;
        let second = normalizer().normalize_bytes(&first.decode_bytes()?)?;
        assert_eq!(dimensions(&first)?, (1920, 1080));
        assert_eq!(dimensions(&second)?, (1920, 1080));
        Ok(())
    }

    #[test]
    fn transparent_pixels_flatten_to_white() -> anyhow::Result<()> {
        let image = RgbaImage::from_pixel(16, 16, Rgba([0, 0, 0, 0]));
        let mut bytes = Vec::new();
        DynamicImage::ImageRgba8(image).write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;

        let part = normalizer().normalize_bytes(&bytes)?;
        let decoded = image::load_from_memory(&part.decode_bytes()?)?.to_rgb8();
        let pixel = decoded.get_pixel(8, 8);
        assert!(pixel[0] > 240 && pixel[1] > 240 && pixel[2] > 240);
        Ok(())
    }

    #[test]
    fn undecodable_bytes_fail_with_decode_error() {
        let err = normalizer()
            .normalize_bytes(b"definitely not an image")
            .unwrap_err();
        assert!(matches!(err, StitchError::Decode(_)));
    }

    #[test]
    fn missing_file_fails_with_io_error() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let err = normalizer()
            .normalize_path(&temp.path().join("missing.jpg"))
            .unwrap_err();
        assert!(matches!(err, StitchError::Io { .. }));
        Ok(())
    }

    #[test]
    fn progress_ticks_once_per_file_and_report_keeps_order() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let broken = temp.path().join("c-broken.jpg");
        std::fs::write(&broken, b"garbage")?;
        let paths = vec![
            write_png(temp.path(), "a.png", 40, 30),
            write_png(temp.path(), "b.png", 50, 30),
            broken,
            write_png(temp.path(), "d.png", 60, 30),
            write_png(temp.path(), "e.png", 70, 30),
        ];

        let normalizer = normalizer();
        let progress: Vec<_> = normalizer.normalize_files(&paths).collect();
        assert_eq!(
            progress.iter().map(|tick| tick.processed).collect::<Vec<_>>(),
            vec![1, 2, 3, 4, 5]
        );
        assert!(progress.iter().all(|tick| tick.total == 5));
        assert!(matches!(
            &progress[2].outcome,
            ProcessingOutcome::Failure { file_name, .. } if file_name == "c-broken.jpg"
        ));

        let report: NormalizationReport = progress.into_iter().collect();
        assert_eq!(report.parts.len(), 4);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.total(), 5);
        assert_eq!(report.failures[0].file_name, "c-broken.jpg");
        let widths = report
            .parts
            .iter()
            .map(|part| dimensions(part).map(|(width, _)| width))
            .collect::<anyhow::Result<Vec<_>>>()?;
        assert_eq!(widths, vec![40, 50, 60, 70]);
        Ok(())
    }
}

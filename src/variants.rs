//! Width-bucketed image variant generation.
//!
//! Decoding and resizing are CPU-bound, so every job runs on tokio's blocking
//! pool behind a semaphore and never on the async workers that serve requests.

use std::io::Cursor;
use std::sync::Arc;

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::webp::WebPEncoder;
use image::imageops::FilterType;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;

/// Default largest width or height any backend is expected to handle.
pub const MAX_DIMENSION: u32 = 16_384;

/// Default box oversized sources are reduced to before variants are cut.
pub const SAFE_WORKING_DIMENSION: u32 = 8_192;

const JPEG_QUALITY: u8 = 82;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Failed to decode source image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("No encoder produced output for a {0}px variant")]
    Encode(u32),
    #[error("Resize worker failed: {0}")]
    Worker(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    WebP,
    Jpeg,
}

impl OutputFormat {
    pub fn mime_type(&self) -> &'static str {
        match self {
            OutputFormat::WebP => "image/webp",
            OutputFormat::Jpeg => "image/jpeg",
        }
    }

    /// Formats a client accepts, from an HTTP `Accept` header. JPEG is always acceptable.
    pub fn negotiate(accept: Option<&str>) -> Vec<OutputFormat> {
        let mut formats = Vec::new();
        if accept.is_some_and(|a| a.contains("image/webp")) {
            formats.push(OutputFormat::WebP);
        }
        formats.push(OutputFormat::Jpeg);
        formats
    }
}

#[derive(Debug, Clone)]
pub struct EncodedVariant {
    pub width: u32,
    pub height: u32,
    pub format: OutputFormat,
    pub data: Bytes,
}

/// Pick the widths to render for a source `source_width` pixels wide.
///
/// Widths wider than the source are dropped; if any were dropped the source
/// width itself is rendered instead. With nothing usable the source width is
/// the only target. The result is ascending and free of duplicates.
pub fn choose_target_widths(requested: &[u32], source_width: u32) -> Vec<u32> {
    let mut widths: Vec<u32> = requested
        .iter()
        .copied()
        .filter(|w| *w > 0 && *w <= source_width)
        .collect();

    if widths.len() < requested.len() && requested.iter().any(|w| *w > source_width) {
        widths.push(source_width);
    }
    if widths.is_empty() {
        widths.push(source_width);
    }

    widths.sort_unstable();
    widths.dedup();
    widths
}

/// Canvas limits applied while rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanvasLimits {
    /// Sources wider or taller than this are downsampled first, and variants
    /// taller than this are skipped.
    pub max_dimension: u32,
    /// Box a downsampled source is fitted into.
    pub working_dimension: u32,
}

impl Default for CanvasLimits {
    fn default() -> Self {
        Self {
            max_dimension: MAX_DIMENSION,
            working_dimension: SAFE_WORKING_DIMENSION,
        }
    }
}

#[derive(Clone)]
pub struct ImageVariantPipeline {
    permits: Arc<Semaphore>,
    limits: CanvasLimits,
}

impl ImageVariantPipeline {
    pub fn new(concurrency: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            limits: CanvasLimits::default(),
        }
    }

    pub fn with_limits(mut self, limits: CanvasLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn limits(&self) -> CanvasLimits {
        self.limits
    }

    /// Render `source` at each usable width in `widths`, encoding with the
    /// first format in `formats` that succeeds.
    pub async fn generate(
        &self,
        source: Bytes,
        widths: Vec<u32>,
        formats: Vec<OutputFormat>,
    ) -> Result<Vec<EncodedVariant>, PipelineError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| PipelineError::Worker(e.to_string()))?;

        let limits = self.limits;
        tokio::task::spawn_blocking(move || render(&source, &widths, &formats, limits))
            .await
            .map_err(|e| PipelineError::Worker(e.to_string()))?
    }
}

fn render(
    source: &[u8],
    widths: &[u32],
    formats: &[OutputFormat],
    limits: CanvasLimits,
) -> Result<Vec<EncodedVariant>, PipelineError> {
    let original = image::load_from_memory(source)?;
    let targets = choose_target_widths(widths, original.width());

    let oversized =
        original.width() > limits.max_dimension || original.height() > limits.max_dimension;
    let working = if oversized {
        tracing::debug!(
            width = original.width(),
            height = original.height(),
            "Downsampling oversized source before generating variants"
        );
        original.resize(
            limits.working_dimension,
            limits.working_dimension,
            FilterType::Triangle,
        )
    } else {
        original
    };

    let mut rendered = Vec::new();
    let mut last_width = 0;
    for target in targets {
        let width = target.min(working.width());
        if width == last_width {
            continue;
        }
        let height = scaled_height(working.width(), working.height(), width);
        if height > limits.max_dimension {
            tracing::debug!(width, height, "Skipping variant taller than the maximum dimension");
            continue;
        }

        let resized = if width == working.width() {
            working.clone()
        } else {
            working.resize_exact(width, height, FilterType::Lanczos3)
        };
        let (format, data) = encode(&resized, formats).ok_or(PipelineError::Encode(width))?;

        rendered.push(EncodedVariant {
            width,
            height,
            format,
            data: Bytes::from(data),
        });
        last_width = width;
    }
    Ok(rendered)
}

fn scaled_height(source_width: u32, source_height: u32, width: u32) -> u32 {
    let height = (u64::from(source_height) * u64::from(width) + u64::from(source_width) / 2)
        / u64::from(source_width.max(1));
    height.clamp(1, u64::from(u32::MAX)) as u32
}

fn encode(img: &DynamicImage, formats: &[OutputFormat]) -> Option<(OutputFormat, Vec<u8>)> {
    encode_with(img, formats, encode_as)
}

/// Try each accepted format in order, then JPEG as the universal fallback.
fn encode_with<F>(
    img: &DynamicImage,
    formats: &[OutputFormat],
    encoder: F,
) -> Option<(OutputFormat, Vec<u8>)>
where
    F: Fn(&DynamicImage, OutputFormat) -> Result<Vec<u8>, image::ImageError>,
{
    let fallback = [OutputFormat::Jpeg];
    for format in formats.iter().chain(fallback.iter()) {
        match encoder(img, *format) {
            Ok(data) if !data.is_empty() => return Some((*format, data)),
            Ok(_) => tracing::warn!(?format, "Encoder produced no output"),
            Err(e) => tracing::warn!(?format, error = %e, "Encoder failed"),
        }
    }
    None
}

fn encode_as(img: &DynamicImage, format: OutputFormat) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Cursor::new(Vec::new());
    match format {
        OutputFormat::WebP => {
            let rgba = DynamicImage::ImageRgba8(img.to_rgba8());
            rgba.write_with_encoder(WebPEncoder::new_lossless(&mut buf))?;
        }
        OutputFormat::Jpeg => {
            let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
            rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut buf, JPEG_QUALITY))?;
        }
    }
    Ok(buf.into_inner())
}

//! Metadata extraction.
//!
//! Raster images are measured from their header by the `image` crate; SVG
//! documents from the `width`/`height` or `viewBox` attributes of their root
//! element.

use image::{ImageFormat, ImageReader};
use regex::Regex;
use std::io::Cursor;
use std::sync::LazyLock;

use super::blob::{BlobError, BlobSource};
use crate::runtime::activity::ActivityError;
use crate::trigger::split_blob_name;
use crate::{FileMetadata, TriggerInput};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
    pub format: String,
}

pub trait DimensionExtractor: Send + Sync {
    fn name(&self) -> &'static str;
    fn extract(&self, bytes: &[u8]) -> Result<Dimensions, ActivityError>;
}

pub struct RasterExtractor;
pub struct VectorExtractor;

static RASTER: RasterExtractor = RasterExtractor;
static VECTOR: VectorExtractor = VectorExtractor;

static SVG_ROOT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<svg\b([^>]*)>").unwrap());
static ATTR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"([A-Za-z_:][-A-Za-z0-9_:.]*)\s*=\s*(?:"([^"]*)"|'([^']*)')"#).unwrap());
static LENGTH: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*([0-9]*\.?[0-9]+)\s*(px)?\s*$").unwrap());

fn format_name(format: ImageFormat) -> String {
    match format {
        ImageFormat::Jpeg => "JPEG".to_string(),
        ImageFormat::Png => "PNG".to_string(),
        ImageFormat::Gif => "GIF".to_string(),
        ImageFormat::WebP => "WEBP".to_string(),
        ImageFormat::Bmp => "BMP".to_string(),
        ImageFormat::Tiff => "TIFF".to_string(),
        ImageFormat::Ico => "ICO".to_string(),
        other => format!("{other:?}").to_uppercase(),
    }
}

impl DimensionExtractor for RasterExtractor {
    fn name(&self) -> &'static str {
        "raster"
    }

    fn extract(&self, bytes: &[u8]) -> Result<Dimensions, ActivityError> {
        let reader = ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|e| ActivityError::non_retryable(format!("cannot read image: {e}")))?;
        let format = reader
            .format()
            .ok_or_else(|| ActivityError::non_retryable("unrecognized image format"))?;
        let (width, height) = reader
            .into_dimensions()
            .map_err(|e| ActivityError::non_retryable(format!("cannot decode image header: {e}")))?;
        Ok(Dimensions {
            width,
            height,
            format: format_name(format),
        })
    }
}

/// Pixel length of an SVG attribute. Relative units are not measurable.
fn svg_length(value: &str) -> Option<u32> {
    let caps = LENGTH.captures(value)?;
    let n: f64 = caps[1].parse().ok()?;
    (n.is_finite() && n >= 0.0).then(|| n.round() as u32)
}

impl DimensionExtractor for VectorExtractor {
    fn name(&self) -> &'static str {
        "vector"
    }

    fn extract(&self, bytes: &[u8]) -> Result<Dimensions, ActivityError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| ActivityError::non_retryable("SVG document is not UTF-8"))?;
        let root = SVG_ROOT
            .captures(text)
            .ok_or_else(|| ActivityError::non_retryable("no <svg> element"))?;
        let mut width = None;
        let mut height = None;
        let mut view_box = None;
        for attr in ATTR.captures_iter(&root[1]) {
            let value = attr.get(2).or_else(|| attr.get(3)).map(|m| m.as_str()).unwrap_or_default();
            match &attr[1] {
                "width" => width = svg_length(value),
                "height" => height = svg_length(value),
                "viewBox" => view_box = Some(value.to_string()),
                _ => {}
            }
        }
        if let (Some(width), Some(height)) = (width, height) {
            return Ok(Dimensions {
                width,
                height,
                format: "SVG".to_string(),
            });
        }
        let parts: Vec<f64> = view_box
            .as_deref()
            .unwrap_or_default()
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|s| !s.is_empty())
            .filter_map(|s| s.parse().ok())
            .collect();
        match parts.as_slice() {
            [_, _, w, h] if *w >= 0.0 && *h >= 0.0 => Ok(Dimensions {
                width: width.unwrap_or(w.round() as u32),
                height: height.unwrap_or(h.round() as u32),
                format: "SVG".to_string(),
            }),
            _ => Err(ActivityError::non_retryable("SVG has no measurable width/height or viewBox")),
        }
    }
}

/// Pick the extractor by file extension, falling back to a content sniff.
pub fn select_extractor(blob_name: &str, bytes: &[u8]) -> &'static dyn DimensionExtractor {
    if blob_name.to_ascii_lowercase().ends_with(".svg") {
        return &VECTOR;
    }
    let head = &bytes[..bytes.len().min(512)];
    let head = String::from_utf8_lossy(head);
    let head = head.trim_start_matches('\u{feff}').trim_start();
    if head.starts_with("<svg") || (head.starts_with("<?xml") && head.contains("<svg")) {
        &VECTOR
    } else {
        &RASTER
    }
}

pub fn size_kb(size_bytes: u64) -> f64 {
    (size_bytes as f64 / 1024.0 * 100.0).round() / 100.0
}

fn classify_fetch_error(e: BlobError) -> ActivityError {
    match e {
        BlobError::Io(e) => ActivityError::transient(format!("blob fetch failed: {e}")),
        other => ActivityError::non_retryable(other.to_string()),
    }
}

/// Fetch the uploaded object and measure it.
pub async fn extract_metadata(blobs: &dyn BlobSource, input: &TriggerInput) -> Result<FileMetadata, ActivityError> {
    let (container, blob) = split_blob_name(&input.name)
        .ok_or_else(|| ActivityError::non_retryable(format!("malformed blob name '{}'", input.name)))?;
    let bytes = blobs.fetch(container, blob).await.map_err(classify_fetch_error)?;
    let extractor = select_extractor(blob, &bytes);
    let dims = extractor.extract(&bytes)?;
    tracing::debug!(
        target: "durable_ingest::activities::extract",
        blob = %input.name,
        extractor = extractor.name(),
        width = dims.width,
        height = dims.height,
        format = %dims.format,
        "metadata extracted"
    );
    Ok(FileMetadata {
        file_name: blob.to_string(),
        file_size_kb: size_kb(input.size),
        width: dims.width,
        height: dims.height,
        format: dims.format,
    })
}

//! Codec backed by the `image` crate.
//!
//! # Design Decisions
//!
//! - **Format preserving**: the output is encoded in the format detected from
//!   the source bytes. JPEG honours the quality setting directly, PNG maps it
//!   onto a compression level, and WebP is encoded losslessly.
//!
//! - **Fit, never stretch**: the source is scaled by a single factor so that
//!   it fits inside the requested bounding box.
//!
//! - **Off the runtime**: decoding and encoding run on the blocking pool.

use std::io::Cursor;
use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType as PngFilter, PngEncoder};
use image::codecs::webp::WebPEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, ImageReader};

use super::{EncodedImage, ImageCodec, ImageInfo, ResizeParams};
use crate::error::CodecError;

/// Smallest accepted quality value.
const MIN_QUALITY: u8 = 1;

/// Largest accepted quality value.
const MAX_QUALITY: u8 = 100;

// =============================================================================
// Image Crate Codec
// =============================================================================

/// Default [`ImageCodec`] implementation.
///
/// # Example
///
/// ```no_run
/// use image_resizer::codec::{ImageCodec, ImageCrateCodec, ResizeParams};
/// use bytes::Bytes;
///
/// # async fn run(source: Bytes) -> Result<(), Box<dyn std::error::Error>> {
/// let codec = ImageCrateCodec::new();
/// let params = ResizeParams {
///     width: Some(800),
///     height: None,
///     quality: 85,
///     allow_upscale: false,
/// };
///
/// let output = codec.resize(source, params).await?;
/// println!("{}x{} {}", output.width, output.height, output.content_type);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Copy)]
pub struct ImageCrateCodec {
    filter: FilterType,
}

impl ImageCrateCodec {
    /// Create a codec using Lanczos3 resampling.
    pub fn new() -> Self {
        Self {
            filter: FilterType::Lanczos3,
        }
    }

    /// Use a different resampling filter.
    pub fn with_filter(mut self, filter: FilterType) -> Self {
        self.filter = filter;
        self
    }
}

impl Default for ImageCrateCodec {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ImageCodec for ImageCrateCodec {
    async fn probe(&self, data: Bytes) -> Result<ImageInfo, CodecError> {
        run_blocking(move || probe_bytes(&data)).await
    }

    async fn probe_path(&self, path: &Path) -> Result<ImageInfo, CodecError> {
        let path = path.to_path_buf();
        run_blocking(move || {
            let read_error = |e: &dyn std::fmt::Display| CodecError::Read {
                path: path.clone(),
                message: e.to_string(),
            };
            let reader = ImageReader::open(&path)
                .map_err(|e| read_error(&e))?
                .with_guessed_format()
                .map_err(|e| read_error(&e))?;
            let format = reader
                .format()
                .ok_or_else(|| CodecError::UnsupportedFormat("unknown".to_string()))?;
            let content_type = content_type_for_format(format)?;
            let (width, height) = reader.into_dimensions().map_err(decode_error)?;

            Ok(ImageInfo {
                width,
                height,
                content_type,
            })
        })
        .await
    }

    async fn resize(&self, source: Bytes, params: ResizeParams) -> Result<EncodedImage, CodecError> {
        let filter = self.filter;
        run_blocking(move || resize_blocking(&source, params, filter)).await
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T, CodecError>
where
    F: FnOnce() -> Result<T, CodecError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| CodecError::Task(e.to_string()))?
}

fn decode_error(e: image::ImageError) -> CodecError {
    CodecError::Decode {
        message: e.to_string(),
    }
}

fn encode_error(e: image::ImageError) -> CodecError {
    CodecError::Encode {
        message: e.to_string(),
    }
}

fn guess_format(data: &[u8]) -> Result<ImageFormat, CodecError> {
    image::guess_format(data).map_err(decode_error)
}

fn probe_bytes(data: &[u8]) -> Result<ImageInfo, CodecError> {
    let format = guess_format(data)?;
    let content_type = content_type_for_format(format)?;
    let (width, height) = ImageReader::with_format(Cursor::new(data), format)
        .into_dimensions()
        .map_err(decode_error)?;

    Ok(ImageInfo {
        width,
        height,
        content_type,
    })
}

fn resize_blocking(
    source: &[u8],
    params: ResizeParams,
    filter: FilterType,
) -> Result<EncodedImage, CodecError> {
    let format = guess_format(source)?;
    let content_type = content_type_for_format(format)?;

    let img = ImageReader::with_format(Cursor::new(source), format)
        .decode()
        .map_err(decode_error)?;

    let (width, height) = fit_dimensions(
        img.width(),
        img.height(),
        params.width,
        params.height,
        params.allow_upscale,
    );
    let resized = if (width, height) == (img.width(), img.height()) {
        img
    } else {
        img.resize_exact(width, height, filter)
    };

    let quality = params.quality.clamp(MIN_QUALITY, MAX_QUALITY);
    let data = encode(&resized, format, quality)?;

    Ok(EncodedImage {
        data,
        content_type,
        width,
        height,
    })
}

fn encode(img: &DynamicImage, format: ImageFormat, quality: u8) -> Result<Bytes, CodecError> {
    let mut output = Vec::new();

    match format {
        ImageFormat::Jpeg => {
            // JPEG has no alpha channel.
            let rgb = img.to_rgb8();
            JpegEncoder::new_with_quality(&mut output, quality)
                .encode_image(&rgb)
                .map_err(encode_error)?;
        }
        ImageFormat::Png => {
            let encoder = PngEncoder::new_with_quality(
                &mut output,
                png_compression(quality),
                PngFilter::Adaptive,
            );
            img.write_with_encoder(encoder).map_err(encode_error)?;
        }
        ImageFormat::WebP => {
            let rgba = DynamicImage::ImageRgba8(img.to_rgba8());
            rgba.write_with_encoder(WebPEncoder::new_lossless(&mut output))
                .map_err(encode_error)?;
        }
        other => return Err(CodecError::UnsupportedFormat(format!("{:?}", other))),
    }

    Ok(Bytes::from(output))
}

// =============================================================================
// Utility Functions
// =============================================================================

/// Compute output dimensions that fit `src` inside the requested box.
///
/// A missing bound leaves that axis unconstrained. Aspect ratio is preserved
/// and neither side drops below 1 pixel. Without `allow_upscale` the result
/// never exceeds the source size.
pub fn fit_dimensions(
    src_width: u32,
    src_height: u32,
    width: Option<u32>,
    height: Option<u32>,
    allow_upscale: bool,
) -> (u32, u32) {
    if src_width == 0 || src_height == 0 {
        return (src_width, src_height);
    }

    let ratios = [
        width.map(|w| f64::from(w) / f64::from(src_width)),
        height.map(|h| f64::from(h) / f64::from(src_height)),
    ];
    let Some(mut ratio) = ratios.into_iter().flatten().reduce(f64::min) else {
        return (src_width, src_height);
    };

    if !allow_upscale {
        ratio = ratio.min(1.0);
    }

    let scale = |side: u32| ((f64::from(side) * ratio).round() as u32).max(1);
    (scale(src_width), scale(src_height))
}

/// Map a 1-100 quality onto a PNG compression preset.
///
/// Higher quality means less compression effort: the value is first mapped
/// onto a zlib-style level `9 - quality * 9 / 100`, which is then bucketed
/// into the presets the encoder offers.
pub fn png_compression(quality: u8) -> CompressionType {
    let quality = u32::from(quality.clamp(MIN_QUALITY, MAX_QUALITY));
    match 9 - quality * 9 / 100 {
        0..=3 => CompressionType::Fast,
        4..=6 => CompressionType::Default,
        _ => CompressionType::Best,
    }
}

fn content_type_for_format(format: ImageFormat) -> Result<&'static str, CodecError> {
    match format {
        ImageFormat::Jpeg => Ok("image/jpeg"),
        ImageFormat::Png => Ok("image/png"),
        ImageFormat::WebP => Ok("image/webp"),
        other => Err(CodecError::UnsupportedFormat(format!("{:?}", other))),
    }
}

/// MIME type for a file extension (case-insensitive).
pub fn content_type_for_extension(extension: &str) -> &'static str {
    match extension.to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "tif" | "tiff" => "image/tiff",
        _ => "application/octet-stream",
    }
}

// =============================================================================
// Tests
// =============================================================================

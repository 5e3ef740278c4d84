//! Image codec abstraction.
//!
//! The resize orchestrator never touches pixels. Everything that needs to
//! understand image bytes goes through the [`ImageCodec`] trait, so the
//! orchestrator can be driven by the bundled [`ImageCrateCodec`] in
//! production and by counting or failing mocks in tests.

mod image_codec;

use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::CodecError;

pub use image_codec::{
    content_type_for_extension, fit_dimensions, png_compression, ImageCrateCodec,
};

// =============================================================================
// Codec Types
// =============================================================================

/// Header information about an encoded image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    /// Width in pixels
    pub width: u32,

    /// Height in pixels
    pub height: u32,

    /// MIME type of the encoded format
    pub content_type: &'static str,
}

/// Options for a single resize call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResizeParams {
    /// Bounding box width, if constrained
    pub width: Option<u32>,

    /// Bounding box height, if constrained
    pub height: Option<u32>,

    /// Output quality (1-100) for formats that honour it
    pub quality: u8,

    /// Whether the output may exceed the source dimensions
    pub allow_upscale: bool,
}

/// A resized and re-encoded image.
#[derive(Debug, Clone)]
pub struct EncodedImage {
    /// Encoded bytes
    pub data: Bytes,

    /// MIME type of `data`
    pub content_type: &'static str,

    /// Output width in pixels
    pub width: u32,

    /// Output height in pixels
    pub height: u32,
}

// =============================================================================
// ImageCodec Trait
// =============================================================================

/// Decode, resize and encode capability.
///
/// Implementations must preserve aspect ratio by fitting the source inside
/// the requested bounding box, and must not enlarge the image unless
/// [`ResizeParams::allow_upscale`] is set. The output keeps the source format.
#[async_trait]
pub trait ImageCodec: Send + Sync + 'static {
    /// Read dimensions and format from encoded bytes.
    async fn probe(&self, data: Bytes) -> Result<ImageInfo, CodecError>;

    /// Read dimensions and format from a file.
    ///
    /// The default reads the whole file and delegates to [`probe`](Self::probe).
    async fn probe_path(&self, path: &Path) -> Result<ImageInfo, CodecError> {
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| CodecError::Read {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        self.probe(Bytes::from(data)).await
    }

    /// Produce a resized copy of `source`.
    async fn resize(&self, source: Bytes, params: ResizeParams) -> Result<EncodedImage, CodecError>;
}

use serde::Serialize;

use crate::buffer::{PixelBuffer, PixelFormat};
use crate::error::DecodeError;
use crate::geometry::{IntRect, IntSize, Orientation};
use crate::grid::SampleSize;

use super::source::ImageSource;

// =============================================================================
// ImageInfo
// =============================================================================

/// Basic facts about an encoded image, read once when it is opened.
///
/// `width` and `height` are the stored pixel dimensions, before any
/// orientation correction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ImageInfo {
    pub width: u32,
    pub height: u32,
    pub mime_type: String,
}

impl ImageInfo {
    pub fn new(width: u32, height: u32, mime_type: impl Into<String>) -> Self {
        Self {
            width,
            height,
            mime_type: mime_type.into(),
        }
    }

    pub fn size(&self) -> IntSize {
        IntSize::new(self.width, self.height)
    }
}

// =============================================================================
// Format support
// =============================================================================

/// Whether a decoder can do region decoding for a mime type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FormatSupport {
    Supported,
    /// Known format without region decode (animations, for instance)
    Unsupported,
    /// Not known either way; decoding is attempted
    Unknown,
}

/// Support table for the common still and animated formats.
pub fn default_format_support(mime_type: &str) -> FormatSupport {
    match mime_type.to_ascii_lowercase().as_str() {
        "image/jpeg" | "image/jpg" | "image/png" | "image/webp" | "image/bmp" => {
            FormatSupport::Supported
        }
        "image/gif" | "image/apng" | "image/heic" | "image/heif" | "image/avif" | "image/svg+xml" => {
            FormatSupport::Unsupported
        }
        _ => FormatSupport::Unknown,
    }
}

// =============================================================================
// RegionDecoder
// =============================================================================

/// Decodes rectangles of one opened image.
///
/// Rectangles are given in display space (orientation already applied);
/// implementations map them back to stored pixels before reading. Unless
/// [`RegionDecoder::bakes_orientation`] says otherwise, the returned pixels
/// are in stored orientation and the caller rotates them.
pub trait RegionDecoder: Send {
    fn image_info(&self) -> &ImageInfo;

    /// Orientation recorded in the image metadata.
    fn orientation(&self) -> Orientation {
        Orientation::Undefined
    }

    /// Whether decoded pixels already have the orientation applied.
    fn bakes_orientation(&self) -> bool {
        false
    }

    /// Format of the decoded pixels.
    fn pixel_format(&self) -> PixelFormat {
        PixelFormat::Rgba8
    }

    /// Whether output buffers live in memory that must not be recycled.
    fn hardware_backed(&self) -> bool {
        false
    }

    /// Decode `rect` at `sample_size`.
    ///
    /// When `reuse` is compatible with the output size the pixels are
    /// written into it instead of a new allocation.
    ///
    /// # Errors
    ///
    /// - [`DecodeError::RegionOutOfBounds`] if `rect` is not inside the image
    /// - [`DecodeError::DecodeFailed`] for codec failures or a closed decoder
    fn decode_region(
        &mut self,
        key: &str,
        rect: IntRect,
        sample_size: SampleSize,
        reuse: Option<PixelBuffer>,
    ) -> Result<PixelBuffer, DecodeError>;

    /// Another instance over the same image, sharing whatever state is
    /// safe to share. `None` means the factory must open a new one.
    fn try_clone(&self) -> Option<Box<dyn RegionDecoder>> {
        None
    }

    /// Release file handles and codec state. Calling it again is a no-op.
    fn close(&mut self);
}

/// Opens decoders for image sources.
pub trait DecoderFactory: Send + Sync {
    fn check_support(&self, mime_type: &str) -> FormatSupport {
        default_format_support(mime_type)
    }

    /// Open `source` and read its [`ImageInfo`].
    ///
    /// # Errors
    ///
    /// - [`DecodeError::UnreadableSource`] if the stream is not an image
    /// - [`DecodeError::UnsupportedFormat`] if region decode is not
    ///   available for its format
    fn open(&self, source: &dyn ImageSource) -> Result<Box<dyn RegionDecoder>, DecodeError>;
}

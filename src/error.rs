use thiserror::Error;

use crate::geometry::{IntRect, IntSize};

/// Errors raised while opening an image source or decoding one of its regions.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    /// The byte stream could not be read or parsed as an image
    #[error("Unreadable image source: {reason}")]
    UnreadableSource { reason: String },

    /// The format is known, but region decode is not available for it
    /// (animated images, for instance). Subsampling is skipped, the
    /// thumbnail remains the only rendition.
    #[error("Region decode not supported for '{mime_type}'")]
    UnsupportedFormat { mime_type: String },

    /// The requested rectangle, once mapped back to source space, is not
    /// fully inside the image
    #[error("Region {rect} out of bounds for image {image_size}")]
    RegionOutOfBounds { rect: IntRect, image_size: IntSize },

    /// Codec-level failure while decoding a region
    #[error("Decode failed: {reason}")]
    DecodeFailed { reason: String },

    /// A pooled buffer could not be grown to the requested size
    #[error("Buffer pool allocation of {bytes} bytes failed")]
    PoolAllocationFailed { bytes: usize },

    /// I/O error while opening the source stream
    #[error("I/O error: {0}")]
    Io(String),
}

impl DecodeError {
    /// Whether the engine can keep going after this error.
    ///
    /// Unsupported formats only disable subsampling, decode failures are
    /// retried on the next full refresh and pool failures fall back to a
    /// fresh allocation.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DecodeError::UnsupportedFormat { .. }
                | DecodeError::DecodeFailed { .. }
                | DecodeError::PoolAllocationFailed { .. }
        )
    }

    /// Whether the error only concerns a single tile (as opposed to the whole image).
    pub fn is_tile_local(&self) -> bool {
        matches!(
            self,
            DecodeError::RegionOutOfBounds { .. }
                | DecodeError::DecodeFailed { .. }
                | DecodeError::PoolAllocationFailed { .. }
        )
    }
}

impl From<std::io::Error> for DecodeError {
    fn from(err: std::io::Error) -> Self {
        DecodeError::Io(err.to_string())
    }
}

impl From<image::ImageError> for DecodeError {
    fn from(err: image::ImageError) -> Self {
        match err {
            image::ImageError::Unsupported(e) => DecodeError::UnreadableSource {
                reason: e.to_string(),
            },
            image::ImageError::IoError(e) => DecodeError::Io(e.to_string()),
            image::ImageError::Limits(e) => DecodeError::DecodeFailed {
                reason: e.to_string(),
            },
            other => DecodeError::DecodeFailed {
                reason: other.to_string(),
            },
        }
    }
}

/// Errors surfaced by the engine facade.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    /// Image-level decode error (unreadable or unsupported source)
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// The engine was destroyed and cannot be used anymore
    #[error("Engine has been destroyed")]
    Destroyed,

    /// No image source is attached
    #[error("No image attached")]
    NoImage,

    /// Configuration rejected by validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

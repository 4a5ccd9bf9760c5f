//! Reference region decoder built on the `image` and `png` crates.
//!
//! Two backings, picked when a source is opened:
//!
//! - Non-interlaced PNG is streamed. Each region read inflates the encoded
//!   bytes row by row, keeps only the rows inside the region and box-filters
//!   them as they arrive, so the full-resolution image never exists in
//!   memory.
//! - Formats without a row stream (JPEG, interlaced PNG) are decoded once
//!   and shared by every cloned instance. This is bounded by the factory's
//!   full-decode limit; a larger image is reported as
//!   [`DecodeError::UnsupportedFormat`] so the viewer keeps its thumbnail.
//!
//! Platform codecs with true region decoding plug in through the same traits.

use std::io::{Cursor, Read};
use std::sync::Arc;

use bytes::Bytes;
use image::{DynamicImage, ImageDecoder, ImageFormat, ImageReader, Limits, RgbaImage};
use tracing::{debug, warn};

use crate::buffer::{PixelBuffer, PixelFormat};
use crate::error::DecodeError;
use crate::geometry::{IntRect, IntSize, Orientation, OrientationTransform};
use crate::grid::SampleSize;

use super::decoder::{DecoderFactory, FormatSupport, ImageInfo, RegionDecoder};
use super::source::ImageSource;

/// Default cap, in decoded bytes, on images that have to be decoded whole.
pub const DEFAULT_FULL_DECODE_LIMIT: u64 = 64 * 1024 * 1024;

// =============================================================================
// Factory
// =============================================================================

/// Opens [`ImageRsDecoder`]s.
#[derive(Debug, Clone)]
pub struct ImageRsDecoderFactory {
    full_decode_limit: Option<u64>,
}

impl Default for ImageRsDecoderFactory {
    fn default() -> Self {
        Self {
            full_decode_limit: Some(DEFAULT_FULL_DECODE_LIMIT),
        }
    }
}

impl ImageRsDecoderFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Largest image, in decoded bytes, that may be held whole when the
    /// format cannot be streamed. `None` lifts the cap.
    pub fn with_full_decode_limit(mut self, limit: Option<u64>) -> Self {
        self.full_decode_limit = limit;
        self
    }

    pub fn full_decode_limit(&self) -> Option<u64> {
        self.full_decode_limit
    }

    /// Read the header of `source` without decoding any pixels.
    ///
    /// # Errors
    ///
    /// [`DecodeError::UnreadableSource`] if the stream is not an image.
    pub fn probe(&self, source: &dyn ImageSource) -> Result<(ImageInfo, Orientation), DecodeError> {
        let bytes = read_source(source)?;
        let format = guess_format(&bytes)?;
        let (size, orientation) = read_header(&bytes, format)?;
        Ok((
            ImageInfo::new(size.width, size.height, format.to_mime_type()),
            orientation,
        ))
    }
}

fn read_source(source: &dyn ImageSource) -> Result<Bytes, DecodeError> {
    let mut bytes = Vec::new();
    source
        .open_stream()?
        .read_to_end(&mut bytes)
        .map_err(|e| DecodeError::UnreadableSource {
            reason: e.to_string(),
        })?;
    Ok(Bytes::from(bytes))
}

fn guess_format(bytes: &[u8]) -> Result<ImageFormat, DecodeError> {
    image::guess_format(bytes).map_err(unreadable)
}

fn read_header(bytes: &[u8], format: ImageFormat) -> Result<(IntSize, Orientation), DecodeError> {
    let mut decoder = ImageReader::with_format(Cursor::new(bytes), format)
        .into_decoder()
        .map_err(unreadable)?;
    let orientation = read_orientation(&mut decoder);
    let (width, height) = decoder.dimensions();
    Ok((IntSize::new(width, height), orientation))
}

fn read_orientation(decoder: &mut impl ImageDecoder) -> Orientation {
    decoder
        .orientation()
        .map(|o| Orientation::from_exif(o.to_exif() as u16))
        .unwrap_or_default()
}

fn region_support(mime_type: &str) -> FormatSupport {
    match mime_type.to_ascii_lowercase().as_str() {
        "image/jpeg" | "image/jpg" | "image/png" => FormatSupport::Supported,
        "image/gif" | "image/apng" | "image/webp" | "image/heic" | "image/heif" | "image/avif" => {
            FormatSupport::Unsupported
        }
        _ => FormatSupport::Unknown,
    }
}

impl DecoderFactory for ImageRsDecoderFactory {
    fn check_support(&self, mime_type: &str) -> FormatSupport {
        region_support(mime_type)
    }

    fn open(&self, source: &dyn ImageSource) -> Result<Box<dyn RegionDecoder>, DecodeError> {
        let decoder = ImageRsDecoder::open(source, self.full_decode_limit)?;
        Ok(Box::new(decoder))
    }
}

// =============================================================================
// Decoder
// =============================================================================

#[derive(Clone)]
enum Backing {
    /// Encoded PNG, inflated row by row on every region read
    PngRows(Bytes),
    /// Stored pixels of a format without a row stream
    Decoded(Arc<DynamicImage>),
}

/// Region decoder over a PNG row stream or a bounded in-memory copy.
pub struct ImageRsDecoder {
    info: ImageInfo,
    orientation: Orientation,
    backing: Option<Backing>,
}

impl ImageRsDecoder {
    /// Open `source`, streaming it when possible and decoding it whole
    /// within `full_decode_limit` otherwise.
    ///
    /// # Errors
    ///
    /// - [`DecodeError::UnreadableSource`] if the stream is not an image
    /// - [`DecodeError::UnsupportedFormat`] for formats without region
    ///   support, and for whole decodes over the limit
    pub fn open(source: &dyn ImageSource, full_decode_limit: Option<u64>) -> Result<Self, DecodeError> {
        let bytes = read_source(source)?;
        let format = guess_format(&bytes)?;
        let mime_type = format.to_mime_type();
        if region_support(mime_type) == FormatSupport::Unsupported {
            return Err(DecodeError::UnsupportedFormat {
                mime_type: mime_type.to_string(),
            });
        }

        if format == ImageFormat::Png && !png_reader(&bytes).map_err(png_unreadable)?.info().interlaced {
            return Self::stream_png(source.key(), bytes);
        }
        Self::decode_whole(source.key(), &bytes, format, full_decode_limit)
    }

    fn stream_png(key: &str, bytes: Bytes) -> Result<Self, DecodeError> {
        let (size, orientation) = read_header(&bytes, ImageFormat::Png)?;
        debug!(
            image = %key,
            width = size.width,
            height = size.height,
            encoded = bytes.len(),
            "streaming png rows"
        );
        Ok(Self {
            info: ImageInfo::new(size.width, size.height, ImageFormat::Png.to_mime_type()),
            orientation,
            backing: Some(Backing::PngRows(bytes)),
        })
    }

    fn decode_whole(
        key: &str,
        bytes: &[u8],
        format: ImageFormat,
        full_decode_limit: Option<u64>,
    ) -> Result<Self, DecodeError> {
        let mime_type = format.to_mime_type();
        let mut reader = ImageReader::with_format(Cursor::new(bytes), format);
        match full_decode_limit {
            Some(max_alloc) => {
                let mut limits = Limits::default();
                limits.max_alloc = Some(max_alloc);
                reader.limits(limits);
            }
            None => reader.no_limits(),
        }

        let mut decoder = reader
            .into_decoder()
            .map_err(|err| limited(err, mime_type))?;
        let orientation = read_orientation(&mut decoder);
        let (width, height) = decoder.dimensions();

        if let Some(limit) = full_decode_limit {
            let needed = decoder.total_bytes();
            if needed > limit {
                warn!(
                    image = %key,
                    width,
                    height,
                    needed,
                    limit,
                    "image too large to decode whole, region decode unavailable"
                );
                return Err(DecodeError::UnsupportedFormat {
                    mime_type: mime_type.to_string(),
                });
            }
        }

        let image = DynamicImage::from_decoder(decoder).map_err(|err| limited(err, mime_type))?;
        debug!(
            image = %key,
            width,
            height,
            orientation = orientation.exif_code(),
            "decoded source pixels"
        );

        Ok(Self {
            info: ImageInfo::new(width, height, mime_type),
            orientation,
            backing: Some(Backing::Decoded(Arc::new(image))),
        })
    }

    /// Whether region reads stream rows instead of using a decoded copy.
    pub fn is_streamed(&self) -> bool {
        matches!(self.backing, Some(Backing::PngRows(_)))
    }
}

fn unreadable(err: image::ImageError) -> DecodeError {
    DecodeError::UnreadableSource {
        reason: err.to_string(),
    }
}

/// Allocation limits hit while decoding whole mean no region support.
fn limited(err: image::ImageError, mime_type: &str) -> DecodeError {
    match err {
        image::ImageError::Limits(_) => DecodeError::UnsupportedFormat {
            mime_type: mime_type.to_string(),
        },
        other => unreadable(other),
    }
}

fn png_unreadable(err: png::DecodingError) -> DecodeError {
    DecodeError::UnreadableSource {
        reason: err.to_string(),
    }
}

fn png_failed(err: png::DecodingError) -> DecodeError {
    DecodeError::DecodeFailed {
        reason: err.to_string(),
    }
}

/// Rows come out as 8-bit gray, gray-alpha, RGB or RGBA.
fn png_reader(bytes: &[u8]) -> Result<png::Reader<Cursor<&[u8]>>, png::DecodingError> {
    let mut decoder = png::Decoder::new(Cursor::new(bytes));
    decoder.set_transformations(png::Transformations::EXPAND | png::Transformations::STRIP_16);
    decoder.read_info()
}

impl RegionDecoder for ImageRsDecoder {
    fn image_info(&self) -> &ImageInfo {
        &self.info
    }

    fn orientation(&self) -> Orientation {
        self.orientation
    }

    fn decode_region(
        &mut self,
        key: &str,
        rect: IntRect,
        sample_size: SampleSize,
        reuse: Option<PixelBuffer>,
    ) -> Result<PixelBuffer, DecodeError> {
        let backing = self.backing.as_ref().ok_or_else(|| DecodeError::DecodeFailed {
            reason: format!("decoder for '{}' is closed", key),
        })?;

        let transform = OrientationTransform::new(self.orientation);
        let image_size = self.info.size();
        let display_size = transform.apply_to_size(image_size, false);
        if rect.is_empty() || !IntRect::from_size(display_size).contains_rect(&rect) {
            return Err(DecodeError::RegionOutOfBounds {
                rect,
                image_size: display_size,
            });
        }
        let source_rect = transform.apply_to_rect(rect, display_size, true);
        if !IntRect::from_size(image_size).contains_rect(&source_rect) {
            return Err(DecodeError::RegionOutOfBounds {
                rect: source_rect,
                image_size,
            });
        }

        let out_size = sample_size.scaled_size(source_rect.size());
        let mut output = match reuse {
            Some(mut buffer)
                if buffer.is_compatible(out_size.width, out_size.height, PixelFormat::Rgba8) =>
            {
                buffer.reshape(out_size.width, out_size.height);
                buffer
            }
            _ => PixelBuffer::new(out_size.width, out_size.height, PixelFormat::Rgba8),
        };

        match backing {
            Backing::PngRows(bytes) => {
                read_png_region(bytes, source_rect, sample_size.get(), output.data_mut())?
            }
            Backing::Decoded(pixels) => {
                let region = pixels
                    .crop_imm(
                        source_rect.left,
                        source_rect.top,
                        source_rect.width(),
                        source_rect.height(),
                    )
                    .into_rgba8();
                box_downsample(
                    &region,
                    sample_size.get(),
                    output.data_mut(),
                    out_size.width,
                    out_size.height,
                );
            }
        }
        Ok(output)
    }

    fn try_clone(&self) -> Option<Box<dyn RegionDecoder>> {
        let backing = self.backing.clone()?;
        Some(Box::new(ImageRsDecoder {
            info: self.info.clone(),
            orientation: self.orientation,
            backing: Some(backing),
        }))
    }

    fn close(&mut self) {
        self.backing = None;
    }
}

// =============================================================================
// Sampling
// =============================================================================

/// Stream the rows of `rect` out of an encoded PNG into `out` (RGBA),
/// averaging `sample` x `sample` blocks. Rows below the rect are never
/// inflated.
fn read_png_region(bytes: &[u8], rect: IntRect, sample: u32, out: &mut [u8]) -> Result<(), DecodeError> {
    let mut reader = png_reader(bytes).map_err(png_failed)?;
    let channels = reader.output_color_type().0.samples();

    let width = rect.width() as usize;
    let sample = sample as usize;
    let out_width = width.div_ceil(sample);
    let mut sums = vec![0u32; out_width * 4];
    let mut block_rows = 0usize;
    let mut out_row = 0usize;

    for y in 0..rect.bottom {
        let row = reader.next_row().map_err(png_failed)?.ok_or_else(|| DecodeError::DecodeFailed {
            reason: format!("image data ends at row {}", y),
        })?;
        if y < rect.top {
            continue;
        }

        let data = row.data();
        let start = rect.left as usize * channels;
        for (x, pixel) in data[start..start + width * channels].chunks_exact(channels).enumerate() {
            let rgba = expand_to_rgba(pixel);
            let o = (x / sample) * 4;
            for c in 0..4 {
                sums[o + c] += rgba[c] as u32;
            }
        }

        block_rows += 1;
        if block_rows == sample || y + 1 == rect.bottom {
            let line = &mut out[out_row * out_width * 4..(out_row + 1) * out_width * 4];
            for ox in 0..out_width {
                let cols = sample.min(width - ox * sample);
                let count = (cols * block_rows) as u32;
                for c in 0..4 {
                    line[ox * 4 + c] = (sums[ox * 4 + c] / count) as u8;
                }
            }
            sums.fill(0);
            block_rows = 0;
            out_row += 1;
        }
    }
    Ok(())
}

fn expand_to_rgba(pixel: &[u8]) -> [u8; 4] {
    match *pixel {
        [gray] => [gray, gray, gray, 255],
        [gray, alpha] => [gray, gray, gray, alpha],
        [r, g, b] => [r, g, b, 255],
        [r, g, b, a, ..] => [r, g, b, a],
        [] => [0, 0, 0, 0],
    }
}

/// Average `sample` x `sample` blocks of `src` into `out` (RGBA).
fn box_downsample(src: &RgbaImage, sample: u32, out: &mut [u8], out_width: u32, out_height: u32) {
    let (src_width, src_height) = src.dimensions();
    let raw = src.as_raw();

    if sample == 1 {
        out.copy_from_slice(&raw[..out.len()]);
        return;
    }

    for oy in 0..out_height {
        let y0 = oy * sample;
        let y1 = (y0 + sample).min(src_height);
        for ox in 0..out_width {
            let x0 = ox * sample;
            let x1 = (x0 + sample).min(src_width);

            let mut sum = [0u32; 4];
            for y in y0..y1 {
                let row = (y as usize * src_width as usize) * 4;
                for x in x0..x1 {
                    let i = row + x as usize * 4;
                    for c in 0..4 {
                        sum[c] += raw[i + c] as u32;
                    }
                }
            }

            let count = (y1 - y0) * (x1 - x0);
            let o = (oy as usize * out_width as usize + ox as usize) * 4;
            for c in 0..4 {
                out[o + c] = (sum[c] / count.max(1)) as u8;
            }
        }
    }
}

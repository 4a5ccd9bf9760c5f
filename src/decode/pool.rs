use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, trace};

use crate::buffer::PixelFormat;
use crate::error::DecodeError;
use crate::geometry::Orientation;

use super::decoder::{DecoderFactory, FormatSupport, ImageInfo, RegionDecoder};
use super::source::ImageSource;

/// Default number of idle decoder instances kept per image.
pub const DEFAULT_MAX_IDLE_DECODERS: usize = 4;

struct PoolState {
    /// First instance opened; read for metadata and cloned for new checkouts
    prototype: Option<Box<dyn RegionDecoder>>,
    idle: Vec<Box<dyn RegionDecoder>>,
    closed: bool,
}

/// Decoder instances for one image.
///
/// A decoder is checked out for the duration of a single region decode and
/// returned when the [`PooledDecoder`] guard drops. New instances are
/// cloned from the first one when the backend allows it, otherwise opened
/// again from the source.
pub struct DecoderPool {
    key: Arc<str>,
    info: ImageInfo,
    orientation: Orientation,
    bakes_orientation: bool,
    pixel_format: PixelFormat,
    hardware_backed: bool,
    factory: Arc<dyn DecoderFactory>,
    source: Arc<dyn ImageSource>,
    max_idle: usize,
    state: Mutex<PoolState>,
}

impl DecoderPool {
    /// Open `source` and check that region decoding is possible.
    ///
    /// # Errors
    ///
    /// - [`DecodeError::UnreadableSource`] if the source is not an image
    /// - [`DecodeError::UnsupportedFormat`] if the factory rejects its format
    pub fn open(
        factory: Arc<dyn DecoderFactory>,
        source: Arc<dyn ImageSource>,
    ) -> Result<Self, DecodeError> {
        Self::with_max_idle(factory, source, DEFAULT_MAX_IDLE_DECODERS)
    }

    pub fn with_max_idle(
        factory: Arc<dyn DecoderFactory>,
        source: Arc<dyn ImageSource>,
        max_idle: usize,
    ) -> Result<Self, DecodeError> {
        let mut decoder = factory.open(source.as_ref())?;
        let info = decoder.image_info().clone();

        if factory.check_support(&info.mime_type) == FormatSupport::Unsupported {
            decoder.close();
            return Err(DecodeError::UnsupportedFormat {
                mime_type: info.mime_type,
            });
        }

        debug!(
            image = %source.key(),
            width = info.width,
            height = info.height,
            mime_type = %info.mime_type,
            "opened decoder pool"
        );

        Ok(Self {
            key: Arc::from(source.key()),
            orientation: decoder.orientation(),
            bakes_orientation: decoder.bakes_orientation(),
            pixel_format: decoder.pixel_format(),
            hardware_backed: decoder.hardware_backed(),
            info,
            factory,
            source,
            max_idle,
            state: Mutex::new(PoolState {
                prototype: Some(decoder),
                idle: Vec::new(),
                closed: false,
            }),
        })
    }

    pub fn key(&self) -> &Arc<str> {
        &self.key
    }

    pub fn image_info(&self) -> &ImageInfo {
        &self.info
    }

    pub fn orientation(&self) -> Orientation {
        self.orientation
    }

    pub fn bakes_orientation(&self) -> bool {
        self.bakes_orientation
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    pub fn hardware_backed(&self) -> bool {
        self.hardware_backed
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Borrow a decoder for one decode.
    ///
    /// # Errors
    ///
    /// [`DecodeError::DecodeFailed`] once the pool is closed, or whatever
    /// the factory reports when a new instance has to be opened.
    pub fn checkout(&self) -> Result<PooledDecoder<'_>, DecodeError> {
        let mut state = self.lock();
        if state.closed {
            return Err(self.closed_error());
        }

        if let Some(decoder) = state.idle.pop() {
            trace!(image = %self.key, "reusing idle decoder");
            return Ok(PooledDecoder::new(self, decoder));
        }

        if let Some(prototype) = state.prototype.as_ref() {
            match prototype.try_clone() {
                Some(decoder) => return Ok(PooledDecoder::new(self, decoder)),
                None => {
                    // Not cloneable: hand out the prototype itself, it comes
                    // back through the idle list
                    if let Some(decoder) = state.prototype.take() {
                        return Ok(PooledDecoder::new(self, decoder));
                    }
                }
            }
        }
        drop(state);

        debug!(image = %self.key, "opening additional decoder");
        let decoder = self.factory.open(self.source.as_ref())?;
        Ok(PooledDecoder::new(self, decoder))
    }

    fn checkin(&self, mut decoder: Box<dyn RegionDecoder>) {
        let mut state = self.lock();
        if state.closed || state.idle.len() >= self.max_idle {
            drop(state);
            decoder.close();
            return;
        }
        state.idle.push(decoder);
    }

    /// Number of idle instances.
    pub fn idle_count(&self) -> usize {
        self.lock().idle.len()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Close every idle decoder. Checked-out decoders close when returned.
    pub fn close_all(&self) {
        let (prototype, idle) = {
            let mut state = self.lock();
            state.closed = true;
            (state.prototype.take(), std::mem::take(&mut state.idle))
        };
        for mut decoder in prototype.into_iter().chain(idle) {
            decoder.close();
        }
        debug!(image = %self.key, "closed decoder pool");
    }

    fn closed_error(&self) -> DecodeError {
        DecodeError::DecodeFailed {
            reason: format!("decoder pool for '{}' is closed", self.key),
        }
    }
}

impl Drop for DecoderPool {
    fn drop(&mut self) {
        if !self.is_closed() {
            self.close_all();
        }
    }
}

impl std::fmt::Debug for DecoderPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecoderPool")
            .field("key", &self.key)
            .field("info", &self.info)
            .field("orientation", &self.orientation)
            .field("max_idle", &self.max_idle)
            .finish()
    }
}

/// A decoder checked out of a [`DecoderPool`], returned on drop.
pub struct PooledDecoder<'a> {
    pool: &'a DecoderPool,
    decoder: Option<Box<dyn RegionDecoder>>,
}

impl<'a> PooledDecoder<'a> {
    fn new(pool: &'a DecoderPool, decoder: Box<dyn RegionDecoder>) -> Self {
        Self {
            pool,
            decoder: Some(decoder),
        }
    }

    /// Close the decoder instead of returning it, after a failure that may
    /// have left it in a bad state.
    pub fn discard(mut self) {
        if let Some(mut decoder) = self.decoder.take() {
            decoder.close();
        }
    }
}

impl Deref for PooledDecoder<'_> {
    type Target = dyn RegionDecoder;

    fn deref(&self) -> &Self::Target {
        match self.decoder.as_deref() {
            Some(decoder) => decoder,
            None => unreachable!("decoder is only taken on drop or discard"),
        }
    }
}

impl DerefMut for PooledDecoder<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self.decoder.as_deref_mut() {
            Some(decoder) => decoder,
            None => unreachable!("decoder is only taken on drop or discard"),
        }
    }
}

impl Drop for PooledDecoder<'_> {
    fn drop(&mut self) {
        if let Some(decoder) = self.decoder.take() {
            self.pool.checkin(decoder);
        }
    }
}

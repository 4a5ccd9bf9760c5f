use std::fmt;
use std::sync::Weak;

use serde::Serialize;

use crate::geometry::IntSize;

use super::pool::{BufferPool, PoolShared, PooledStorage};

// =============================================================================
// PixelFormat
// =============================================================================

/// Memory layout of a pixel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub enum PixelFormat {
    /// 8-bit grayscale
    Luma8,
    /// 8-bit RGB, no alpha
    Rgb8,
    /// 8-bit RGBA
    #[default]
    Rgba8,
}

impl PixelFormat {
    pub const fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Luma8 => 1,
            PixelFormat::Rgb8 => 3,
            PixelFormat::Rgba8 => 4,
        }
    }

    /// Bytes needed for a `width` x `height` image in this format.
    pub fn byte_count(&self, width: u32, height: u32) -> usize {
        width as usize * height as usize * self.bytes_per_pixel()
    }
}

// =============================================================================
// PixelBuffer
// =============================================================================

/// Owned, tightly packed pixel storage.
///
/// When borrowed from a [`BufferPool`] the storage goes back to that pool on
/// drop; the pool is referenced weakly so buffers may outlive it.
pub struct PixelBuffer {
    width: u32,
    height: u32,
    format: PixelFormat,
    data: Vec<u8>,
    pool: Option<Weak<PoolShared>>,
}

impl PixelBuffer {
    /// Allocate a zeroed buffer that is not attached to any pool.
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
            data: vec![0; format.byte_count(width, height)],
            pool: None,
        }
    }

    /// Wrap existing pixels. `data` must hold exactly `width * height` pixels.
    pub fn from_vec(width: u32, height: u32, format: PixelFormat, data: Vec<u8>) -> Option<Self> {
        if data.len() != format.byte_count(width, height) {
            return None;
        }
        Some(Self {
            width,
            height,
            format,
            data,
            pool: None,
        })
    }

    pub(super) fn from_storage(
        storage: Vec<u8>,
        width: u32,
        height: u32,
        format: PixelFormat,
        pool: Weak<PoolShared>,
    ) -> Self {
        let mut data = storage;
        data.resize(format.byte_count(width, height), 0);
        Self {
            width,
            height,
            format,
            data,
            pool: Some(pool),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn size(&self) -> IntSize {
        IntSize::new(self.width, self.height)
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Bytes occupied by the pixels.
    pub fn byte_count(&self) -> usize {
        self.data.len()
    }

    /// Bytes reserved by the underlying allocation.
    pub fn allocation_size(&self) -> usize {
        self.data.capacity()
    }

    /// The pool this buffer returns to, if it is still alive.
    pub fn pool(&self) -> Option<BufferPool> {
        self.pool
            .as_ref()
            .and_then(Weak::upgrade)
            .map(BufferPool::from_shared)
    }

    pub fn is_pooled(&self) -> bool {
        self.pool.is_some()
    }

    /// Whether this buffer can hold a `width` x `height` image of `format`
    /// without reallocating.
    pub fn is_compatible(&self, width: u32, height: u32, format: PixelFormat) -> bool {
        self.format == format && self.data.capacity() >= format.byte_count(width, height)
    }

    /// Change the logical dimensions, reusing the allocation. Existing pixel
    /// contents are unspecified afterwards.
    pub fn reshape(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
        self.data.resize(self.format.byte_count(width, height), 0);
    }

    /// Allocate another buffer of the same format, from the same pool when
    /// there is one.
    pub fn sibling(&self, width: u32, height: u32) -> PixelBuffer {
        match self.pool() {
            Some(pool) => pool.allocate(width, height, self.format),
            None => PixelBuffer::new(width, height, self.format),
        }
    }

    /// Detach from the pool and hand out the raw storage.
    pub(super) fn take_storage(&mut self) -> PooledStorage {
        self.pool = None;
        PooledStorage {
            data: std::mem::take(&mut self.data),
            width: self.width,
            height: self.height,
            format: self.format,
        }
    }
}

impl Drop for PixelBuffer {
    fn drop(&mut self) {
        if let Some(shared) = self.pool.take().and_then(|pool| pool.upgrade()) {
            let storage = self.take_storage();
            shared.put(storage);
        }
    }
}

impl fmt::Debug for PixelBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PixelBuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("bytes", &self.data.len())
            .field("pooled", &self.pool.is_some())
            .finish()
    }
}

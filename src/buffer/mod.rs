//! Pixel storage and recycling.
//!
//! Decoding a tile needs a few megabytes of pixel memory. While the user
//! pans, tiles are decoded and dropped continuously, so the freed memory is
//! kept in a [`BufferPool`] and handed to the next decode of a compatible
//! size instead of going back to the allocator.
//!
//! # Ownership
//!
//! A [`PixelBuffer`] obtained from a pool remembers it. Dropping the buffer
//! (or passing it to [`BufferPool::release`]) returns its storage to the
//! pool, subject to the pool's byte budget. Buffers created with
//! [`PixelBuffer::new`] are plain owned memory and are freed on drop.

mod pixel;
mod pool;

pub use pixel::{PixelBuffer, PixelFormat};
pub use pool::{BufferPool, PoolStats, DEFAULT_BUFFER_POOL_CAPACITY};

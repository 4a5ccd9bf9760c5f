//! Region decoding layer.
//!
//! The engine never decodes a full image. It asks a [`RegionDecoder`] for
//! one rectangle at a time, at a given sample size, and hands it a pooled
//! buffer to write into.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │              Decode jobs                │
//! └────────────────────┬────────────────────┘
//!                      │ checkout / checkin
//!                      ▼
//! ┌─────────────────────────────────────────┐
//! │             DecoderPool                 │
//! │  (one per image, idle instances reused) │
//! └────────────────────┬────────────────────┘
//!                      │ open / try_clone
//!                      ▼
//! ┌─────────────────────────────────────────┐
//! │     DecoderFactory / RegionDecoder      │
//! └────────────────────┬────────────────────┘
//!                      │ open_stream
//!                      ▼
//! ┌─────────────────────────────────────────┐
//! │             ImageSource                 │
//! │  (file, memory, or a loader adapter)    │
//! └─────────────────────────────────────────┘
//! ```
//!
//! Decoder instances are not required to be thread-safe. Concurrency comes
//! from the pool holding several instances, one per in-flight job.

mod decoder;
mod image_rs;
mod pool;
mod source;

pub use decoder::{default_format_support, DecoderFactory, FormatSupport, ImageInfo, RegionDecoder};
pub use image_rs::{ImageRsDecoder, ImageRsDecoderFactory, DEFAULT_FULL_DECODE_LIMIT};
pub use pool::{DecoderPool, PooledDecoder, DEFAULT_MAX_IDLE_DECODERS};
pub use source::{FileImageSource, ImageSource, MemoryImageSource};

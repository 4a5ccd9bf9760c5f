//! # Subsampling
//!
//! A tile engine for displaying huge raster images (hundreds of megapixels)
//! in a pannable, zoomable viewport without ever holding the full-resolution
//! image in memory.
//!
//! The image is cut into a power-of-two pyramid of tile grids. For each
//! viewport the engine picks the pyramid level matching the zoom, decodes
//! only the tiles around the visible region, and publishes them to the
//! renderer as they become ready.
//!
//! ## Features
//!
//! - **Region decoding**: only the tiles around the viewport are decoded, at the resolution the zoom needs
//! - **Buffer reuse**: decoded pixels are written into recycled buffers from a bounded pool
//! - **Tile cache**: tiles that scroll off-screen and back are not decoded again
//! - **Background tiles**: the previous level stays visible while a new one loads
//! - **EXIF orientation**: rotated and mirrored images are tiled as displayed
//!
//! ## Architecture
//!
//! - [`geometry`] - sizes, rectangles and orientation transforms
//! - [`grid`] - tile pyramid planning (pure functions)
//! - [`decode`] - image sources, region decoders and decoder pools
//! - [`buffer`] - pixel buffers and the buffer pool
//! - [`tile`] - tile state, tile cache and the tile manager
//! - [`engine`] - decode workers and the engine facade
//! - [`config`] - engine options and CLI types
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use subsampling::{
//!     BufferPool, EngineConfig, FileImageSource, ImageRsDecoderFactory, IntRect, IntSize,
//!     SubsamplingEngine, TileCache, ViewportState,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), subsampling::EngineError> {
//!     let engine = SubsamplingEngine::new(
//!         EngineConfig::default(),
//!         Arc::new(ImageRsDecoderFactory::new()),
//!         BufferPool::new(),
//!         Arc::new(TileCache::new()),
//!     )?;
//!
//!     let source = Arc::new(FileImageSource::new("panorama.jpg"));
//!     engine.set_image(source, IntSize::new(1920, 480)).await?;
//!
//!     // Zoomed 4x into the left part of the thumbnail
//!     engine.set_viewport(ViewportState::new(
//!         IntSize::new(1920, 480),
//!         IntRect::new(0, 0, 480, 120),
//!         4.0,
//!     ))?;
//!
//!     let snapshot = engine.wait_for(|s| s.is_settled()).await?;
//!     for tile in snapshot.ready_tiles() {
//!         println!("{:?} at sample size {}", tile.src_rect, tile.sample_size);
//!     }
//!
//!     engine.destroy().await;
//!     Ok(())
//! }
//! ```

pub mod buffer;
pub mod config;
pub mod decode;
pub mod engine;
pub mod error;
pub mod geometry;
pub mod grid;
pub mod tile;

// Re-export commonly used types
pub use buffer::{BufferPool, PixelBuffer, PixelFormat, PoolStats};
pub use config::{Cli, Command, EngineConfig, InspectConfig, RenderConfig};
pub use decode::{
    DecoderFactory, DecoderPool, FileImageSource, FormatSupport, ImageInfo, ImageRsDecoder,
    ImageRsDecoderFactory, ImageSource, MemoryImageSource, RegionDecoder,
};
pub use engine::{
    ContinuousTransformType, ContinuousTransformTypes, EngineSnapshot, EngineStats,
    SubsamplingEngine, SubsamplingState, ViewportState,
};
pub use error::{DecodeError, EngineError};
pub use geometry::{IntOffset, IntRect, IntSize, Orientation, OrientationTransform};
pub use grid::{SampleSize, TileCoord, TileGridMap, TileGridSizeMap, TileSpec};
pub use tile::{TileCache, TileKey, TileSnapshot, TileState};

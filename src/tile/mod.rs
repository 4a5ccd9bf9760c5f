//! Tiles and their lifecycle.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │              Engine coordinator         │
//! └────────────────────┬────────────────────┘
//!                      │ refresh / apply_result
//!                      ▼
//! ┌─────────────────────────────────────────┐
//! │              TileManager                │
//! │  ┌──────────────┐  ┌─────────────────┐  │
//! │  │  foreground  │  │   background    │  │
//! │  │  (current    │  │   (neighbour    │  │
//! │  │   level)     │  │    level)       │  │
//! │  └──────────────┘  └─────────────────┘  │
//! └──────────┬─────────────────┬────────────┘
//!            │ lookup / store  │ DecodeJob
//!            ▼                 ▼
//! ┌──────────────────┐  ┌──────────────────┐
//! │    TileCache     │  │  run_decode_job  │
//! │  (decoded tiles) │  │  (worker thread) │
//! └──────────────────┘  └──────────────────┘
//! ```
//!
//! # Components
//!
//! - [`TileManager`]: state machine deciding which tiles to decode and keep
//! - [`TileCache`]: LRU cache of decoded tiles with size-based eviction
//! - [`TileKey`]: tile identity (image, sample size, column, row)
//! - [`Tile`] / [`TileSnapshot`]: a tile and its read-only view
//! - [`DecodeJob`] / [`DecodeOutcome`]: the unit of work sent to workers

mod cache;
mod job;
mod manager;
mod state;

pub use cache::{CachedTile, TileCache, DEFAULT_TILE_CACHE_CAPACITY};
pub use job::{run_decode_job, DecodeJob, DecodeOutcome};
pub use manager::{ClearReason, RefreshOutcome, SkipReason, TileManager};
pub use state::{Tile, TileAnimation, TileKey, TileSnapshot, TileState};

use std::sync::Arc;

use serde::Serialize;

use crate::buffer::PoolStats;
use crate::decode::ImageInfo;
use crate::error::DecodeError;
use crate::geometry::IntRect;
use crate::grid::{SampleSize, TileGridSizeMap};
use crate::tile::{TileManager, TileSnapshot};

/// Where the engine stands with the current image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum SubsamplingState {
    /// No image attached yet
    #[default]
    Idle,
    /// Image attached and larger than its thumbnail; tiles follow the viewport
    Active,
    /// Image attached but the thumbnail already shows it at full resolution
    NotNeeded,
    /// Region decoding is not available for the image format
    Unsupported,
    /// The image could not be opened
    Failed,
    Destroyed,
}

/// Everything a renderer needs for one frame.
///
/// Snapshots are immutable and shared behind an `Arc`; holding one keeps
/// its tile buffers alive.
#[derive(Debug, Clone, Default)]
pub struct EngineSnapshot {
    pub state: SubsamplingState,
    pub image_key: Option<Arc<str>>,
    pub image_info: Option<ImageInfo>,
    /// Image-level failure, set with `Unsupported` and `Failed`
    pub error: Option<DecodeError>,
    pub tile_grid_size_map: TileGridSizeMap,
    /// Tiles at the current sample size, row-major
    pub foreground_tiles: Vec<TileSnapshot>,
    /// Tiles of a neighbouring level drawn underneath, coarsest first
    pub background_tiles: Vec<TileSnapshot>,
    pub sample_size: Option<SampleSize>,
    pub image_load_rect: IntRect,
    /// Queued plus decoding tiles
    pub pending_decodes: usize,
    pub animating: bool,
    pub paused: bool,
}

impl EngineSnapshot {
    pub(crate) fn capture(
        manager: &TileManager,
        image_error: Option<&DecodeError>,
        paused: bool,
    ) -> Self {
        let state = if manager.is_destroyed() {
            SubsamplingState::Destroyed
        } else if let Some(err) = image_error {
            match err {
                DecodeError::UnsupportedFormat { .. } => SubsamplingState::Unsupported,
                _ => SubsamplingState::Failed,
            }
        } else if manager.image_info().is_none() {
            SubsamplingState::Idle
        } else if manager.can_subsample() {
            SubsamplingState::Active
        } else {
            SubsamplingState::NotNeeded
        };

        Self {
            state,
            image_key: manager.image_key().cloned(),
            image_info: manager.image_info().cloned(),
            error: image_error.cloned(),
            tile_grid_size_map: manager.grid_size_map(),
            foreground_tiles: manager.foreground_tiles(),
            background_tiles: manager.background_tiles(),
            sample_size: manager.sample_size(),
            image_load_rect: manager.load_rect(),
            pending_decodes: manager.pending_jobs() + manager.decoding_tiles(),
            animating: manager.has_running_animations(),
            paused,
        }
    }

    /// No decode is outstanding and no tile is fading in.
    pub fn is_settled(&self) -> bool {
        self.pending_decodes == 0 && !self.animating
    }

    pub fn ready_tiles(&self) -> impl Iterator<Item = &TileSnapshot> {
        self.foreground_tiles.iter().filter(|tile| tile.is_ready())
    }

    pub fn is_destroyed(&self) -> bool {
        self.state == SubsamplingState::Destroyed
    }
}

/// Memory counters of the shared pools.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub buffer_pool: PoolStats,
    pub tile_cache_entries: usize,
    pub tile_cache_bytes: usize,
    pub tile_cache_capacity: usize,
    pub in_flight_decodes: usize,
}

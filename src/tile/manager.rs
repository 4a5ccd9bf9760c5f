//! Tile state machine.
//!
//! The [`TileManager`] owns every tile of the attached image. It is a plain
//! single-threaded state machine: the engine's coordinator task feeds it
//! viewport changes and decode results, and drains the decode jobs it
//! produces.
//!
//! ```text
//!   refresh(viewport) ──► plan level + load rect ──► diff tiles ──► pending jobs
//!                                                                     │
//!                                                          drain_jobs │
//!                                                                     ▼
//!   apply_result(outcome) ◄──────────────────────────────── worker pool
//! ```
//!
//! Per tile: `Idle → Queued → Decoding → Ready | Error`. A result is applied
//! only when its tile is still waiting for that exact request; anything
//! else is stale and its buffer goes back to the pool.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, trace, warn};

use crate::config::EngineConfig;
use crate::decode::ImageInfo;
use crate::engine::{ContinuousTransformTypes, ViewportState};
use crate::error::DecodeError;
use crate::geometry::{IntRect, IntSize, Orientation, OrientationTransform};
use crate::grid::{
    calculate_image_load_rect, calculate_tile_grid_map, can_use_subsampling, find_sample_size,
    preferred_tile_size, SampleSize, TileCoord, TileGridMap, TileGridSizeMap,
};

use super::cache::TileCache;
use super::job::{DecodeJob, DecodeOutcome};
use super::state::{Tile, TileAnimation, TileKey, TileSnapshot, TileState};

// =============================================================================
// Refresh outcome
// =============================================================================

/// Why a refresh left the tiles untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Destroyed,
    NoImage,
    Paused,
    /// A gesture listed in the paused transform types is running
    ContinuousTransform,
}

/// Why a refresh dropped every tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearReason {
    /// Zoomed out to the base scale; the thumbnail is enough
    AtMinScale,
    /// The image is not larger than its thumbnail, or has another aspect ratio
    NotSubsamplable,
    /// Empty container, empty visible rect or non-positive scale
    InvalidViewport,
}

/// What [`TileManager::refresh`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Skipped(SkipReason),
    Cleared(ClearReason),
    Planned {
        sample_size: SampleSize,
        load_rect: IntRect,
        /// New decode jobs
        queued: usize,
        /// Tiles served from the tile cache
        cache_hits: usize,
    },
}

// =============================================================================
// TileManager
// =============================================================================

struct AttachedImage {
    key: Arc<str>,
    info: ImageInfo,
    /// Size after orientation, the space tiles are planned in
    image_size: IntSize,
    content_size: IntSize,
}

struct MemoizedGrid {
    image_size: IntSize,
    tile_size: IntSize,
    max_grid: Option<(u32, u32)>,
    map: Arc<TileGridMap>,
}

/// Owns the tiles of one image and decides what to decode.
pub struct TileManager {
    preferred_tile_size: Option<IntSize>,
    animation_duration: Duration,
    paused_transform_types: ContinuousTransformTypes,
    max_grid_size: Option<(u32, u32)>,
    cache: Option<Arc<TileCache>>,

    image: Option<AttachedImage>,
    grid: Option<MemoizedGrid>,
    foreground: BTreeMap<TileCoord, Tile>,
    background: Vec<Tile>,
    sample_size: Option<SampleSize>,
    load_rect: IntRect,
    pending: Vec<DecodeJob>,
    generation: u64,

    last_viewport: Option<ViewportState>,
    paused: bool,
    destroyed: bool,
}

impl TileManager {
    /// `cache` is consulted before decoding and filled with decoded tiles;
    /// pass `None` to disable it.
    pub fn new(config: &EngineConfig, cache: Option<Arc<TileCache>>) -> Self {
        Self {
            preferred_tile_size: config.preferred_tile_size,
            animation_duration: config.tile_animation_duration,
            paused_transform_types: config.paused_continuous_transform_types,
            max_grid_size: config.max_grid_size,
            cache,
            image: None,
            grid: None,
            foreground: BTreeMap::new(),
            background: Vec::new(),
            sample_size: None,
            load_rect: IntRect::EMPTY,
            pending: Vec::new(),
            generation: 0,
            last_viewport: None,
            paused: false,
            destroyed: false,
        }
    }

    // =========================================================================
    // Image lifecycle
    // =========================================================================

    /// Switch to a new image. `content_size` is the size of the thumbnail
    /// the viewport lays out.
    pub fn attach(
        &mut self,
        key: Arc<str>,
        info: ImageInfo,
        orientation: Orientation,
        content_size: IntSize,
    ) {
        if self.destroyed {
            return;
        }
        self.clear_tiles();
        self.grid = None;
        self.last_viewport = None;

        let image_size = OrientationTransform::new(orientation).apply_to_size(info.size(), false);
        info!(
            image = %key,
            size = %image_size,
            content = %content_size,
            subsampling = can_use_subsampling(image_size, content_size),
            "image attached"
        );
        self.image = Some(AttachedImage {
            key,
            info,
            image_size,
            content_size,
        });
    }

    /// Drop the image and all its tiles.
    pub fn detach(&mut self) {
        self.clear_tiles();
        self.grid = None;
        self.last_viewport = None;
        if let Some(image) = self.image.take() {
            info!(image = %image.key, "image detached");
        }
    }

    /// Release every tile and invalidate in-flight decodes.
    pub fn clear_tiles(&mut self) {
        if !self.foreground.is_empty() || !self.background.is_empty() {
            debug!(
                foreground = self.foreground.len(),
                background = self.background.len(),
                "clearing tiles"
            );
        }
        self.foreground.clear();
        self.background.clear();
        self.pending.clear();
        self.sample_size = None;
        self.load_rect = IntRect::EMPTY;
        self.generation += 1;
    }

    /// Stop submitting work. Tiles already displayed stay and running fades
    /// jump to their end; decodes already running finish and are shown
    /// without fading.
    pub fn pause(&mut self) {
        if self.paused || self.destroyed {
            return;
        }
        self.paused = true;
        self.finish_animations();
        for job in self.pending.drain(..) {
            if let Some(tile) = self.foreground.get_mut(&job.key.coordinate) {
                if tile.state() == TileState::Queued {
                    tile.reset();
                }
            }
        }
        debug!("tile manager paused");
    }

    /// Resume work: failed tiles get another chance and the last viewport
    /// is refreshed again.
    pub fn resume(&mut self) -> Option<RefreshOutcome> {
        if self.destroyed {
            return None;
        }
        self.paused = false;
        for tile in self.foreground.values_mut() {
            if tile.state() == TileState::Error {
                tile.reset();
            }
        }
        debug!("tile manager resumed");
        let viewport = self.last_viewport.clone()?;
        Some(self.refresh(&viewport))
    }

    /// Terminal: release everything, ignore every later call.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.detach();
        self.destroyed = true;
        debug!("tile manager destroyed");
    }

    // =========================================================================
    // Refresh
    // =========================================================================

    /// Recompute the tiles needed for `viewport` and queue decode jobs for
    /// the missing ones.
    pub fn refresh(&mut self, viewport: &ViewportState) -> RefreshOutcome {
        if self.destroyed {
            return RefreshOutcome::Skipped(SkipReason::Destroyed);
        }
        let Some(image) = self.image.as_ref() else {
            return RefreshOutcome::Skipped(SkipReason::NoImage);
        };
        let image_key = Arc::clone(&image.key);
        let image_size = image.image_size;
        let content_size = image.content_size;

        self.last_viewport = Some(viewport.clone());
        if self.paused {
            return RefreshOutcome::Skipped(SkipReason::Paused);
        }

        // Back at the fit scale the thumbnail is enough, even mid-gesture
        if !can_use_subsampling(image_size, content_size) {
            return self.clear_with(ClearReason::NotSubsamplable);
        }
        if viewport.scale <= viewport.min_scale {
            return self.clear_with(ClearReason::AtMinScale);
        }
        if viewport.is_paused_by(self.paused_transform_types) {
            trace!(transform = ?viewport.continuous_transform, "refresh skipped during gesture");
            return RefreshOutcome::Skipped(SkipReason::ContinuousTransform);
        }

        let tile_size = self
            .preferred_tile_size
            .unwrap_or_else(|| preferred_tile_size(viewport.container_size));
        if tile_size.is_empty() {
            return self.clear_with(ClearReason::InvalidViewport);
        }

        let grid = self.grid_map(image_size, tile_size);
        let Some(sample_size) = find_sample_size(image_size, content_size, viewport.scale)
            .and_then(|sample_size| grid.nearest_level(sample_size))
        else {
            return self.clear_with(ClearReason::InvalidViewport);
        };
        let load_rect = calculate_image_load_rect(
            image_size,
            content_size,
            tile_size,
            viewport.content_visible_rect,
        );
        if load_rect.is_empty() {
            return self.clear_with(ClearReason::InvalidViewport);
        }

        if self.sample_size != Some(sample_size) {
            self.switch_level(sample_size);
        }
        self.load_rect = load_rect;
        self.generation += 1;
        let generation = self.generation;

        // Tiles that left the load rect are released
        self.foreground
            .retain(|_, tile| tile.src_rect().overlaps(&load_rect));

        let mut queued = 0;
        let mut cache_hits = 0;
        let specs = grid.tiles(sample_size).unwrap_or_default();
        for spec in specs.iter().filter(|spec| spec.src_rect.overlaps(&load_rect)) {
            let tile = self.foreground.entry(spec.coordinate).or_insert_with(|| {
                Tile::new(
                    TileKey::new(Arc::clone(&image_key), sample_size, spec.coordinate),
                    *spec,
                )
            });
            match tile.state() {
                TileState::Idle => {}
                // A failed decode gets one new attempt per refresh
                TileState::Error => tile.reset(),
                _ => continue,
            }

            if let Some(cached) = self.cache.as_ref().and_then(|cache| cache.get(tile.key())) {
                trace!(tile = %tile.key(), "tile cache hit");
                tile.set_ready(cached.buffer, true, TileAnimation::displayed());
                cache_hits += 1;
                continue;
            }

            tile.mark_queued(generation);
            self.pending.push(DecodeJob {
                key: tile.key().clone(),
                spec: *spec,
                generation,
            });
            queued += 1;
        }

        self.cleanup_background();

        debug!(
            image = %image_key,
            sample_size = sample_size.get(),
            load_rect = %load_rect,
            generation,
            queued,
            cache_hits,
            foreground = self.foreground.len(),
            background = self.background.len(),
            "tiles refreshed"
        );

        RefreshOutcome::Planned {
            sample_size,
            load_rect,
            queued,
            cache_hits,
        }
    }

    fn clear_with(&mut self, reason: ClearReason) -> RefreshOutcome {
        if self.sample_size.is_some() {
            debug!(reason = ?reason, "subsampling not needed");
        }
        self.clear_tiles();
        RefreshOutcome::Cleared(reason)
    }

    /// Memoized pyramid for the current image and tile size. A different
    /// tile size means a different grid, so current tiles are dropped.
    fn grid_map(&mut self, image_size: IntSize, tile_size: IntSize) -> Arc<TileGridMap> {
        let max_grid = self.max_grid_size;
        if let Some(grid) = &self.grid {
            if grid.image_size == image_size && grid.tile_size == tile_size && grid.max_grid == max_grid {
                return Arc::clone(&grid.map);
            }
            self.clear_tiles();
        }

        let map = Arc::new(calculate_tile_grid_map(image_size, tile_size, max_grid));
        debug!(
            size = %image_size,
            tile_size = %tile_size,
            levels = map.len(),
            "tile grid built"
        );
        self.grid = Some(MemoizedGrid {
            image_size,
            tile_size,
            max_grid,
            map: Arc::clone(&map),
        });
        map
    }

    /// Move to another pyramid level. Ready tiles of a neighbouring level
    /// stay underneath as background; tiles already decoded at the new
    /// level are taken back from the background.
    fn switch_level(&mut self, sample_size: SampleSize) {
        let previous = std::mem::take(&mut self.foreground);
        let mut background = Vec::with_capacity(self.background.len() + previous.len());

        for tile in self.background.drain(..) {
            if tile.sample_size() == sample_size {
                self.foreground.insert(tile.coordinate(), tile);
            } else {
                background.push(tile);
            }
        }
        for tile in previous.into_values() {
            if tile.is_ready() && tile.sample_size().is_adjacent_to(sample_size) {
                background.push(tile);
            }
        }

        debug!(
            from = ?self.sample_size.map(|s| s.get()),
            to = sample_size.get(),
            background = background.len(),
            "switching level"
        );
        self.background = background;
        self.sample_size = Some(sample_size);
    }

    /// Keep only useful background tiles, and none once the foreground is
    /// complete.
    fn cleanup_background(&mut self) {
        if self.background.is_empty() {
            return;
        }
        let Some(sample_size) = self.sample_size else {
            self.background.clear();
            return;
        };

        if self.is_foreground_complete() {
            debug!(released = self.background.len(), "foreground complete, releasing background");
            self.background.clear();
            return;
        }

        let load_rect = self.load_rect;
        self.background.retain(|tile| {
            tile.is_ready()
                && tile.sample_size() != sample_size
                && tile.sample_size().is_adjacent_to(sample_size)
                && tile.src_rect().overlaps(&load_rect)
        });
    }

    /// Every tile of the load rect is ready.
    pub fn is_foreground_complete(&self) -> bool {
        !self.foreground.is_empty() && self.foreground.values().all(Tile::is_ready)
    }

    // =========================================================================
    // Jobs and results
    // =========================================================================

    /// Hand the queued jobs to the caller; their tiles become `Decoding`.
    /// Returns nothing while paused.
    pub fn drain_jobs(&mut self) -> Vec<DecodeJob> {
        if self.paused || self.destroyed {
            return Vec::new();
        }
        let pending = std::mem::take(&mut self.pending);
        pending
            .into_iter()
            .filter(|job| match self.foreground.get_mut(&job.key.coordinate) {
                Some(tile)
                    if tile.key() == &job.key
                        && tile.state() == TileState::Queued
                        && tile.request_generation() == job.generation =>
                {
                    tile.mark_decoding();
                    true
                }
                _ => false,
            })
            .collect()
    }

    /// Apply a finished decode. Returns whether a tile changed; stale
    /// results are dropped and their buffer returns to its pool.
    pub fn apply_result(&mut self, outcome: DecodeOutcome, now: Instant) -> bool {
        let DecodeOutcome {
            key,
            generation,
            result,
        } = outcome;

        if self.destroyed {
            return false;
        }
        let tile = match self.foreground.get_mut(&key.coordinate) {
            Some(tile) if tile.key() == &key && tile.accepts(generation) => tile,
            _ => {
                debug!(tile = %key, generation, "discarding stale decode result");
                return false;
            }
        };

        match result {
            Ok(buffer) => {
                let buffer = Arc::new(buffer);
                if let (Some(cache), Some(image)) = (&self.cache, &self.image) {
                    cache.put(
                        key.clone(),
                        Arc::clone(&buffer),
                        Arc::clone(&image.key),
                        image.info.clone(),
                    );
                }
                let animation = if self.paused {
                    TileAnimation::displayed()
                } else {
                    TileAnimation::fade_in(now, self.animation_duration)
                };
                tile.set_ready(buffer, false, animation);
                trace!(tile = %key, generation, "tile ready");
            }
            Err(err) => {
                match &err {
                    DecodeError::RegionOutOfBounds { .. } => {
                        error!(tile = %key, error = %err, "tile region outside the image")
                    }
                    _ => warn!(tile = %key, error = %err, "tile decode failed"),
                }
                tile.set_error(err);
            }
        }

        self.cleanup_background();
        true
    }

    /// Step fade-in animations. Returns whether any alpha changed.
    pub fn advance_animations(&mut self, now: Instant) -> bool {
        let mut changed = false;
        for tile in self.foreground.values_mut() {
            changed |= tile.advance_animation(now);
        }
        for tile in &mut self.background {
            changed |= tile.advance_animation(now);
        }
        changed
    }

    /// Jump every running fade, foreground and background, to its end.
    pub fn finish_animations(&mut self) -> bool {
        let mut changed = false;
        for tile in self.foreground.values_mut().chain(self.background.iter_mut()) {
            changed |= tile.finish_animation();
        }
        changed
    }

    pub fn has_running_animations(&self) -> bool {
        self.foreground
            .values()
            .chain(self.background.iter())
            .any(|tile| tile.animation().is_running())
    }

    // =========================================================================
    // Observers
    // =========================================================================

    pub fn image_key(&self) -> Option<&Arc<str>> {
        self.image.as_ref().map(|image| &image.key)
    }

    pub fn image_info(&self) -> Option<&ImageInfo> {
        self.image.as_ref().map(|image| &image.info)
    }

    /// Image size after orientation.
    pub fn image_size(&self) -> Option<IntSize> {
        self.image.as_ref().map(|image| image.image_size)
    }

    /// Whether the attached image is large enough to be tiled.
    pub fn can_subsample(&self) -> bool {
        self.image
            .as_ref()
            .is_some_and(|image| can_use_subsampling(image.image_size, image.content_size))
    }

    pub fn sample_size(&self) -> Option<SampleSize> {
        self.sample_size
    }

    pub fn load_rect(&self) -> IntRect {
        self.load_rect
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Jobs queued and not yet drained.
    pub fn pending_jobs(&self) -> usize {
        self.pending.len()
    }

    /// Tiles waiting for a worker result.
    pub fn decoding_tiles(&self) -> usize {
        self.foreground
            .values()
            .filter(|tile| tile.state() == TileState::Decoding)
            .count()
    }

    pub fn tile(&self, coordinate: TileCoord) -> Option<&Tile> {
        self.foreground.get(&coordinate)
    }

    /// Tiles of the current level, row by row.
    pub fn foreground_tiles(&self) -> Vec<TileSnapshot> {
        let mut tiles: Vec<TileSnapshot> = self.foreground.values().map(Tile::snapshot).collect();
        tiles.sort_by_key(|tile| (tile.coordinate.row, tile.coordinate.col));
        tiles
    }

    /// Tiles of a neighbouring level drawn underneath, coarsest first.
    pub fn background_tiles(&self) -> Vec<TileSnapshot> {
        let mut tiles: Vec<TileSnapshot> = self.background.iter().map(Tile::snapshot).collect();
        tiles.sort_by_key(|tile| {
            (
                std::cmp::Reverse(tile.sample_size),
                tile.coordinate.row,
                tile.coordinate.col,
            )
        });
        tiles
    }

    /// `(cols, rows)` per level of the current pyramid.
    pub fn grid_size_map(&self) -> TileGridSizeMap {
        self.grid
            .as_ref()
            .map(|grid| grid.map.grid_size_map())
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for TileManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileManager")
            .field("image", &self.image.as_ref().map(|image| &image.key))
            .field("sample_size", &self.sample_size)
            .field("load_rect", &self.load_rect)
            .field("foreground", &self.foreground.len())
            .field("background", &self.background.len())
            .field("generation", &self.generation)
            .field("paused", &self.paused)
            .field("destroyed", &self.destroyed)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

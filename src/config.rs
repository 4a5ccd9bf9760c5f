//! Configuration for the engine and the diagnostics binary.
//!
//! [`EngineConfig`] holds the library options. The CLI types wrap it with
//! clap, so every option can also come from the environment:
//!
//! - Command-line arguments via clap
//! - Environment variables with `SUBSAMPLING_` prefix
//! - Sensible defaults for all optional settings
//!
//! # Environment Variables
//!
//! - `SUBSAMPLING_VIEWPORT` - Viewport size as `WxH` (default: 1080x1920)
//! - `SUBSAMPLING_TILE_SIZE` - Preferred tile size override as `WxH`
//! - `SUBSAMPLING_ANIMATION_MS` - Tile fade-in duration (default: 200)
//! - `SUBSAMPLING_PAUSED_TRANSFORMS` - Gestures that skip refresh (default: scale,locate)
//! - `SUBSAMPLING_TILE_CACHE` - Decoded tile cache capacity in bytes (default: 128MB)
//! - `SUBSAMPLING_NO_TILE_CACHE` - Disable the decoded tile cache
//! - `SUBSAMPLING_BUFFER_POOL` - Buffer pool capacity in bytes (default: 64MB)
//! - `SUBSAMPLING_NO_BUFFER_REUSE` - Disable buffer reuse
//! - `SUBSAMPLING_MAX_GRID` - Cap on tiles per level as `COLSxROWS`
//! - `SUBSAMPLING_WORKERS` - Number of decode workers
//! - `SUBSAMPLING_FULL_DECODE_LIMIT` - Cap on whole-image decodes in bytes (default: 64MB, 0: unbounded)

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::buffer::DEFAULT_BUFFER_POOL_CAPACITY;
use crate::decode::{ImageRsDecoderFactory, DEFAULT_FULL_DECODE_LIMIT};
use crate::engine::ContinuousTransformTypes;
use crate::geometry::IntSize;
use crate::tile::DEFAULT_TILE_CACHE_CAPACITY;

// =============================================================================
// Default Values
// =============================================================================

/// Default tile fade-in duration in milliseconds.
pub const DEFAULT_TILE_ANIMATION_MS: u64 = 200;

/// Default animation tick (about 60 frames per second).
pub const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_millis(16);

/// Upper bound on the default decode worker count.
pub const MAX_DEFAULT_DECODE_WORKERS: usize = 8;

/// Default viewport for the CLI: a portrait phone screen.
pub const DEFAULT_VIEWPORT: &str = "1080x1920";

/// Worker count from the available parallelism, clamped to 1..=8.
pub fn default_decode_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .clamp(1, MAX_DEFAULT_DECODE_WORKERS)
}

// =============================================================================
// Engine Configuration
// =============================================================================

/// Options of a [`SubsamplingEngine`](crate::engine::SubsamplingEngine).
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Tile size override; half the container size when `None`
    pub preferred_tile_size: Option<IntSize>,

    /// Fade-in duration of new tiles; zero disables the animation
    pub tile_animation_duration: Duration,

    /// Gestures during which tiles are not recomputed
    pub paused_continuous_transform_types: ContinuousTransformTypes,

    /// Keep decoded tiles in the [`TileCache`](crate::tile::TileCache)
    pub memory_cache_enabled: bool,

    /// Tile cache capacity in bytes
    pub tile_cache_capacity: usize,

    /// Recycle pixel buffers through the [`BufferPool`](crate::buffer::BufferPool)
    pub buffer_reuse_enabled: bool,

    /// Buffer pool capacity in bytes
    pub buffer_pool_capacity: usize,

    /// Safety cap on `(cols, rows)` per level
    pub max_grid_size: Option<(u32, u32)>,

    /// Concurrent decode jobs
    pub decode_workers: usize,

    /// Animation tick
    pub frame_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            preferred_tile_size: None,
            tile_animation_duration: Duration::from_millis(DEFAULT_TILE_ANIMATION_MS),
            paused_continuous_transform_types: ContinuousTransformTypes::default(),
            memory_cache_enabled: true,
            tile_cache_capacity: DEFAULT_TILE_CACHE_CAPACITY,
            buffer_reuse_enabled: true,
            buffer_pool_capacity: DEFAULT_BUFFER_POOL_CAPACITY,
            max_grid_size: None,
            decode_workers: default_decode_workers(),
            frame_interval: DEFAULT_FRAME_INTERVAL,
        }
    }
}

impl EngineConfig {
    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(size) = self.preferred_tile_size {
            if size.is_empty() {
                return Err(format!("preferred tile size must not be empty, got {}", size));
            }
        }

        if let Some((cols, rows)) = self.max_grid_size {
            if cols == 0 || rows == 0 {
                return Err("max grid size must be at least 1x1".to_string());
            }
        }

        if self.decode_workers == 0 {
            return Err("decode_workers must be greater than 0".to_string());
        }

        if self.memory_cache_enabled && self.tile_cache_capacity == 0 {
            return Err(
                "tile_cache_capacity must be greater than 0 when the tile cache is enabled"
                    .to_string(),
            );
        }

        if self.frame_interval.is_zero() {
            return Err("frame_interval must be greater than 0".to_string());
        }

        Ok(())
    }

    pub fn with_preferred_tile_size(mut self, size: IntSize) -> Self {
        self.preferred_tile_size = Some(size);
        self
    }

    pub fn with_tile_animation_duration(mut self, duration: Duration) -> Self {
        self.tile_animation_duration = duration;
        self
    }

    pub fn with_paused_continuous_transform_types(mut self, types: ContinuousTransformTypes) -> Self {
        self.paused_continuous_transform_types = types;
        self
    }

    pub fn with_memory_cache(mut self, enabled: bool) -> Self {
        self.memory_cache_enabled = enabled;
        self
    }

    pub fn with_buffer_reuse(mut self, enabled: bool) -> Self {
        self.buffer_reuse_enabled = enabled;
        self
    }

    pub fn with_max_grid_size(mut self, cols: u32, rows: u32) -> Self {
        self.max_grid_size = Some((cols, rows));
        self
    }

    pub fn with_decode_workers(mut self, workers: usize) -> Self {
        self.decode_workers = workers;
        self
    }
}

// =============================================================================
// CLI Arguments
// =============================================================================

/// Subsampling - inspect and render huge images tile by tile.
#[derive(Parser, Debug, Clone)]
#[command(name = "subsampling")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    pub fn into_command(self) -> Command {
        self.command
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Print image info, format support and the tile pyramid.
    Inspect(InspectConfig),

    /// Load the tiles for one viewport and write them as a PNG.
    Render(RenderConfig),
}

/// Options shared by every command.
#[derive(Args, Debug, Clone)]
pub struct EngineArgs {
    /// Viewport size as WxH.
    #[arg(long, default_value = DEFAULT_VIEWPORT, value_parser = parse_size, env = "SUBSAMPLING_VIEWPORT")]
    pub viewport: IntSize,

    /// Preferred tile size as WxH (default: half the viewport).
    #[arg(long, value_parser = parse_size, env = "SUBSAMPLING_TILE_SIZE")]
    pub tile_size: Option<IntSize>,

    /// Cap on tiles per level as COLSxROWS.
    #[arg(long, value_parser = parse_size, env = "SUBSAMPLING_MAX_GRID")]
    pub max_grid: Option<IntSize>,

    /// Tile fade-in duration in milliseconds (0 disables).
    #[arg(long, default_value_t = DEFAULT_TILE_ANIMATION_MS, env = "SUBSAMPLING_ANIMATION_MS")]
    pub animation_ms: u64,

    /// Gestures that skip tile refresh (comma-separated, `none` or `all`).
    #[arg(long, default_value = "scale,locate", env = "SUBSAMPLING_PAUSED_TRANSFORMS")]
    pub paused_transforms: ContinuousTransformTypes,

    /// Decoded tile cache capacity in bytes.
    #[arg(long, default_value_t = DEFAULT_TILE_CACHE_CAPACITY, env = "SUBSAMPLING_TILE_CACHE")]
    pub tile_cache: usize,

    /// Disable the decoded tile cache.
    #[arg(long, default_value_t = false, env = "SUBSAMPLING_NO_TILE_CACHE")]
    pub no_tile_cache: bool,

    /// Buffer pool capacity in bytes.
    #[arg(long, default_value_t = DEFAULT_BUFFER_POOL_CAPACITY, env = "SUBSAMPLING_BUFFER_POOL")]
    pub buffer_pool: usize,

    /// Disable pixel buffer reuse.
    #[arg(long, default_value_t = false, env = "SUBSAMPLING_NO_BUFFER_REUSE")]
    pub no_buffer_reuse: bool,

    /// Number of decode workers (default: available cores, at most 8).
    #[arg(long, env = "SUBSAMPLING_WORKERS")]
    pub workers: Option<usize>,

    /// Largest image, in decoded bytes, held whole when its format cannot
    /// be streamed by rows (0: unbounded).
    #[arg(long, default_value_t = DEFAULT_FULL_DECODE_LIMIT, env = "SUBSAMPLING_FULL_DECODE_LIMIT")]
    pub full_decode_limit: u64,

    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

impl EngineArgs {
    /// Reference decoder with the configured whole-decode cap.
    pub fn decoder_factory(&self) -> ImageRsDecoderFactory {
        let limit = (self.full_decode_limit > 0).then_some(self.full_decode_limit);
        ImageRsDecoderFactory::new().with_full_decode_limit(limit)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            preferred_tile_size: self.tile_size,
            tile_animation_duration: Duration::from_millis(self.animation_ms),
            paused_continuous_transform_types: self.paused_transforms,
            memory_cache_enabled: !self.no_tile_cache,
            tile_cache_capacity: self.tile_cache,
            buffer_reuse_enabled: !self.no_buffer_reuse,
            buffer_pool_capacity: self.buffer_pool,
            max_grid_size: self.max_grid.map(|size| (size.width, size.height)),
            decode_workers: self.workers.unwrap_or_else(default_decode_workers),
            frame_interval: DEFAULT_FRAME_INTERVAL,
        }
    }

    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.viewport.is_empty() {
            return Err(format!("viewport must not be empty, got {}", self.viewport));
        }
        self.engine_config().validate()
    }
}

/// Arguments of `inspect`.
#[derive(Args, Debug, Clone)]
pub struct InspectConfig {
    /// Image file to inspect.
    pub path: PathBuf,

    /// Print JSON instead of text.
    #[arg(long, default_value_t = false)]
    pub json: bool,

    #[command(flatten)]
    pub engine: EngineArgs,
}

/// Arguments of `render`.
#[derive(Args, Debug, Clone)]
pub struct RenderConfig {
    /// Image file to render.
    pub path: PathBuf,

    /// Output PNG file.
    #[arg(short, long, default_value = "render.png")]
    pub output: PathBuf,

    /// Zoom relative to the fit-to-viewport scale.
    #[arg(long, default_value_t = 4.0)]
    pub scale: f32,

    /// Center of the view as fractions of the image, `X,Y` in 0..1.
    #[arg(long, default_value = "0.5,0.5", value_parser = parse_focus)]
    pub focus: (f32, f32),

    /// Give up waiting for tiles after this many milliseconds.
    #[arg(long, default_value_t = 30_000)]
    pub timeout_ms: u64,

    #[command(flatten)]
    pub engine: EngineArgs,
}

impl RenderConfig {
    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if !(self.scale > 0.0) || !self.scale.is_finite() {
            return Err(format!("scale must be a positive number, got {}", self.scale));
        }
        self.engine.validate()
    }
}

/// Parse `WxH` (also accepts `W,H`).
pub fn parse_size(s: &str) -> Result<IntSize, String> {
    let (w, h) = s
        .split_once(['x', 'X', ','])
        .ok_or_else(|| format!("expected WxH, got '{}'", s))?;
    let width = w
        .trim()
        .parse::<u32>()
        .map_err(|e| format!("invalid width '{}': {}", w, e))?;
    let height = h
        .trim()
        .parse::<u32>()
        .map_err(|e| format!("invalid height '{}': {}", h, e))?;
    Ok(IntSize::new(width, height))
}

fn parse_focus(s: &str) -> Result<(f32, f32), String> {
    let (x, y) = s
        .split_once(',')
        .ok_or_else(|| format!("expected X,Y, got '{}'", s))?;
    let x = x.trim().parse::<f32>().map_err(|e| e.to_string())?;
    let y = y.trim().parse::<f32>().map_err(|e| e.to_string())?;
    if !(0.0..=1.0).contains(&x) || !(0.0..=1.0).contains(&y) {
        return Err(format!("focus must be within 0..1, got {},{}", x, y));
    }
    Ok((x, y))
}

// =============================================================================
// Tests
// =============================================================================

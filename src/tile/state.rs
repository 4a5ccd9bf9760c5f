use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::buffer::PixelBuffer;
use crate::error::DecodeError;
use crate::geometry::IntRect;
use crate::grid::{SampleSize, TileCoord, TileSpec};

// =============================================================================
// TileKey
// =============================================================================

/// Identity of a tile across refreshes: the image it belongs to, its
/// pyramid level and its grid position.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TileKey {
    pub image_key: Arc<str>,
    pub sample_size: SampleSize,
    pub coordinate: TileCoord,
}

impl TileKey {
    pub fn new(image_key: impl Into<Arc<str>>, sample_size: SampleSize, coordinate: TileCoord) -> Self {
        Self {
            image_key: image_key.into(),
            sample_size,
            coordinate,
        }
    }
}

impl fmt::Display for TileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}/{},{}",
            self.image_key,
            self.sample_size.get(),
            self.coordinate.col,
            self.coordinate.row
        )
    }
}

// =============================================================================
// TileState
// =============================================================================

/// Decode lifecycle of a tile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub enum TileState {
    /// Known but not requested (or released and waiting to be requested again)
    #[default]
    Idle,
    /// Decode job created, not yet handed to a worker
    Queued,
    /// A worker is decoding it
    Decoding,
    /// Pixels available
    Ready,
    /// Decode failed; skipped until the tile is released or the engine resumes
    Error,
}

impl TileState {
    /// Whether a decode for this tile is outstanding.
    pub fn is_pending(&self) -> bool {
        matches!(self, TileState::Queued | TileState::Decoding)
    }
}

// =============================================================================
// TileAnimation
// =============================================================================

/// Fade-in of a freshly decoded tile, alpha 0 to 255 over a fixed duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileAnimation {
    alpha: u8,
    running: bool,
    started_at: Option<Instant>,
    duration: Duration,
}

impl TileAnimation {
    /// Not shown yet.
    pub fn hidden() -> Self {
        Self {
            alpha: 0,
            running: false,
            started_at: None,
            duration: Duration::ZERO,
        }
    }

    /// Fully shown, no fade.
    pub fn displayed() -> Self {
        Self {
            alpha: u8::MAX,
            ..Self::hidden()
        }
    }

    /// Start fading in at `now`. A zero duration shows the tile at once.
    pub fn fade_in(now: Instant, duration: Duration) -> Self {
        if duration.is_zero() {
            return Self::displayed();
        }
        Self {
            alpha: 0,
            running: true,
            started_at: Some(now),
            duration,
        }
    }

    pub fn alpha(&self) -> u8 {
        self.alpha
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_displayed(&self) -> bool {
        !self.running && self.alpha == u8::MAX
    }

    /// Move the fade forward to `now`. Returns whether alpha changed.
    pub fn advance(&mut self, now: Instant) -> bool {
        if !self.running {
            return false;
        }
        let Some(started_at) = self.started_at else {
            *self = Self::displayed();
            return true;
        };

        let elapsed = now.saturating_duration_since(started_at);
        if elapsed >= self.duration {
            *self = Self::displayed();
            return true;
        }

        let progress = elapsed.as_secs_f64() / self.duration.as_secs_f64();
        let alpha = (progress * u8::MAX as f64) as u8;
        let changed = alpha != self.alpha;
        self.alpha = alpha;
        changed
    }
}

impl Default for TileAnimation {
    fn default() -> Self {
        Self::hidden()
    }
}

// =============================================================================
// Tile
// =============================================================================

/// One tile of the pyramid with its decode and display state.
///
/// Owned by the tile manager. The decoded buffer is shared with the tile
/// cache, and goes back to its pool when the last holder lets go.
#[derive(Debug)]
pub struct Tile {
    key: TileKey,
    spec: TileSpec,
    state: TileState,
    buffer: Option<Arc<PixelBuffer>>,
    animation: TileAnimation,
    from_cache: bool,
    request_generation: u64,
    error: Option<DecodeError>,
}

impl Tile {
    pub fn new(key: TileKey, spec: TileSpec) -> Self {
        Self {
            key,
            spec,
            state: TileState::Idle,
            buffer: None,
            animation: TileAnimation::hidden(),
            from_cache: false,
            request_generation: 0,
            error: None,
        }
    }

    pub fn key(&self) -> &TileKey {
        &self.key
    }

    pub fn spec(&self) -> &TileSpec {
        &self.spec
    }

    pub fn coordinate(&self) -> TileCoord {
        self.spec.coordinate
    }

    pub fn src_rect(&self) -> IntRect {
        self.spec.src_rect
    }

    pub fn sample_size(&self) -> SampleSize {
        self.spec.sample_size
    }

    pub fn state(&self) -> TileState {
        self.state
    }

    pub fn buffer(&self) -> Option<&Arc<PixelBuffer>> {
        self.buffer.as_ref()
    }

    pub fn animation(&self) -> &TileAnimation {
        &self.animation
    }

    pub fn is_from_cache(&self) -> bool {
        self.from_cache
    }

    pub fn request_generation(&self) -> u64 {
        self.request_generation
    }

    pub fn error(&self) -> Option<&DecodeError> {
        self.error.as_ref()
    }

    pub fn is_ready(&self) -> bool {
        self.state == TileState::Ready
    }

    /// Whether a result stamped with `generation` answers this tile's
    /// outstanding request.
    pub fn accepts(&self, generation: u64) -> bool {
        self.state == TileState::Decoding && self.request_generation == generation
    }

    pub(crate) fn mark_queued(&mut self, generation: u64) {
        self.state = TileState::Queued;
        self.request_generation = generation;
        self.error = None;
    }

    pub(crate) fn mark_decoding(&mut self) {
        self.state = TileState::Decoding;
    }

    pub(crate) fn set_ready(&mut self, buffer: Arc<PixelBuffer>, from_cache: bool, animation: TileAnimation) {
        self.state = TileState::Ready;
        self.buffer = Some(buffer);
        self.from_cache = from_cache;
        self.animation = animation;
        self.error = None;
    }

    pub(crate) fn set_error(&mut self, error: DecodeError) {
        self.state = TileState::Error;
        self.buffer = None;
        self.animation = TileAnimation::hidden();
        self.error = Some(error);
    }

    /// Back to `Idle`, dropping the buffer and any outstanding request.
    pub(crate) fn reset(&mut self) {
        self.state = TileState::Idle;
        self.buffer = None;
        self.animation = TileAnimation::hidden();
        self.from_cache = false;
        self.error = None;
    }

    pub(crate) fn advance_animation(&mut self, now: Instant) -> bool {
        self.animation.advance(now)
    }

    pub(crate) fn finish_animation(&mut self) -> bool {
        if self.animation.is_running() {
            self.animation = TileAnimation::displayed();
            return true;
        }
        false
    }

    pub fn snapshot(&self) -> TileSnapshot {
        TileSnapshot {
            coordinate: self.spec.coordinate,
            src_rect: self.spec.src_rect,
            sample_size: self.spec.sample_size,
            state: self.state,
            alpha: self.animation.alpha(),
            from_cache: self.from_cache,
            buffer: self.buffer.clone(),
        }
    }
}

/// Read-only view of a tile, cheap to clone and safe to hand to a renderer.
#[derive(Debug, Clone)]
pub struct TileSnapshot {
    pub coordinate: TileCoord,
    pub src_rect: IntRect,
    pub sample_size: SampleSize,
    pub state: TileState,
    pub alpha: u8,
    pub from_cache: bool,
    pub buffer: Option<Arc<PixelBuffer>>,
}

impl TileSnapshot {
    pub fn is_ready(&self) -> bool {
        self.state == TileState::Ready && self.buffer.is_some()
    }
}

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::geometry::{IntRect, IntSize};

// =============================================================================
// SampleSize
// =============================================================================

/// Power-of-two downscale factor applied while decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct SampleSize(u32);

impl SampleSize {
    /// Full resolution.
    pub const ONE: SampleSize = SampleSize(1);

    /// Largest sample size the planner will produce.
    pub const MAX: SampleSize = SampleSize(1 << 30);

    /// Returns `None` unless `value` is a power of two.
    pub fn new(value: u32) -> Option<Self> {
        value.is_power_of_two().then_some(SampleSize(value))
    }

    /// Largest power of two not greater than `value`, and at least 1.
    ///
    /// A value exactly equal to a power of two maps to that power, so ties
    /// favour the coarser level.
    pub fn closest_power_of_two(value: f64) -> Self {
        if !value.is_finite() {
            return if value > 0.0 { Self::MAX } else { Self::ONE };
        }
        let mut sample = 1u32;
        while sample < Self::MAX.0 && (sample as f64) * 2.0 <= value {
            sample *= 2;
        }
        SampleSize(sample)
    }

    pub fn get(&self) -> u32 {
        self.0
    }

    /// Next coarser level.
    pub fn doubled(&self) -> Option<Self> {
        (self.0 < Self::MAX.0).then(|| SampleSize(self.0 * 2))
    }

    /// Next finer level.
    pub fn halved(&self) -> Option<Self> {
        (self.0 > 1).then(|| SampleSize(self.0 / 2))
    }

    /// Whether two levels are at most one doubling apart.
    pub fn is_adjacent_to(&self, other: SampleSize) -> bool {
        self.0 == other.0 || self.0 == other.0 * 2 || other.0 == self.0 * 2
    }

    /// Pixel count after decoding `length` source pixels at this sample size.
    pub fn scaled_length(&self, length: u32) -> u32 {
        length.div_ceil(self.0)
    }

    /// Size after decoding a `size` region at this sample size.
    pub fn scaled_size(&self, size: IntSize) -> IntSize {
        IntSize::new(self.scaled_length(size.width), self.scaled_length(size.height))
    }
}

impl Default for SampleSize {
    fn default() -> Self {
        Self::ONE
    }
}

impl fmt::Display for SampleSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// TileSpec
// =============================================================================

/// Column and row of a tile within its grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct TileCoord {
    pub col: u32,
    pub row: u32,
}

impl TileCoord {
    pub const fn new(col: u32, row: u32) -> Self {
        Self { col, row }
    }
}

/// Static description of one tile of the pyramid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TileSpec {
    pub coordinate: TileCoord,
    /// Region covered, in full-resolution image pixels
    pub src_rect: IntRect,
    pub sample_size: SampleSize,
}

impl TileSpec {
    /// Dimensions of the decoded pixels.
    pub fn decoded_size(&self) -> IntSize {
        self.sample_size.scaled_size(self.src_rect.size())
    }
}

// =============================================================================
// TileGridMap
// =============================================================================

/// Sample size to `(cols, rows)`.
pub type TileGridSizeMap = BTreeMap<SampleSize, (u32, u32)>;

/// Tiles of every pyramid level of one image, keyed by sample size.
///
/// Immutable once built; each level is in row-major order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TileGridMap {
    levels: BTreeMap<SampleSize, Level>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Level {
    cols: u32,
    rows: u32,
    tiles: Vec<TileSpec>,
}

impl TileGridMap {
    pub(super) fn insert(&mut self, sample_size: SampleSize, cols: u32, rows: u32, tiles: Vec<TileSpec>) {
        self.levels.insert(sample_size, Level { cols, rows, tiles });
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// Number of pyramid levels.
    pub fn len(&self) -> usize {
        self.levels.len()
    }

    /// Tiles of one level.
    pub fn tiles(&self, sample_size: SampleSize) -> Option<&[TileSpec]> {
        self.levels.get(&sample_size).map(|level| level.tiles.as_slice())
    }

    /// `(cols, rows)` of one level.
    pub fn grid_size(&self, sample_size: SampleSize) -> Option<(u32, u32)> {
        self.levels
            .get(&sample_size)
            .map(|level| (level.cols, level.rows))
    }

    /// Sample sizes, finest first.
    pub fn sample_sizes(&self) -> impl Iterator<Item = SampleSize> + '_ {
        self.levels.keys().copied()
    }

    /// The single-tile level.
    pub fn coarsest(&self) -> Option<SampleSize> {
        self.levels.keys().next_back().copied()
    }

    /// Clamp a sample size to one present in the map.
    pub fn nearest_level(&self, sample_size: SampleSize) -> Option<SampleSize> {
        if self.levels.contains_key(&sample_size) {
            return Some(sample_size);
        }
        self.levels
            .range(..sample_size)
            .next_back()
            .map(|(sample, _)| *sample)
            .or_else(|| self.levels.keys().next().copied())
    }

    /// Sample size to `(cols, rows)` for diagnostics overlays.
    pub fn grid_size_map(&self) -> TileGridSizeMap {
        self.levels
            .iter()
            .map(|(sample, level)| (*sample, (level.cols, level.rows)))
            .collect()
    }
}

//! Integer geometry primitives shared by the planner, the decoders and the
//! tile manager.
//!
//! All rectangles are half-open: `[left, right) x [top, bottom)`.

mod orientation;

pub use orientation::{Orientation, OrientationTransform};

use std::fmt;

use serde::Serialize;

// =============================================================================
// IntSize
// =============================================================================

/// Width and height in pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub struct IntSize {
    pub width: u32,
    pub height: u32,
}

impl IntSize {
    pub const ZERO: IntSize = IntSize {
        width: 0,
        height: 0,
    };

    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// A size is empty when either axis is zero.
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Swap width and height.
    pub fn transposed(&self) -> Self {
        Self::new(self.height, self.width)
    }

    /// Halve both axes, rounding down.
    pub fn halved(&self) -> Self {
        Self::new(self.width / 2, self.height / 2)
    }

    /// Largest size with this aspect ratio that fits in `bounds`. Sizes that
    /// already fit are returned unchanged.
    pub fn fit_within(&self, bounds: IntSize) -> Self {
        if self.is_empty() || bounds.is_empty() {
            return IntSize::ZERO;
        }
        if self.width <= bounds.width && self.height <= bounds.height {
            return *self;
        }
        let ratio = (bounds.width as f64 / self.width as f64)
            .min(bounds.height as f64 / self.height as f64);
        Self::new(
            ((self.width as f64 * ratio).round() as u32).clamp(1, bounds.width),
            ((self.height as f64 * ratio).round() as u32).clamp(1, bounds.height),
        )
    }
}

impl fmt::Display for IntSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

// =============================================================================
// IntRect
// =============================================================================

/// Axis-aligned pixel rectangle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub struct IntRect {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

impl IntRect {
    pub const EMPTY: IntRect = IntRect {
        left: 0,
        top: 0,
        right: 0,
        bottom: 0,
    };

    pub const fn new(left: u32, top: u32, right: u32, bottom: u32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    /// Rectangle anchored at the origin with the given size.
    pub const fn from_size(size: IntSize) -> Self {
        Self::new(0, 0, size.width, size.height)
    }

    pub fn width(&self) -> u32 {
        self.right.saturating_sub(self.left)
    }

    pub fn height(&self) -> u32 {
        self.bottom.saturating_sub(self.top)
    }

    pub fn size(&self) -> IntSize {
        IntSize::new(self.width(), self.height())
    }

    pub fn is_empty(&self) -> bool {
        self.left >= self.right || self.top >= self.bottom
    }

    /// True when both rectangles share at least one pixel.
    pub fn overlaps(&self, other: &IntRect) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.left < other.right
            && other.left < self.right
            && self.top < other.bottom
            && other.top < self.bottom
    }

    /// True when `other` lies entirely within this rectangle.
    pub fn contains_rect(&self, other: &IntRect) -> bool {
        other.left >= self.left
            && other.top >= self.top
            && other.right <= self.right
            && other.bottom <= self.bottom
    }

    /// Intersection of two rectangles, or `None` when they do not overlap.
    pub fn intersect(&self, other: &IntRect) -> Option<IntRect> {
        if !self.overlaps(other) {
            return None;
        }
        Some(IntRect::new(
            self.left.max(other.left),
            self.top.max(other.top),
            self.right.min(other.right),
            self.bottom.min(other.bottom),
        ))
    }
}

// =============================================================================
// IntOffset
// =============================================================================

/// Signed pixel offset, used to place tiles on a canvas.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub struct IntOffset {
    pub x: i32,
    pub y: i32,
}

impl IntOffset {
    pub const ZERO: IntOffset = IntOffset { x: 0, y: 0 };

    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Top-left corner of `rect` once image coordinates are divided by
    /// `divisor` (a sample size or a canvas scale), rounding down.
    pub fn of_scaled_rect(rect: &IntRect, divisor: u32) -> Self {
        let divisor = divisor.max(1);
        Self::new(
            (rect.left / divisor).min(i32::MAX as u32) as i32,
            (rect.top / divisor).min(i32::MAX as u32) as i32,
        )
    }
}

impl fmt::Display for IntRect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{},{} - {},{}]",
            self.left, self.top, self.right, self.bottom
        )
    }
}

//! EXIF orientation correction.
//!
//! Cameras store pixels in sensor order and record how the picture must be
//! rotated or mirrored for display. Every EXIF orientation decomposes into
//! an optional horizontal flip followed by a clockwise rotation of 0, 90,
//! 180 or 270 degrees:
//!
//! | Code | Orientation    | Flip | Rotation |
//! |------|----------------|------|----------|
//! | 1    | Normal         | no   | 0        |
//! | 2    | FlipHorizontal | yes  | 0        |
//! | 3    | Rotate180      | no   | 180      |
//! | 4    | FlipVertical   | yes  | 180      |
//! | 5    | Transpose      | yes  | 270      |
//! | 6    | Rotate90       | no   | 90       |
//! | 7    | Transverse     | yes  | 90       |
//! | 8    | Rotate270      | no   | 270      |
//!
//! "Source space" is the pixel layout stored in the file; "display space"
//! is the layout after the correction is applied.

use crate::buffer::PixelBuffer;

use super::{IntRect, IntSize};

// =============================================================================
// Orientation
// =============================================================================

/// EXIF orientation tag value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Orientation {
    #[default]
    Undefined,
    Normal,
    FlipHorizontal,
    Rotate180,
    FlipVertical,
    Transpose,
    Rotate90,
    Transverse,
    Rotate270,
}

impl Orientation {
    /// Map a raw EXIF code. Unknown codes become `Undefined` (identity).
    pub fn from_exif(code: u16) -> Self {
        match code {
            1 => Orientation::Normal,
            2 => Orientation::FlipHorizontal,
            3 => Orientation::Rotate180,
            4 => Orientation::FlipVertical,
            5 => Orientation::Transpose,
            6 => Orientation::Rotate90,
            7 => Orientation::Transverse,
            8 => Orientation::Rotate270,
            _ => Orientation::Undefined,
        }
    }

    /// The EXIF code, `0` for `Undefined`.
    pub fn exif_code(&self) -> u16 {
        match self {
            Orientation::Undefined => 0,
            Orientation::Normal => 1,
            Orientation::FlipHorizontal => 2,
            Orientation::Rotate180 => 3,
            Orientation::FlipVertical => 4,
            Orientation::Transpose => 5,
            Orientation::Rotate90 => 6,
            Orientation::Transverse => 7,
            Orientation::Rotate270 => 8,
        }
    }

    /// `(flip_horizontal, clockwise_degrees)` decomposition.
    pub fn decompose(&self) -> (bool, u16) {
        match self {
            Orientation::Undefined | Orientation::Normal => (false, 0),
            Orientation::FlipHorizontal => (true, 0),
            Orientation::Rotate180 => (false, 180),
            Orientation::FlipVertical => (true, 180),
            Orientation::Transpose => (true, 270),
            Orientation::Rotate90 => (false, 90),
            Orientation::Transverse => (true, 90),
            Orientation::Rotate270 => (false, 270),
        }
    }

    pub const ALL: [Orientation; 9] = [
        Orientation::Undefined,
        Orientation::Normal,
        Orientation::FlipHorizontal,
        Orientation::Rotate180,
        Orientation::FlipVertical,
        Orientation::Transpose,
        Orientation::Rotate90,
        Orientation::Transverse,
        Orientation::Rotate270,
    ];
}

// =============================================================================
// OrientationTransform
// =============================================================================

/// Maps sizes, rectangles and pixels between source and display space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrientationTransform {
    orientation: Orientation,
    flip_horizontal: bool,
    rotation: u16,
}

impl OrientationTransform {
    pub fn new(orientation: Orientation) -> Self {
        let (flip_horizontal, rotation) = orientation.decompose();
        Self {
            orientation,
            flip_horizontal,
            rotation,
        }
    }

    pub fn orientation(&self) -> Orientation {
        self.orientation
    }

    pub fn rotation(&self) -> u16 {
        self.rotation
    }

    pub fn is_flipped(&self) -> bool {
        self.flip_horizontal
    }

    pub fn is_identity(&self) -> bool {
        !self.flip_horizontal && self.rotation == 0
    }

    fn swaps_axes(&self) -> bool {
        self.rotation == 90 || self.rotation == 270
    }

    /// Size after the transform. Transposition is its own inverse, so
    /// `reverse` yields the same result; it is accepted for symmetry.
    pub fn apply_to_size(&self, size: IntSize, reverse: bool) -> IntSize {
        let _ = reverse;
        if self.swaps_axes() {
            size.transposed()
        } else {
            size
        }
    }

    /// Map `rect`, which lies within `containing_size`.
    ///
    /// Forward: `containing_size` is the source size, the result is in
    /// display space. Reverse: `containing_size` is the display size, the
    /// result is in source space.
    pub fn apply_to_rect(&self, rect: IntRect, containing_size: IntSize, reverse: bool) -> IntRect {
        if self.is_identity() {
            return rect;
        }
        if reverse {
            let unrotated = rotate_rect(rect, containing_size, (360 - self.rotation) % 360);
            let source_size = self.apply_to_size(containing_size, true);
            if self.flip_horizontal {
                flip_rect(unrotated, source_size)
            } else {
                unrotated
            }
        } else {
            let flipped = if self.flip_horizontal {
                flip_rect(rect, containing_size)
            } else {
                rect
            };
            rotate_rect(flipped, containing_size, self.rotation)
        }
    }

    /// Bake the transform into a new pixel buffer.
    ///
    /// Identity transforms hand back the same buffer without copying. The
    /// output is allocated from the input's pool when it has one, and the
    /// input storage is released once the copy is done.
    pub fn apply_to_pixels(&self, buffer: PixelBuffer, reverse: bool) -> PixelBuffer {
        if self.is_identity() {
            return buffer;
        }

        let in_size = buffer.size();
        let out_size = self.apply_to_size(in_size, reverse);
        let bpp = buffer.format().bytes_per_pixel();
        let mut out = buffer.sibling(out_size.width, out_size.height);

        let src = buffer.data();
        let dst = out.data_mut();
        if reverse {
            // Each display pixel comes from the forward image of its source position.
            for y in 0..out_size.height {
                for x in 0..out_size.width {
                    let (fx, fy) = self.map_pixel(x, y, out_size);
                    let from = pixel_offset(fx, fy, in_size.width, bpp);
                    let to = pixel_offset(x, y, out_size.width, bpp);
                    dst[to..to + bpp].copy_from_slice(&src[from..from + bpp]);
                }
            }
        } else {
            for y in 0..in_size.height {
                for x in 0..in_size.width {
                    let (tx, ty) = self.map_pixel(x, y, in_size);
                    let from = pixel_offset(x, y, in_size.width, bpp);
                    let to = pixel_offset(tx, ty, out_size.width, bpp);
                    dst[to..to + bpp].copy_from_slice(&src[from..from + bpp]);
                }
            }
        }

        out
    }

    /// Forward mapping of a pixel index inside a `size` image.
    fn map_pixel(&self, x: u32, y: u32, size: IntSize) -> (u32, u32) {
        let (w, h) = (size.width, size.height);
        let x = if self.flip_horizontal { w - 1 - x } else { x };
        match self.rotation {
            90 => (h - 1 - y, x),
            180 => (w - 1 - x, h - 1 - y),
            270 => (y, w - 1 - x),
            _ => (x, y),
        }
    }
}

impl Default for OrientationTransform {
    fn default() -> Self {
        Self::new(Orientation::Undefined)
    }
}

#[inline]
fn pixel_offset(x: u32, y: u32, width: u32, bpp: usize) -> usize {
    (y as usize * width as usize + x as usize) * bpp
}

fn flip_rect(rect: IntRect, size: IntSize) -> IntRect {
    let w = size.width;
    IntRect::new(
        w.saturating_sub(rect.right),
        rect.top,
        w.saturating_sub(rect.left),
        rect.bottom,
    )
}

/// Rotate `rect` clockwise inside a `size` area.
fn rotate_rect(rect: IntRect, size: IntSize, degrees: u16) -> IntRect {
    let (w, h) = (size.width, size.height);
    match degrees {
        90 => IntRect::new(
            h.saturating_sub(rect.bottom),
            rect.left,
            h.saturating_sub(rect.top),
            rect.right,
        ),
        180 => IntRect::new(
            w.saturating_sub(rect.right),
            h.saturating_sub(rect.bottom),
            w.saturating_sub(rect.left),
            h.saturating_sub(rect.top),
        ),
        270 => IntRect::new(
            rect.top,
            w.saturating_sub(rect.right),
            rect.bottom,
            w.saturating_sub(rect.left),
        ),
        _ => rect,
    }
}

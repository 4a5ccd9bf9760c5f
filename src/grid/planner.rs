//! Pure functions computing the sample-size pyramid, the per-level tile
//! grids and the image region to load for a viewport.

use crate::geometry::{IntRect, IntSize};

use super::tile_spec::{SampleSize, TileCoord, TileGridMap, TileSpec};

// =============================================================================
// Tile size and sample size selection
// =============================================================================

/// Preferred tile size for a viewport: half of it on each axis (rounded
/// down), so about four tiles cover one screen at native resolution.
pub fn preferred_tile_size(viewport_size: IntSize) -> IntSize {
    viewport_size.halved()
}

/// Whether a thumbnail has the aspect ratio of the full image, allowing one
/// thumbnail pixel of rounding on the height.
///
/// A thumbnail with a different aspect ratio (a cropped preview, say) cannot
/// be overlaid with tiles of the full image.
pub fn matches_aspect_ratio(image_size: IntSize, thumbnail_size: IntSize) -> bool {
    if image_size.is_empty() || thumbnail_size.is_empty() {
        return false;
    }
    let scale = image_size.width as f64 / thumbnail_size.width as f64;
    let expected_height = thumbnail_size.height as f64 * scale;
    (expected_height - image_size.height as f64).abs() <= scale.max(1.0) + 1.0
}

/// Whether subsampling can bring anything over the thumbnail: the image
/// must be larger than the thumbnail on at least one axis, with the same
/// aspect ratio.
pub fn can_use_subsampling(image_size: IntSize, thumbnail_size: IntSize) -> bool {
    matches_aspect_ratio(image_size, thumbnail_size)
        && (image_size.width > thumbnail_size.width || image_size.height > thumbnail_size.height)
}

/// Pick the sample size for the current zoom.
///
/// The thumbnail is displayed at `scale`, so each screen pixel covers
/// `image / (thumbnail * scale)` image pixels. The result is the largest
/// power of two not above that ratio on either axis: the decoded
/// resolution stays at or above the on-screen resolution, and an exact
/// match picks the coarser level.
///
/// Returns `None` when either size is empty or `scale` is not positive.
pub fn find_sample_size(image_size: IntSize, thumbnail_size: IntSize, scale: f32) -> Option<SampleSize> {
    if image_size.is_empty() || thumbnail_size.is_empty() || !(scale > 0.0) {
        return None;
    }
    let scale = scale as f64;
    let width_ratio = image_size.width as f64 / (thumbnail_size.width as f64 * scale);
    let height_ratio = image_size.height as f64 / (thumbnail_size.height as f64 * scale);
    Some(SampleSize::closest_power_of_two(width_ratio.min(height_ratio)))
}

// =============================================================================
// Grid construction
// =============================================================================

/// Number of `(cols, rows)` needed to cover the image at a sample size.
///
/// `cols = ceil(width / sample_size / tile_width)`, optionally clamped to
/// `max_grid`, and never below 1.
pub fn calculate_grid_size(
    image_size: IntSize,
    preferred_tile_size: IntSize,
    sample_size: SampleSize,
    max_grid: Option<(u32, u32)>,
) -> (u32, u32) {
    let count = |length: u32, tile: u32| -> u32 {
        let span = sample_size.get() as u64 * tile as u64;
        if span == 0 {
            return 1;
        }
        (length as u64).div_ceil(span).clamp(1, u32::MAX as u64) as u32
    };

    let mut cols = count(image_size.width, preferred_tile_size.width);
    let mut rows = count(image_size.height, preferred_tile_size.height);
    if let Some((max_cols, max_rows)) = max_grid {
        cols = cols.min(max_cols.max(1));
        rows = rows.min(max_rows.max(1));
    }
    (cols, rows)
}

/// Build the whole pyramid for an image.
///
/// Starting at full resolution, the sample size doubles until a level fits
/// in a single tile. Each level splits the image into `cols` x `rows`
/// rectangles of `width / cols` by `height / rows` pixels; the last column
/// and row take the remainder, so the tiles cover the image exactly.
pub fn calculate_tile_grid_map(
    image_size: IntSize,
    preferred_tile_size: IntSize,
    max_grid: Option<(u32, u32)>,
) -> TileGridMap {
    let mut map = TileGridMap::default();
    if image_size.is_empty() || preferred_tile_size.is_empty() {
        return map;
    }

    let mut sample_size = SampleSize::ONE;
    loop {
        let (cols, rows) = calculate_grid_size(image_size, preferred_tile_size, sample_size, max_grid);
        map.insert(
            sample_size,
            cols,
            rows,
            build_level(image_size, sample_size, cols, rows),
        );

        if cols == 1 && rows == 1 {
            break;
        }
        match sample_size.doubled() {
            Some(next) => sample_size = next,
            None => break,
        }
    }
    map
}

fn build_level(image_size: IntSize, sample_size: SampleSize, cols: u32, rows: u32) -> Vec<TileSpec> {
    // cols <= width holds because every tile spans at least one pixel
    let tile_width = image_size.width / cols;
    let tile_height = image_size.height / rows;

    let mut tiles = Vec::with_capacity(cols as usize * rows as usize);
    for row in 0..rows {
        let top = row * tile_height;
        let bottom = if row == rows - 1 {
            image_size.height
        } else {
            top + tile_height
        };
        for col in 0..cols {
            let left = col * tile_width;
            let right = if col == cols - 1 {
                image_size.width
            } else {
                left + tile_width
            };
            tiles.push(TileSpec {
                coordinate: TileCoord::new(col, row),
                src_rect: IntRect::new(left, top, right, bottom),
                sample_size,
            });
        }
    }
    tiles
}

// =============================================================================
// Load rectangle
// =============================================================================

/// Map the visible part of the content into image pixels and pad it by one
/// preferred tile on every side, clamped to the image bounds.
///
/// `content_size` is the size the viewport lays out (the thumbnail before
/// scaling) and `content_visible_rect` the part of it currently on screen.
/// Returns an empty rectangle if any input is empty.
pub fn calculate_image_load_rect(
    image_size: IntSize,
    content_size: IntSize,
    preferred_tile_size: IntSize,
    content_visible_rect: IntRect,
) -> IntRect {
    if image_size.is_empty()
        || content_size.is_empty()
        || preferred_tile_size.is_empty()
        || content_visible_rect.is_empty()
    {
        return IntRect::EMPTY;
    }

    let width_scale = image_size.width as f64 / content_size.width as f64;
    let height_scale = image_size.height as f64 / content_size.height as f64;

    let scale_floor = |value: u32, scale: f64| (value as f64 * scale).floor() as i64;
    let scale_ceil = |value: u32, scale: f64| (value as f64 * scale).ceil() as i64;

    let margin_x = preferred_tile_size.width as i64;
    let margin_y = preferred_tile_size.height as i64;
    let max_x = image_size.width as i64;
    let max_y = image_size.height as i64;

    let rect = IntRect::new(
        (scale_floor(content_visible_rect.left, width_scale) - margin_x).clamp(0, max_x) as u32,
        (scale_floor(content_visible_rect.top, height_scale) - margin_y).clamp(0, max_y) as u32,
        (scale_ceil(content_visible_rect.right, width_scale) + margin_x).clamp(0, max_x) as u32,
        (scale_ceil(content_visible_rect.bottom, height_scale) + margin_y).clamp(0, max_y) as u32,
    );
    if rect.is_empty() {
        IntRect::EMPTY
    } else {
        rect
    }
}

// =============================================================================
// Tests
// =============================================================================

//! Tile pyramid planning.
//!
//! The source image is covered by one tile grid per power-of-two sample
//! size. Sample size 1 is full resolution; every doubling halves the decoded
//! resolution, so fewer, cheaper tiles cover the same area.
//!
//! # Pyramid Structure
//!
//! ```text
//!  sample 4   ┌───────────┐        1 x 1
//!             │           │
//!             └───────────┘
//!  sample 2   ┌─────┬─────┐        2 x 2
//!             ├─────┼─────┤
//!             └─────┴─────┘
//!  sample 1   ┌──┬──┬──┬──┐        4 x 4
//!             ├──┼──┼──┼──┤
//!             ├──┼──┼──┼──┤
//!             └──┴──┴──┴──┘
//! ```
//!
//! Tile rectangles are always expressed in full-resolution image pixels;
//! the sample size only tells the decoder how much to scale down.
//!
//! Everything in this module is pure: no I/O, no shared state.

mod planner;
mod tile_spec;

pub use planner::{
    calculate_grid_size, calculate_image_load_rect, calculate_tile_grid_map, can_use_subsampling,
    find_sample_size, matches_aspect_ratio, preferred_tile_size,
};
pub use tile_spec::{SampleSize, TileCoord, TileGridMap, TileGridSizeMap, TileSpec};

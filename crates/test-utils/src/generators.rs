//! Generators for synthetic retrieval input.
//!
//! All rasters are `[time, channel, row, col]` arrays of normalized
//! brightness temperatures: valid values lie in [-1, 1] and missing pixels
//! hold [`SENTINEL`].

use std::ops::Range;

use ndarray::{s, Array4};

/// Value the input normalizer assigns to missing pixels.
pub const SENTINEL: f32 = -1.5;

/// Creates a raster with a smooth, position-dependent pattern.
///
/// Every pixel has a distinct value, which makes misplaced tiles easy to
/// spot after reassembly.
///
/// # Example
///
/// ```
/// use test_utils::gradient_raster;
///
/// let raster = gradient_raster(1, 1, 4, 6);
/// assert_eq!(raster.dim(), (1, 1, 4, 6));
/// assert!(raster.iter().all(|v| (-1.0..=1.0).contains(v)));
/// ```
pub fn gradient_raster(time: usize, channels: usize, rows: usize, cols: usize) -> Array4<f32> {
    let pixels = (rows * cols).max(2) as f32 - 1.0;
    Array4::from_shape_fn((time, channels, rows, cols), |(t, ch, r, c)| {
        let position = (r * cols + c) as f32 / pixels;
        let shift = 0.1 * ((t + ch) % 3) as f32;
        (2.0 * position - 1.0) * 0.8 + shift
    })
}

/// Creates a gradient raster with a block of missing pixels in all time
/// steps and channels.
pub fn raster_with_block(
    time: usize,
    channels: usize,
    rows: usize,
    cols: usize,
    block_rows: Range<usize>,
    block_cols: Range<usize>,
) -> Array4<f32> {
    let mut raster = gradient_raster(time, channels, rows, cols);
    raster
        .slice_mut(s![.., .., block_rows, block_cols])
        .fill(SENTINEL);
    raster
}

/// Creates a gradient raster with the given pixels set to missing.
pub fn raster_with_missing_pixels(
    time: usize,
    channels: usize,
    rows: usize,
    cols: usize,
    pixels: &[(usize, usize)],
) -> Array4<f32> {
    let mut raster = gradient_raster(time, channels, rows, cols);
    for &(r, c) in pixels {
        raster.slice_mut(s![.., .., r, c]).fill(SENTINEL);
    }
    raster
}

//! Detection of input regions too large to be inpainted by the model.
//!
//! The upstream normalizer encodes missing input pixels as -1.5 and maps
//! valid observations to [-1, 1]. Isolated missing pixels are tolerated, but
//! contiguous gaps are flagged so that the corresponding outputs are
//! reported as missing.

use image::{GrayImage, Luma};
use imageproc::distance_transform::Norm;
use imageproc::morphology;
use ndarray::{Array2, Array3, ArrayView2, ArrayView4, Axis, Zip};

use crate::error::Result;
use crate::padding::PaddingSpec;

/// Input values below this are treated as missing.
pub const MISSING_THRESHOLD: f32 = -1.4;

/// Width of the reflection border added before the closing.
const CLOSING_BORDER: usize = 8;

/// Radius of the closing, in cross-shaped steps.
const CLOSING_RADIUS: u8 = 8;

/// Compute the invalid mask for a `[batch, channel, row, col]` input tile.
///
/// Returns a `[batch, row, col]` mask that is `true` where the output must be
/// treated as missing.
pub fn invalid_mask(input: ArrayView4<'_, f32>) -> Result<Array3<bool>> {
    let (batch, _, rows, cols) = input.dim();
    let mut mask = Array3::from_elem((batch, rows, cols), true);

    let border = PaddingSpec {
        left: CLOSING_BORDER,
        right: CLOSING_BORDER,
        top: CLOSING_BORDER,
        bottom: CLOSING_BORDER,
    };

    for (sample, mut out) in input.outer_iter().zip(mask.outer_iter_mut()) {
        let present = sample.map_axis(Axis(0), |pixel| {
            pixel.iter().any(|&v| v > MISSING_THRESHOLD)
        });

        let padded = border.apply(&present)?;
        let closed = binary_closing(padded.view(), CLOSING_RADIUS);
        let cropped = border.crop(&closed)?;

        Zip::from(&mut out)
            .and(&cropped)
            .for_each(|invalid, &present| *invalid = !present);
    }

    Ok(mask)
}

/// Mark pixels where any input channel is missing, per time step.
///
/// Takes the full `[time, channel, row, col]` retrieval input and returns a
/// `[time, row, col]` mask.
pub fn inpainted_mask(input: ArrayView4<'_, f32>) -> Array3<bool> {
    let (time, _, rows, cols) = input.dim();
    Array3::from_shape_fn((time, rows, cols), |(t, r, c)| {
        input
            .slice(ndarray::s![t, .., r, c])
            .iter()
            .any(|&v| v < MISSING_THRESHOLD)
    })
}

/// Morphological closing with an L1 ball of radius `radius`, equivalent to
/// `radius` dilations followed by `radius` erosions with a 3x3 cross.
fn binary_closing(mask: ArrayView2<'_, bool>, radius: u8) -> Array2<bool> {
    let (rows, cols) = mask.dim();
    let gray = GrayImage::from_fn(cols as u32, rows as u32, |x, y| {
        Luma([if mask[[y as usize, x as usize]] { 255 } else { 0 }])
    });

    let closed = morphology::close(&gray, Norm::L1, radius);

    Array2::from_shape_fn((rows, cols), |(r, c)| {
        closed.get_pixel(c as u32, r as u32)[0] > 0
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{s, Array4};

    const SENTINEL: f32 = -1.5;

    fn valid_tile(rows: usize, cols: usize) -> Array4<f32> {
        Array4::from_shape_fn((1, 1, rows, cols), |(_, _, r, c)| {
            ((r + c) % 7) as f32 / 7.0
        })
    }

    #[test]
    fn test_isolated_missing_pixel_is_bridged() {
        let mut tile = valid_tile(64, 64);
        tile[[0, 0, 20, 33]] = SENTINEL;
        let mask = invalid_mask(tile.view()).unwrap();
        assert!(mask.iter().all(|&invalid| !invalid));
    }

    #[test]
    fn test_missing_block_is_flagged() {
        let mut tile = valid_tile(96, 96);
        tile.slice_mut(s![.., .., 32..64, 32..64]).fill(SENTINEL);
        let mask = invalid_mask(tile.view()).unwrap();

        assert!(mask[[0, 48, 48]]);
        assert!(mask[[0, 32, 48]]);
        assert!(mask[[0, 48, 63]]);
        assert!(mask[[0, 40, 40]]);
        assert!(!mask[[0, 10, 10]]);
        assert!(!mask[[0, 31, 48]]);
        assert!(!mask[[0, 48, 64]]);
        // Corners are rounded off by the closing.
        assert!(!mask[[0, 32, 32]]);
    }

    #[test]
    fn test_gap_bridging_depends_on_width() {
        // Vertical sentinel stripes spanning the whole tile.
        let mut narrow = valid_tile(64, 64);
        narrow.slice_mut(s![.., .., .., 20..36]).fill(SENTINEL);
        let mask = invalid_mask(narrow.view()).unwrap();
        assert!(mask.iter().all(|&invalid| !invalid));

        let mut wide = valid_tile(64, 64);
        wide.slice_mut(s![.., .., .., 20..38]).fill(SENTINEL);
        let mask = invalid_mask(wide.view()).unwrap();
        for row in [0, 31, 63] {
            assert!((20..38).all(|col| mask[[0, row, col]]));
            assert!(!mask[[0, row, 19]]);
            assert!(!mask[[0, row, 38]]);
        }
        assert_eq!(mask.iter().filter(|&&v| v).count(), 18 * 64);
    }

    #[test]
    fn test_all_missing_tile_is_invalid() {
        let tile = Array4::from_elem((2, 3, 40, 40), SENTINEL);
        let mask = invalid_mask(tile.view()).unwrap();
        assert_eq!(mask.dim(), (2, 40, 40));
        assert!(mask.iter().all(|&invalid| invalid));
    }

    #[test]
    fn test_any_channel_marks_pixel_present() {
        let mut tile = Array4::from_elem((1, 2, 32, 32), SENTINEL);
        tile.slice_mut(s![.., 1, .., ..]).fill(0.5);
        let mask = invalid_mask(tile.view()).unwrap();
        assert!(mask.iter().all(|&invalid| !invalid));
    }

    #[test]
    fn test_mask_is_computed_per_batch_element() {
        let mut tile = Array4::from_elem((2, 1, 32, 32), 0.0_f32);
        tile.slice_mut(s![1, .., .., ..]).fill(SENTINEL);
        let mask = invalid_mask(tile.view()).unwrap();
        assert!(mask.slice(s![0, .., ..]).iter().all(|&v| !v));
        assert!(mask.slice(s![1, .., ..]).iter().all(|&v| v));
    }

    #[test]
    fn test_inpainted_mask_marks_sentinel_pixels() {
        let mut input = valid_tile(8, 8);
        input[[0, 0, 3, 4]] = SENTINEL;
        let mask = inpainted_mask(input.view());
        assert_eq!(mask.dim(), (1, 8, 8));
        assert!(mask[[0, 3, 4]]);
        assert_eq!(mask.iter().filter(|&&v| v).count(), 1);
    }
}

//! Reflection padding of tiles to the spatial alignment the model requires.

use ndarray::{Array, ArrayBase, ArrayView, Axis, Data, Dimension, RemoveAxis, Slice};

use crate::error::{InferenceError, Result};

/// Spatial dimensions passed to the model must be multiples of this.
pub const ALIGNMENT: usize = 32;

/// Pixels added on each side of the two trailing axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PaddingSpec {
    pub left: usize,
    pub right: usize,
    pub top: usize,
    pub bottom: usize,
}

/// Padding that makes the two trailing dimensions of `shape` the smallest
/// multiples of `factor` not smaller than their current size.
///
/// Odd amounts put the extra pixel on the right/bottom.
pub fn calculate_padding(shape: &[usize], factor: usize) -> PaddingSpec {
    let nd = shape.len();
    if nd < 2 || factor == 0 {
        return PaddingSpec::default();
    }

    let missing = |n: usize| (factor - n % factor) % factor;
    let d_rows = missing(shape[nd - 2]);
    let d_cols = missing(shape[nd - 1]);

    PaddingSpec {
        left: d_cols / 2,
        right: d_cols - d_cols / 2,
        top: d_rows / 2,
        bottom: d_rows - d_rows / 2,
    }
}

impl PaddingSpec {
    pub fn is_empty(&self) -> bool {
        self.left == 0 && self.right == 0 && self.top == 0 && self.bottom == 0
    }

    /// Reflect-pad the two trailing axes of `array`. The edge pixel is not
    /// repeated, so `[a, b, c]` padded by two on the left becomes
    /// `[c, b, a, b, c]`.
    pub fn apply<A, S, D>(&self, array: &ArrayBase<S, D>) -> Result<Array<A, D>>
    where
        A: Clone,
        S: Data<Elem = A>,
        D: Dimension + RemoveAxis,
    {
        let nd = array.ndim();
        if nd < 2 {
            return Err(InferenceError::shape_mismatch(
                "padding requires two spatial dimensions",
            ));
        }

        let rows = array.shape()[nd - 2];
        let cols = array.shape()[nd - 1];
        let row_indices = reflect_indices(rows, self.top, self.bottom);
        let col_indices = reflect_indices(cols, self.left, self.right);

        let padded = array
            .select(Axis(nd - 2), &row_indices)
            .select(Axis(nd - 1), &col_indices);
        Ok(padded)
    }

    /// Remove the padding added by [`PaddingSpec::apply`].
    pub fn crop<'a, A, S, D>(&self, array: &'a ArrayBase<S, D>) -> Result<ArrayView<'a, A, D>>
    where
        S: Data<Elem = A>,
        D: Dimension,
    {
        let nd = array.ndim();
        if nd < 2 {
            return Err(InferenceError::shape_mismatch(
                "cropping requires two spatial dimensions",
            ));
        }
        let rows = array.shape()[nd - 2];
        let cols = array.shape()[nd - 1];
        if rows < self.top + self.bottom || cols < self.left + self.right {
            return Err(InferenceError::shape_mismatch(format!(
                "cannot remove {self:?} from an array of shape {:?}",
                array.shape()
            )));
        }

        let mut view = array.view();
        view.slice_axis_inplace(Axis(nd - 2), Slice::from(self.top..rows - self.bottom));
        view.slice_axis_inplace(Axis(nd - 1), Slice::from(self.left..cols - self.right));
        Ok(view)
    }
}

/// Source indices for an axis of length `n` reflect-padded by `before` and
/// `after` pixels.
fn reflect_indices(n: usize, before: usize, after: usize) -> Vec<usize> {
    let total = before + n + after;
    (0..total)
        .map(|k| reflect_index(k as isize - before as isize, n))
        .collect()
}

pub(crate) fn reflect_index(k: isize, n: usize) -> usize {
    if n <= 1 {
        return 0;
    }
    let period = 2 * (n as isize - 1);
    let m = k.rem_euclid(period);
    if m < n as isize {
        m as usize
    } else {
        (period - m) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array3};

    #[test]
    fn test_calculate_padding_aligned() {
        let padding = calculate_padding(&[1, 3, 512, 256], ALIGNMENT);
        assert!(padding.is_empty());
    }

    #[test]
    fn test_calculate_padding_splits_evenly() {
        let padding = calculate_padding(&[2, 100, 77], ALIGNMENT);
        // 100 -> 128, 77 -> 96
        assert_eq!(padding.top, 14);
        assert_eq!(padding.bottom, 14);
        assert_eq!(padding.left, 9);
        assert_eq!(padding.right, 10);
    }

    #[test]
    fn test_reflect_does_not_repeat_edge() {
        let a = array![[1, 2, 3]];
        let padding = PaddingSpec {
            left: 2,
            right: 2,
            top: 0,
            bottom: 0,
        };
        let padded = padding.apply(&a).unwrap();
        assert_eq!(padded, array![[3, 2, 1, 2, 3, 2, 1]]);
    }

    #[test]
    fn test_reflect_handles_padding_longer_than_axis() {
        assert_eq!(reflect_indices(3, 5, 0), vec![1, 0, 1, 2, 1, 0, 1, 2]);
        assert_eq!(reflect_indices(1, 2, 2), vec![0; 5]);
    }

    #[test]
    fn test_pad_then_crop_is_identity() {
        for &(rows, cols) in &[(5, 7), (33, 64), (100, 77), (1, 40)] {
            let tile = Array3::from_shape_fn((2, rows, cols), |(b, r, c)| {
                (b * 10_000 + r * 100 + c) as f32
            });
            let padding = calculate_padding(tile.shape(), ALIGNMENT);
            let padded = padding.apply(&tile).unwrap();
            assert_eq!(padded.shape()[1] % ALIGNMENT, 0);
            assert_eq!(padded.shape()[2] % ALIGNMENT, 0);
            let cropped = padding.crop(&padded).unwrap();
            assert_eq!(cropped, tile.view());
        }
    }

    #[test]
    fn test_crop_rejects_oversized_padding() {
        let a = Array3::<f32>::zeros((1, 4, 4));
        let padding = PaddingSpec {
            left: 3,
            right: 3,
            top: 0,
            bottom: 0,
        };
        assert!(padding.crop(&a).is_err());
    }
}

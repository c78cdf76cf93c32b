//! Overlapping tiling of oversized rasters and trim-and-stitch reassembly.
//!
//! Tiles are `tile_size` pixels long on both spatial axes and consecutive
//! tiles share `overlap` pixels. The last tile on an axis is anchored to the
//! far boundary so it keeps its full length. When columns wrap (global
//! longitude bands without a region of interest), the last column tile
//! instead continues past the far edge and picks up the leftmost columns.
//!
//! On assembly every tile contributes the part of its area that is closer
//! to its own center than to its neighbour's, so each output pixel is
//! written exactly once.

use ndarray::{Array, ArrayBase, ArrayD, Axis, Data, Dimension, IxDyn, RemoveAxis, Slice};
use tracing::debug;

use crate::error::{InferenceError, Result};

/// Tiling of a single spatial axis.
#[derive(Debug, Clone)]
struct AxisTiling {
    len: usize,
    tile_size: usize,
    starts: Vec<usize>,
    /// Tile `k` writes the output range `cuts[k]..cuts[k + 1]`.
    cuts: Vec<usize>,
}

impl AxisTiling {
    fn new(len: usize, tile_size: usize, overlap: usize, wrap: bool) -> Self {
        if len <= tile_size {
            return Self {
                len,
                tile_size: len,
                starts: vec![0],
                cuts: vec![0, len],
            };
        }

        let step = tile_size - overlap;
        let count = (len - overlap).div_ceil(step);
        let mut starts: Vec<usize> = (0..count).map(|k| k * step).collect();
        if !wrap {
            if let Some(last) = starts.last_mut() {
                *last = len - tile_size;
            }
        }

        let mut cuts = Vec::with_capacity(count + 1);
        cuts.push(0);
        for k in 1..count {
            let shared = starts[k - 1] + tile_size - starts[k];
            cuts.push(starts[k] + shared / 2);
        }
        cuts.push(len);

        Self {
            len,
            tile_size,
            starts,
            cuts,
        }
    }

    fn count(&self) -> usize {
        self.starts.len()
    }

    /// Indices of the source pixels for tile `k`, wrapping modulo `len`.
    fn indices(&self, k: usize) -> Vec<usize> {
        let start = self.starts[k];
        (start..start + self.tile_size).map(|p| p % self.len).collect()
    }

    fn wraps(&self, k: usize) -> bool {
        self.starts[k] + self.tile_size > self.len
    }

    /// Local range inside tile `k` and the matching global range.
    fn contribution(&self, k: usize) -> (std::ops::Range<usize>, std::ops::Range<usize>) {
        let start = self.starts[k];
        let (lo, hi) = (self.cuts[k], self.cuts[k + 1]);
        (lo - start..hi - start, lo..hi)
    }
}

/// Partitions a raster into overlapping tiles and reassembles tile results.
#[derive(Debug, Clone)]
pub struct Tiler {
    rows: AxisTiling,
    cols: AxisTiling,
    overlap: usize,
}

impl Tiler {
    /// Create a tiler for a raster with the given spatial shape.
    pub fn new(
        rows: usize,
        cols: usize,
        tile_size: usize,
        overlap: usize,
        wrap_columns: bool,
    ) -> Result<Self> {
        if tile_size == 0 {
            return Err(InferenceError::InvalidTiling(
                "tile_size must be positive".to_string(),
            ));
        }
        if overlap >= tile_size {
            return Err(InferenceError::InvalidTiling(format!(
                "overlap ({overlap}) must be smaller than tile_size ({tile_size})"
            )));
        }
        if rows == 0 || cols == 0 {
            return Err(InferenceError::InvalidTiling(format!(
                "cannot tile an empty raster ({rows}x{cols})"
            )));
        }

        let tiler = Self {
            rows: AxisTiling::new(rows, tile_size, overlap, false),
            cols: AxisTiling::new(cols, tile_size, overlap, wrap_columns),
            overlap,
        };

        debug!(
            rows,
            cols,
            tile_size,
            overlap,
            wrap_columns,
            tiles_m = tiler.rows.count(),
            tiles_n = tiler.cols.count(),
            "Created tiler"
        );

        Ok(tiler)
    }

    /// Number of tiles along the row and column axes.
    pub fn tile_count(&self) -> (usize, usize) {
        (self.rows.count(), self.cols.count())
    }

    /// Spatial shape of the tiled raster.
    pub fn shape(&self) -> (usize, usize) {
        (self.rows.len, self.cols.len)
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    /// First row and column of tile `(i, j)` in raster coordinates.
    pub fn tile_origin(&self, i: usize, j: usize) -> Result<(usize, usize)> {
        self.check_index(i, j)?;
        Ok((self.rows.starts[i], self.cols.starts[j]))
    }

    fn check_index(&self, i: usize, j: usize) -> Result<()> {
        let (m, n) = self.tile_count();
        if i >= m || j >= n {
            return Err(InferenceError::TileIndexOutOfBounds {
                i,
                j,
                rows: m,
                cols: n,
            });
        }
        Ok(())
    }

    /// Extract tile `(i, j)` from an array whose two trailing axes match the
    /// tiled shape. Leading axes are carried through unchanged.
    pub fn get_tile<A, S, D>(&self, array: &ArrayBase<S, D>, i: usize, j: usize) -> Result<Array<A, D>>
    where
        A: Clone,
        S: Data<Elem = A>,
        D: Dimension + RemoveAxis,
    {
        self.check_index(i, j)?;
        let (row_axis, col_axis) = self.spatial_axes(array.shape())?;

        let row_start = self.rows.starts[i];
        let rows = array.slice_axis(
            Axis(row_axis),
            Slice::from(row_start..row_start + self.rows.tile_size),
        );

        let tile = if self.cols.wraps(j) {
            rows.select(Axis(col_axis), &self.cols.indices(j))
        } else {
            let col_start = self.cols.starts[j];
            rows.slice_axis(
                Axis(col_axis),
                Slice::from(col_start..col_start + self.cols.tile_size),
            )
            .to_owned()
        };
        Ok(tile)
    }

    /// Stitch per-tile results into a full-size array.
    ///
    /// All tiles must share the same leading shape and cover exactly one
    /// tile on the spatial axes.
    pub fn assemble<A>(&self, tiles: &TileGrid<ArrayD<A>>) -> Result<ArrayD<A>>
    where
        A: Clone + Default,
    {
        let (m, n) = self.tile_count();
        if tiles.dims() != (m, n) {
            return Err(InferenceError::shape_mismatch(format!(
                "tile grid is {}x{} but the tiler expects {}x{}",
                tiles.dims().0,
                tiles.dims().1,
                m,
                n
            )));
        }

        let first = tiles
            .get(0, 0)
            .ok_or(InferenceError::IncompleteTileGrid { i: 0, j: 0 })?;
        if first.ndim() < 2 {
            return Err(InferenceError::shape_mismatch(
                "tile results need at least two spatial dimensions",
            ));
        }
        let nd = first.ndim();
        let leading = &first.shape()[..nd - 2];

        let mut out_shape = leading.to_vec();
        out_shape.push(self.rows.len);
        out_shape.push(self.cols.len);
        let mut output = ArrayD::from_elem(IxDyn(&out_shape), A::default());

        let mut tile_shape = leading.to_vec();
        tile_shape.push(self.rows.tile_size);
        tile_shape.push(self.cols.tile_size);

        for i in 0..m {
            let (local_rows, global_rows) = self.rows.contribution(i);
            for j in 0..n {
                let tile = tiles
                    .get(i, j)
                    .ok_or(InferenceError::IncompleteTileGrid { i, j })?;
                if tile.shape() != tile_shape.as_slice() {
                    return Err(InferenceError::shape_mismatch(format!(
                        "tile ({i}, {j}) has shape {:?}, expected {:?}",
                        tile.shape(),
                        tile_shape
                    )));
                }
                let (local_cols, global_cols) = self.cols.contribution(j);

                let mut src = tile.view();
                src.slice_axis_inplace(Axis(nd - 2), Slice::from(local_rows.clone()));
                src.slice_axis_inplace(Axis(nd - 1), Slice::from(local_cols));

                let mut dst = output.view_mut();
                dst.slice_axis_inplace(Axis(nd - 2), Slice::from(global_rows.clone()));
                dst.slice_axis_inplace(Axis(nd - 1), Slice::from(global_cols));
                dst.assign(&src);
            }
        }

        Ok(output)
    }

    fn spatial_axes(&self, shape: &[usize]) -> Result<(usize, usize)> {
        let nd = shape.len();
        if nd < 2 || shape[nd - 2] != self.rows.len || shape[nd - 1] != self.cols.len {
            return Err(InferenceError::shape_mismatch(format!(
                "array of shape {:?} does not match tiled shape ({}, {})",
                shape, self.rows.len, self.cols.len
            )));
        }
        Ok((nd - 2, nd - 1))
    }
}

/// Fixed-size `M x N` container of per-tile results, written by explicit
/// `(i, j)` index.
#[derive(Debug, Clone)]
pub struct TileGrid<T> {
    rows: usize,
    cols: usize,
    cells: Vec<Option<T>>,
}

impl<T> TileGrid<T> {
    pub fn new(rows: usize, cols: usize) -> Self {
        let mut cells = Vec::with_capacity(rows * cols);
        cells.resize_with(rows * cols, || None);
        Self { rows, cols, cells }
    }

    pub fn dims(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Record the result for tile `(i, j)`, replacing any previous value.
    pub fn set(&mut self, i: usize, j: usize, value: T) -> Result<()> {
        if i >= self.rows || j >= self.cols {
            return Err(InferenceError::TileIndexOutOfBounds {
                i,
                j,
                rows: self.rows,
                cols: self.cols,
            });
        }
        self.cells[i * self.cols + j] = Some(value);
        Ok(())
    }

    pub fn get(&self, i: usize, j: usize) -> Option<&T> {
        if i >= self.rows || j >= self.cols {
            return None;
        }
        self.cells[i * self.cols + j].as_ref()
    }

    pub fn is_complete(&self) -> bool {
        self.cells.iter().all(Option::is_some)
    }
}

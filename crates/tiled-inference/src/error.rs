//! Error types for tiled inference.

use thiserror::Error;

/// Errors that can occur while tiling a raster, running the model or
/// writing the assembled results.
#[derive(Error, Debug)]
pub enum InferenceError {
    /// The tiling parameters cannot cover the raster.
    #[error("invalid tiling: {0}")]
    InvalidTiling(String),

    /// A tile was requested outside of the tile grid.
    #[error("tile ({i}, {j}) is outside of the {rows}x{cols} tile grid")]
    TileIndexOutOfBounds {
        i: usize,
        j: usize,
        rows: usize,
        cols: usize,
    },

    /// Assembly was attempted before every tile result was recorded.
    #[error("tile grid is incomplete: no result for tile ({i}, {j})")]
    IncompleteTileGrid { i: usize, j: usize },

    /// An array did not have the expected shape.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// The model did not produce an output required by a target.
    #[error("model output '{0}' not found")]
    MissingOutput(String),

    /// The predictor failed.
    #[error("predictor error: {0}")]
    Predictor(String),

    /// The retrieval settings are inconsistent.
    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    /// Writing results failed.
    #[error("storage error: {0}")]
    StorageError(String),

    #[error("array shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl InferenceError {
    /// Create a ShapeMismatch error.
    pub fn shape_mismatch(msg: impl Into<String>) -> Self {
        Self::ShapeMismatch(msg.into())
    }

    /// Create a Predictor error.
    pub fn predictor(msg: impl Into<String>) -> Self {
        Self::Predictor(msg.into())
    }

    /// Create a StorageError.
    pub fn storage_error(msg: impl Into<String>) -> Self {
        Self::StorageError(msg.into())
    }

    /// Create an InvalidSettings error.
    pub fn invalid_settings(msg: impl Into<String>) -> Self {
        Self::InvalidSettings(msg.into())
    }
}

/// Result type for tiled inference operations.
pub type Result<T> = std::result::Result<T, InferenceError>;

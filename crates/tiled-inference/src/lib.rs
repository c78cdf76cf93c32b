//! Tiled neural-network inference over oversized geophysical rasters.
//!
//! Satellite brightness-temperature fields can span the full globe and are
//! far too large to be passed through the retrieval network at once. This
//! crate splits them into overlapping tiles, pads each tile to the alignment
//! the network needs, flags large gaps in the input, derives posterior
//! statistics for every requested target and stitches the tiles back into
//! seamless result fields.
//!
//! # Architecture
//!
//! ```text
//! retrieval input [time, channel, lat, lon]
//!      │
//!      ▼
//! Tiler::get_tile(i, j) ──► PaddingSpec::apply ──► Predictor::predict
//!      │                                                │
//!      │                        PaddingSpec::crop ◄─────┘
//!      ▼                               │
//! invalid_mask(tile) ──────────► aggregate_tile (per target)
//!                                      │
//!                                      ▼
//!                           TileGrid[(i, j)] per variable
//!                                      │
//!                                      ▼
//!                    Tiler::assemble ──► RetrievalResults ──► ZarrWriter
//! ```
//!
//! # Example
//!
//! ```ignore
//! use tiled_inference::{process_input_file, RetrievalSettings, ZarrWriter};
//!
//! let settings = RetrievalSettings::from_env();
//! let results = process_input_file(&mut model, &reader, &settings)?;
//! ZarrWriter::new(settings.output.clone()).write(&output_path, &results)?;
//! ```

pub mod config;
pub mod dataset;
pub mod driver;
pub mod encoding;
pub mod error;
pub mod input;
pub mod invalid;
pub mod padding;
pub mod predictor;
pub mod targets;
pub mod tiler;
pub mod writer;

// Re-export commonly used types at crate root
pub use config::{Precision, RegionOfInterest, RetrievalSettings, ZarrCompression, ZarrOutputConfig};
pub use dataset::{altitude_levels, FieldSummary, RetrievalResults, Variable, VariableData};
pub use driver::{process_input, process_input_file};
pub use encoding::{encoding_for, Encoding, LogBins};
pub use error::{InferenceError, Result};
pub use input::{Coordinates, InputReader};
pub use invalid::{inpainted_mask, invalid_mask, MISSING_THRESHOLD};
pub use padding::{calculate_padding, PaddingSpec, ALIGNMENT};
pub use predictor::{ModelOutput, Predictor};
pub use targets::{determine_cloud_class, Target, TargetDescriptor};
pub use tiler::{TileGrid, Tiler};
pub use writer::{output_filename, ZarrWriteResult, ZarrWriter};

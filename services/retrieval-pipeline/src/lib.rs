//! Operational processing of cloud retrievals.
//!
//! Input files are acquired by a download stage and handed through a bounded
//! queue to a process stage that runs the tiled inference driver, writes the
//! results and records every attempt in a SQLite processing log.

pub mod config;
pub mod error;
pub mod log_capture;
pub mod logging;
pub mod pipeline;
pub mod processing_log;
pub mod retrieval;
pub mod sources;

pub use config::PipelineConfig;
pub use error::ConfigurationError;
pub use log_capture::{CaptureGuard, CaptureLayer, LogCapture};
pub use pipeline::{
    DayOutput, DayProcessor, DownloadReport, Pipeline, PipelineHandle, PipelineReport,
    ProcessReport, WorkItem,
};
pub use processing_log::{FileState, LogEntry, ProcessingLog, ProcessingStats};
pub use retrieval::{run_from_config, FileRetrieval};
pub use sources::{get_input_files, BoxedReader, InputFile, InputSource, RemoteFile};

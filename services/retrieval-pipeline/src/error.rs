//! Fatal configuration errors.
//!
//! Everything else in the service is an `anyhow::Error` that the pipeline
//! stages log and count. A `ConfigurationError` means required runtime
//! context is missing and is never retried.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error(
        "a working directory must be provided either when the remote file is created \
         or when it is fetched"
    )]
    MissingWorkingDirectory,

    #[error("configuration file not found: {0}")]
    MissingConfig(PathBuf),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

//! Tracing subscriber setup.

use anyhow::Result;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::log_capture::LogCapture;

/// Install the global subscriber: an `EnvFilter` (`RUST_LOG`, falling back
/// to `level`) and the console formatter. Runs that store per-file logs in
/// the processing log pass the [`LogCapture`] handed to the pipeline.
pub fn init_tracing(level: &str, json: bool, capture: Option<&LogCapture>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(capture.map(LogCapture::layer));

    if json {
        registry
            .with(fmt::layer().json().with_target(true))
            .try_init()?;
    } else {
        registry.with(fmt::layer().with_target(true)).try_init()?;
    }

    Ok(())
}

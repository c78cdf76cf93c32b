//! Pipeline configuration loaded from YAML.
//!
//! ```yaml
//! output_dir: /data/ccic
//! working_dir: /tmp/ccic-input
//! prefetch: true
//! queue_capacity: 4
//! retrieval:
//!   tile_size: 512
//!   overlap: 128
//!   targets: [tiwp, tiwc, cloud_type]
//!   database_path: /data/ccic/processing.db
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tiled_inference::RetrievalSettings;
use tracing::debug;

use crate::error::ConfigurationError;

/// Default capacity of the queue between the download and process stages.
pub const DEFAULT_QUEUE_CAPACITY: usize = 4;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Settings passed to the tiled inference driver.
    #[serde(default)]
    pub retrieval: RetrievalSettings,

    /// Directory receiving the retrieval output files.
    pub output_dir: PathBuf,

    /// Directory for downloaded input files.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Local directory to search for input files instead of downloading.
    #[serde(default)]
    pub input_path: Option<PathBuf>,

    /// Start downloading remote input files as soon as they are listed.
    #[serde(default)]
    pub prefetch: bool,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

impl PipelineConfig {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            retrieval: RetrievalSettings::default(),
            output_dir: output_dir.into(),
            working_dir: None,
            input_path: None,
            prefetch: false,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    /// Load the configuration from a YAML file and apply environment
    /// overrides to the retrieval settings.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ConfigurationError::MissingConfig(path.to_path_buf()).into());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let mut config: PipelineConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.retrieval = config.retrieval.with_env_overrides();
        config.validate()?;

        debug!(path = %path.display(), "Loaded pipeline config");
        Ok(config)
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigurationError> {
        if self.queue_capacity == 0 {
            return Err(ConfigurationError::Invalid(
                "queue_capacity must be > 0".to_string(),
            ));
        }
        self.retrieval
            .validate()
            .map_err(|e| ConfigurationError::Invalid(e.to_string()))?;
        self.retrieval
            .output
            .validate()
            .map_err(|e| ConfigurationError::Invalid(e.to_string()))?;
        Ok(())
    }
}

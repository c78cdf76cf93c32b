//! Retrieval settings.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{InferenceError, Result};
use crate::targets::Target;

/// Numerical precision used for the model forward pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    /// 32-bit floating point.
    #[default]
    Single,
    /// Reduced-precision execution mode.
    Half,
}

impl Precision {
    /// Parse from string (case-insensitive). Accepts the bit width as well.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "single" | "32" | "f32" => Some(Self::Single),
            "half" | "16" | "f16" => Some(Self::Half),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Half => "half",
        }
    }
}

/// Geographic bounding box restricting the retrieval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegionOfInterest {
    pub lon_min: f64,
    pub lat_min: f64,
    pub lon_max: f64,
    pub lat_max: f64,
}

impl RegionOfInterest {
    pub fn new(lon_min: f64, lat_min: f64, lon_max: f64, lat_max: f64) -> Self {
        Self {
            lon_min,
            lat_min,
            lon_max,
            lat_max,
        }
    }

    /// Parse `lon_min,lat_min,lon_max,lat_max`.
    pub fn parse(s: &str) -> Option<Self> {
        let parts: Vec<f64> = s
            .split(',')
            .map(|p| p.trim().parse::<f64>())
            .collect::<std::result::Result<_, _>>()
            .ok()?;
        match parts.as_slice() {
            [lon_min, lat_min, lon_max, lat_max] => {
                Some(Self::new(*lon_min, *lat_min, *lon_max, *lat_max))
            }
            _ => None,
        }
    }

    pub fn contains(&self, lon: f64, lat: f64) -> bool {
        lon >= self.lon_min && lon <= self.lon_max && lat >= self.lat_min && lat <= self.lat_max
    }
}

/// Settings controlling a single retrieval run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalSettings {
    /// Side length of the square tiles passed to the model.
    pub tile_size: usize,

    /// Number of pixels shared by neighbouring tiles.
    pub overlap: usize,

    /// Targets to retrieve.
    pub targets: Vec<Target>,

    /// Optional region of interest. Setting one disables column wrapping.
    pub roi: Option<RegionOfInterest>,

    /// Compute device handed to the predictor.
    pub device: String,

    pub precision: Precision,

    /// SQLite database used as processing log. `None` disables the log.
    pub database_path: Option<PathBuf>,

    /// Record which output pixels stem from missing input pixels.
    pub inpainted_mask: bool,

    /// Confidence level of the reported confidence intervals.
    pub confidence_interval: f32,

    /// Zarr output options.
    pub output: ZarrOutputConfig,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            tile_size: 512,
            overlap: 128,
            targets: Target::ALL.to_vec(),
            roi: None,
            device: "cpu".to_string(),
            precision: Precision::Single,
            database_path: Some(PathBuf::from("ccic_processing.db")),
            inpainted_mask: false,
            confidence_interval: 0.9,
            output: ZarrOutputConfig::default(),
        }
    }
}

impl RetrievalSettings {
    /// Load settings from environment variables on top of the defaults.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Apply environment variable overrides to these settings.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(val) = std::env::var("RETRIEVAL_TILE_SIZE") {
            if let Ok(size) = val.parse() {
                self.tile_size = size;
            }
        }

        if let Ok(val) = std::env::var("RETRIEVAL_OVERLAP") {
            if let Ok(overlap) = val.parse() {
                self.overlap = overlap;
            }
        }

        if let Ok(val) = std::env::var("RETRIEVAL_TARGETS") {
            let targets: Vec<Target> = val
                .split(',')
                .filter_map(|name| Target::from_name(name.trim()))
                .collect();
            if !targets.is_empty() {
                self.targets = targets;
            }
        }

        if let Ok(val) = std::env::var("RETRIEVAL_ROI") {
            self.roi = RegionOfInterest::parse(&val);
        }

        if let Ok(val) = std::env::var("RETRIEVAL_DEVICE") {
            self.device = val;
        }

        if let Ok(val) = std::env::var("RETRIEVAL_PRECISION") {
            if let Some(precision) = Precision::from_str(&val) {
                self.precision = precision;
            }
        }

        if let Ok(val) = std::env::var("PROCESSING_DATABASE") {
            self.database_path = if val.is_empty() || val.eq_ignore_ascii_case("none") {
                None
            } else {
                Some(PathBuf::from(val))
            };
        }

        if let Ok(val) = std::env::var("RETRIEVAL_INPAINTED_MASK") {
            self.inpainted_mask = val.to_lowercase() == "true" || val == "1";
        }

        if let Ok(val) = std::env::var("RETRIEVAL_CONFIDENCE_INTERVAL") {
            if let Ok(ci) = val.parse() {
                self.confidence_interval = ci;
            }
        }

        self.output = self.output.with_env_overrides();
        self
    }

    /// Validate the settings.
    pub fn validate(&self) -> Result<()> {
        if self.tile_size == 0 {
            return Err(InferenceError::invalid_settings("tile_size must be > 0"));
        }

        if self.overlap >= self.tile_size {
            return Err(InferenceError::invalid_settings(format!(
                "overlap ({}) must be smaller than tile_size ({})",
                self.overlap, self.tile_size
            )));
        }

        if self.targets.is_empty() {
            return Err(InferenceError::invalid_settings(
                "at least one target must be requested",
            ));
        }

        if !(self.confidence_interval > 0.0 && self.confidence_interval < 1.0) {
            return Err(InferenceError::invalid_settings(format!(
                "confidence_interval must be in (0, 1), got {}",
                self.confidence_interval
            )));
        }

        if let Some(roi) = &self.roi {
            if roi.lon_min >= roi.lon_max || roi.lat_min >= roi.lat_max {
                return Err(InferenceError::invalid_settings(format!(
                    "degenerate region of interest: {roi:?}"
                )));
            }
        }

        self.output.validate()
    }

    /// Whether the column axis is treated as periodic.
    pub fn wrap_columns(&self) -> bool {
        self.roi.is_none()
    }

    /// Lower and upper quantile of the confidence interval.
    pub fn interval_quantiles(&self) -> [f32; 2] {
        let tail = 0.5 * (1.0 - self.confidence_interval);
        [tail, 1.0 - tail]
    }
}

/// Compression codec for Zarr output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZarrCompression {
    None,
    #[default]
    BloscLz4,
    BloscZstd,
}

impl ZarrCompression {
    /// Parse from string (case-insensitive).
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "none" => Self::None,
            "blosc_zstd" | "zstd" => Self::BloscZstd,
            _ => Self::BloscLz4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::BloscLz4 => "blosc_lz4",
            Self::BloscZstd => "blosc_zstd",
        }
    }
}

impl std::fmt::Display for ZarrCompression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Layout and compression of Zarr output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ZarrOutputConfig {
    /// Chunk length along the latitude and longitude dimensions.
    pub chunk_size: usize,

    pub compression: ZarrCompression,

    /// Compression level (1-9).
    pub compression_level: u8,
}

impl Default for ZarrOutputConfig {
    fn default() -> Self {
        Self {
            chunk_size: 512,
            compression: ZarrCompression::BloscLz4,
            compression_level: 9,
        }
    }
}

impl ZarrOutputConfig {
    fn with_env_overrides(mut self) -> Self {
        if let Ok(val) = std::env::var("ZARR_CHUNK_SIZE") {
            if let Ok(size) = val.parse() {
                self.chunk_size = size;
            }
        }

        if let Ok(val) = std::env::var("ZARR_COMPRESSION") {
            self.compression = ZarrCompression::from_str(&val);
        }

        if let Ok(val) = std::env::var("ZARR_COMPRESSION_LEVEL") {
            if let Ok(level) = val.parse() {
                self.compression_level = level;
            }
        }

        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(InferenceError::invalid_settings("chunk_size must be > 0"));
        }

        if self.compression_level == 0 || self.compression_level > 9 {
            return Err(InferenceError::invalid_settings(
                "compression_level must be 1-9",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = RetrievalSettings::default();
        assert_eq!(settings.tile_size, 512);
        assert_eq!(settings.overlap, 128);
        assert_eq!(settings.targets.len(), Target::ALL.len());
        assert_eq!(settings.device, "cpu");
        assert_eq!(settings.precision, Precision::Single);
        assert_eq!(
            settings.database_path,
            Some(PathBuf::from("ccic_processing.db"))
        );
        assert!(settings.wrap_columns());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_interval_quantiles() {
        let settings = RetrievalSettings::default();
        let [low, high] = settings.interval_quantiles();
        assert!((low - 0.05).abs() < 1e-6);
        assert!((high - 0.95).abs() < 1e-6);
    }

    #[test]
    fn test_validate_rejects_bad_overlap() {
        let settings = RetrievalSettings {
            tile_size: 256,
            overlap: 256,
            ..Default::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(InferenceError::InvalidSettings(_))
        ));
    }

    #[test]
    fn test_validate_rejects_bad_confidence() {
        let settings = RetrievalSettings {
            confidence_interval: 1.0,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_roi_disables_wrapping() {
        let settings = RetrievalSettings {
            roi: RegionOfInterest::parse("-10, 30, 20, 60"),
            ..Default::default()
        };
        assert!(!settings.wrap_columns());
        let roi = settings.roi.unwrap();
        assert!(roi.contains(0.0, 45.0));
        assert!(!roi.contains(25.0, 45.0));
    }

    #[test]
    fn test_roi_parse_rejects_garbage() {
        assert!(RegionOfInterest::parse("1,2,3").is_none());
        assert!(RegionOfInterest::parse("a,b,c,d").is_none());
    }

    #[test]
    fn test_settings_from_partial_json() {
        let settings: RetrievalSettings =
            serde_json::from_str(r#"{"tile_size": 256, "targets": ["tiwp", "cloud_type"], "precision": "half"}"#)
                .unwrap();
        assert_eq!(settings.tile_size, 256);
        assert_eq!(settings.overlap, 128);
        assert_eq!(settings.targets, vec![Target::Tiwp, Target::CloudType]);
        assert_eq!(settings.precision, Precision::Half);
    }
}

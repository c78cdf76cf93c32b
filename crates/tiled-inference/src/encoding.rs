//! Per-variable on-disk encodings.
//!
//! Probabilities are stored as `uint8` scaled by 1/250. Quantities spanning
//! several orders of magnitude are quantized into logarithmically spaced
//! bins. In both cases 255 marks missing values.

use ndarray::ArrayD;
use serde_json::{json, Map, Value};

use crate::dataset::VariableData;
use crate::error::{InferenceError, Result};

/// Fill value of all `uint8` encodings.
pub const UINT8_FILL: u8 = 255;

/// Scale factor of encoded probabilities.
pub const PROBABILITY_SCALE: f32 = 1.0 / 250.0;

/// Number of bins available for values inside the range.
const LOG_BIN_COUNT: f32 = 254.0;

/// Logarithmic binning of the range `[low, high]` into the codes `1..=254`.
/// Code 0 holds values below `low`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LogBins {
    pub low: f32,
    pub high: f32,
}

impl LogBins {
    pub const fn new(low: f32, high: f32) -> Self {
        Self { low, high }
    }

    pub fn encode(&self, value: f32) -> u8 {
        if value.is_nan() {
            return UINT8_FILL;
        }
        if value < self.low {
            return 0;
        }
        let position = (value / self.low).ln() / (self.high / self.low).ln();
        let bin = 1.0 + (position * LOG_BIN_COUNT).floor();
        bin.clamp(1.0, LOG_BIN_COUNT) as u8
    }

    /// Geometric center of the bin.
    pub fn decode(&self, code: u8) -> f32 {
        match code {
            0 => 0.0,
            UINT8_FILL => f32::NAN,
            k => {
                let position = (k as f32 - 0.5) / LOG_BIN_COUNT;
                self.low * (self.high / self.low).powf(position)
            }
        }
    }
}

/// How a variable is stored.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Encoding {
    Float32,
    ScaledUInt8 { scale: f32, fill: u8 },
    UInt8 { fill: u8 },
    LogBins(LogBins),
}

/// Encoded array ready to be written.
#[derive(Debug, Clone, PartialEq)]
pub enum EncodedData {
    Float32(ArrayD<f32>),
    UInt8(ArrayD<u8>),
}

impl EncodedData {
    pub fn shape(&self) -> &[usize] {
        match self {
            Self::Float32(a) => a.shape(),
            Self::UInt8(a) => a.shape(),
        }
    }
}

const ICE_WATER_PATH_BINS: LogBins = LogBins::new(1e-3, 1e2);
const ICE_WATER_CONTENT_BINS: LogBins = LogBins::new(1e-4, 1e2);

/// Encoding used for the output variable `name`.
pub fn encoding_for(name: &str) -> Encoding {
    match name {
        "tiwp" | "tiwp_ci" | "tiwp_fpavg" | "tiwp_fpavg_ci" => Encoding::LogBins(ICE_WATER_PATH_BINS),
        "tiwc" => Encoding::LogBins(ICE_WATER_CONTENT_BINS),
        "p_tiwp" | "p_tiwp_fpavg" | "cloud_prob_2d" | "cloud_prob_3d" => Encoding::ScaledUInt8 {
            scale: PROBABILITY_SCALE,
            fill: UINT8_FILL,
        },
        "cloud_type" | "inpainted" => Encoding::UInt8 { fill: UINT8_FILL },
        _ => Encoding::Float32,
    }
}

impl Encoding {
    pub fn encode(&self, data: &VariableData) -> Result<EncodedData> {
        match (self, data) {
            (Encoding::Float32, VariableData::Float32(a)) => Ok(EncodedData::Float32(a.clone())),
            (Encoding::ScaledUInt8 { scale, fill }, VariableData::Float32(a)) => {
                let max = (*fill as f32 - 1.0).max(0.0);
                Ok(EncodedData::UInt8(a.mapv(|v| {
                    if v.is_nan() {
                        *fill
                    } else {
                        (v / scale).round().clamp(0.0, max) as u8
                    }
                })))
            }
            (Encoding::LogBins(bins), VariableData::Float32(a)) => {
                Ok(EncodedData::UInt8(a.mapv(|v| bins.encode(v))))
            }
            (Encoding::UInt8 { .. }, VariableData::UInt8(a)) => Ok(EncodedData::UInt8(a.clone())),
            (Encoding::UInt8 { .. }, VariableData::Bool(a)) => {
                Ok(EncodedData::UInt8(a.mapv(u8::from)))
            }
            (Encoding::Float32, VariableData::UInt8(a)) => Ok(EncodedData::UInt8(a.clone())),
            (Encoding::Float32, VariableData::Bool(a)) => Ok(EncodedData::UInt8(a.mapv(u8::from))),
            (encoding, data) => Err(InferenceError::storage_error(format!(
                "cannot apply {encoding:?} to {} data",
                data.dtype_name()
            ))),
        }
    }

    /// Attributes describing how to decode the stored values.
    pub fn attributes(&self) -> Map<String, Value> {
        let mut attrs = Map::new();
        match self {
            Encoding::Float32 => {}
            Encoding::ScaledUInt8 { scale, fill } => {
                attrs.insert("scale_factor".to_string(), json!(scale));
                attrs.insert("_FillValue".to_string(), json!(fill));
            }
            Encoding::UInt8 { fill } => {
                attrs.insert("_FillValue".to_string(), json!(fill));
            }
            Encoding::LogBins(bins) => {
                attrs.insert("encoding".to_string(), json!("log_bins"));
                attrs.insert("log_bins_low".to_string(), json!(bins.low));
                attrs.insert("log_bins_high".to_string(), json!(bins.high));
                attrs.insert("_FillValue".to_string(), json!(UINT8_FILL));
            }
        }
        attrs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_log_bins_edges() {
        let bins = ICE_WATER_PATH_BINS;
        assert_eq!(bins.encode(f32::NAN), 255);
        assert_eq!(bins.encode(0.0), 0);
        assert_eq!(bins.encode(5e-4), 0);
        assert_eq!(bins.encode(1e-3), 1);
        assert_eq!(bins.encode(1e2), 254);
        assert_eq!(bins.encode(1e5), 254);
        assert_eq!(bins.decode(0), 0.0);
        assert!(bins.decode(255).is_nan());
    }

    #[test]
    fn test_log_bins_relative_error_is_bounded() {
        let bins = ICE_WATER_CONTENT_BINS;
        // Half a bin in log space.
        let tolerance = (bins.high / bins.low).ln() / LOG_BIN_COUNT / 2.0 + 1e-4;
        for &value in &[2e-4_f32, 1e-3, 0.05, 1.0, 37.0] {
            let decoded = bins.decode(bins.encode(value));
            assert!(
                (decoded / value).ln().abs() <= tolerance,
                "{value} decoded as {decoded}"
            );
        }
    }

    #[test]
    fn test_log_bins_are_monotonic() {
        let bins = ICE_WATER_PATH_BINS;
        let mut previous = 0;
        for k in 0..200 {
            let value = 1e-4_f32 * 1.1_f32.powi(k);
            let code = bins.encode(value);
            assert!(code >= previous);
            previous = code;
        }
    }

    #[test]
    fn test_probability_encoding() {
        let encoding = encoding_for("cloud_prob_2d");
        let data = VariableData::Float32(array![0.0_f32, 0.5, 1.0, f32::NAN].into_dyn());
        let EncodedData::UInt8(encoded) = encoding.encode(&data).unwrap() else {
            panic!("expected uint8 data");
        };
        assert_eq!(encoded.as_slice().unwrap(), &[0, 125, 250, 255]);

        let attrs = encoding.attributes();
        assert_eq!(attrs["_FillValue"], json!(255));
    }

    #[test]
    fn test_mask_encodings() {
        let inpainted = VariableData::Bool(array![true, false].into_dyn());
        let EncodedData::UInt8(encoded) = encoding_for("inpainted").encode(&inpainted).unwrap()
        else {
            panic!("expected uint8 data");
        };
        assert_eq!(encoded.as_slice().unwrap(), &[1, 0]);

        let classes = VariableData::UInt8(array![0_u8, 3, 255].into_dyn());
        let encoded = encoding_for("cloud_type").encode(&classes).unwrap();
        assert_eq!(encoded, EncodedData::UInt8(array![0_u8, 3, 255].into_dyn()));
    }

    #[test]
    fn test_encoding_table() {
        assert!(matches!(encoding_for("tiwp_ci"), Encoding::LogBins(b) if b.low == 1e-3));
        assert!(matches!(encoding_for("tiwc"), Encoding::LogBins(b) if b.low == 1e-4));
        assert_eq!(encoding_for("latitude"), Encoding::Float32);
        assert!(encoding_for("cloud_type")
            .encode(&VariableData::Float32(array![0.5_f32].into_dyn()))
            .is_err());
    }
}

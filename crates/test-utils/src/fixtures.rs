//! Deterministic stand-ins for the retrieval network and input readers.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, TimeZone, Utc};
use ndarray::{concatenate, Array4, ArrayD, ArrayView4, Axis, IxDyn};
use tiled_inference::{
    Coordinates, InferenceError, InputReader, ModelOutput, Precision, Predictor,
    RegionOfInterest, Result,
};

/// Number of classes of the scripted `cloud_class` head, "no cloud" included.
pub const CLOUD_CLASSES: usize = 9;

/// Number of vertical levels of the scripted profile outputs.
pub const LEVELS: usize = 20;

/// Predictor whose outputs depend only on the input at the same pixel.
///
/// Because of this, running the tiled driver must give exactly the same
/// fields as evaluating [`ScriptedPredictor::expected_tiwp`] and friends on
/// the full input, whatever the tiling. Regression heads are point
/// estimates of shape `[B, 1, ...]`.
#[derive(Debug, Default)]
pub struct ScriptedPredictor {
    /// Shapes of all inputs passed to `predict`.
    pub input_shapes: Vec<[usize; 4]>,
    /// Precision of every `predict` call.
    pub precisions: Vec<Precision>,
    /// Device set by the last `to_device` call.
    pub device: Option<String>,
    /// Make the n-th `predict` call (zero-based) fail.
    pub fail_on_call: Option<usize>,
}

impl ScriptedPredictor {
    pub fn new() -> Self {
        Self::default()
    }

    /// A predictor whose `call`-th forward pass fails.
    pub fn failing_on(call: usize) -> Self {
        Self {
            fail_on_call: Some(call),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.input_shapes.len()
    }

    /// Ice water path the predictor assigns to a pixel with channel mean `x`.
    pub fn expected_tiwp(x: f32) -> f32 {
        (x + 1.5).max(0.0)
    }

    /// Ice water content at `level` for channel mean `x`.
    pub fn expected_tiwc(x: f32, level: usize) -> f32 {
        0.01 * Self::expected_tiwp(x) * (level + 1) as f32 / LEVELS as f32
    }

    /// Column cloud probability for channel mean `x`.
    pub fn expected_cloud_prob(x: f32) -> f32 {
        ((x + 1.0) / 2.0).clamp(0.0, 1.0)
    }

    /// Cloud type the predictor favours at `level`.
    pub fn expected_cloud_type(level: usize) -> u8 {
        (1 + level % (CLOUD_CLASSES - 1)) as u8
    }

    fn channel_mean(input: ArrayView4<'_, f32>) -> ndarray::Array3<f32> {
        input
            .mean_axis(Axis(1))
            .unwrap_or_else(|| ndarray::Array3::zeros((input.dim().0, input.dim().2, input.dim().3)))
    }

    fn squeeze(output: &ArrayD<f32>) -> ArrayD<f32> {
        output.index_axis(Axis(1), 0).to_owned()
    }
}

impl Predictor for ScriptedPredictor {
    fn to_device(&mut self, device: &str) -> Result<()> {
        self.device = Some(device.to_string());
        Ok(())
    }

    fn predict(&mut self, input: ArrayView4<'_, f32>, precision: Precision) -> Result<ModelOutput> {
        let call = self.input_shapes.len();
        let (b, c, h, w) = input.dim();
        self.input_shapes.push([b, c, h, w]);
        self.precisions.push(precision);

        if self.fail_on_call == Some(call) {
            return Err(InferenceError::predictor(format!(
                "scripted failure on call {call}"
            )));
        }

        let x = Self::channel_mean(input);
        let mut outputs = ModelOutput::new();

        let tiwp = Array4::from_shape_fn((b, 1, h, w), |(i, _, r, c)| {
            Self::expected_tiwp(x[[i, r, c]])
        })
        .into_dyn();
        outputs.insert("tiwp".to_string(), tiwp.clone());
        outputs.insert("tiwp_fpavg".to_string(), tiwp.mapv(|v| 0.5 * v));

        let tiwc = ArrayD::from_shape_fn(IxDyn(&[b, 1, LEVELS, h, w]), |index| {
            Self::expected_tiwc(x[[index[0], index[3], index[4]]], index[2])
        });
        outputs.insert("tiwc".to_string(), tiwc);

        let cloud_mask = Array4::from_shape_fn((b, 1, h, w), |(i, _, r, c)| {
            Self::expected_cloud_prob(x[[i, r, c]])
        })
        .into_dyn();
        outputs.insert("cloud_mask".to_string(), cloud_mask);

        let cloud_class = ArrayD::from_shape_fn(IxDyn(&[b, CLOUD_CLASSES, LEVELS, h, w]), |index| {
            let p_cloud = Self::expected_cloud_prob(x[[index[0], index[3], index[4]]]);
            let (k, level) = (index[1], index[2]);
            if k == 0 {
                1.0 - p_cloud
            } else if k == Self::expected_cloud_type(level) as usize {
                0.5 * p_cloud + 0.5 * p_cloud / (CLOUD_CLASSES - 1) as f32
            } else {
                0.5 * p_cloud / (CLOUD_CLASSES - 1) as f32
            }
        });
        outputs.insert("cloud_class".to_string(), cloud_class);

        Ok(outputs)
    }

    fn posterior_mean(&self, output: &ArrayD<f32>, _key: &str) -> Result<ArrayD<f32>> {
        Ok(Self::squeeze(output))
    }

    fn posterior_quantiles(
        &self,
        output: &ArrayD<f32>,
        quantiles: &[f32],
        _key: &str,
    ) -> Result<ArrayD<f32>> {
        let scaled: Vec<ArrayD<f32>> = quantiles
            .iter()
            .map(|&q| output.mapv(|v| v * (0.5 + q)))
            .collect();
        let views: Vec<_> = scaled.iter().map(|a| a.view()).collect();
        Ok(concatenate(Axis(1), &views)?)
    }

    fn probability_larger_than(
        &self,
        output: &ArrayD<f32>,
        threshold: f32,
        _key: &str,
    ) -> Result<ArrayD<f32>> {
        Ok(Self::squeeze(output).mapv(|v| if v > threshold { 1.0 } else { 0.0 }))
    }
}

/// Input reader serving an in-memory raster on a regular global grid.
#[derive(Debug, Clone)]
pub struct MemoryReader {
    pub input: Array4<f32>,
    pub start: DateTime<Utc>,
    pub attributes: BTreeMap<String, String>,
}

impl MemoryReader {
    pub fn new(input: Array4<f32>) -> Self {
        let mut attributes = BTreeMap::new();
        attributes.insert("input_type".to_string(), "memory".to_string());
        Self {
            input,
            start: Utc
                .with_ymd_and_hms(2020, 1, 1, 0, 0, 0)
                .single()
                .unwrap_or_default(),
            attributes,
        }
    }

    /// Latitudes from north to south, cell centers of a global grid.
    pub fn latitudes(&self) -> Vec<f64> {
        let rows = self.input.dim().2;
        let step = 180.0 / rows as f64;
        (0..rows).map(|r| 90.0 - step * (r as f64 + 0.5)).collect()
    }

    pub fn longitudes(&self) -> Vec<f64> {
        let cols = self.input.dim().3;
        let step = 360.0 / cols as f64;
        (0..cols).map(|c| -180.0 + step * (c as f64 + 0.5)).collect()
    }

    fn roi_ranges(
        &self,
        roi: Option<&RegionOfInterest>,
    ) -> (Vec<usize>, Vec<usize>) {
        let lats = self.latitudes();
        let lons = self.longitudes();
        match roi {
            None => ((0..lats.len()).collect(), (0..lons.len()).collect()),
            Some(roi) => (
                (0..lats.len())
                    .filter(|&r| lats[r] >= roi.lat_min && lats[r] <= roi.lat_max)
                    .collect(),
                (0..lons.len())
                    .filter(|&c| lons[c] >= roi.lon_min && lons[c] <= roi.lon_max)
                    .collect(),
            ),
        }
    }
}

impl InputReader for MemoryReader {
    fn retrieval_input(&self, roi: Option<&RegionOfInterest>) -> Result<Array4<f32>> {
        let (rows, cols) = self.roi_ranges(roi);
        if rows.is_empty() || cols.is_empty() {
            return Err(InferenceError::invalid_settings(
                "region of interest does not intersect the input",
            ));
        }
        Ok(self
            .input
            .select(Axis(2), &rows)
            .select(Axis(3), &cols))
    }

    fn coordinates(&self, roi: Option<&RegionOfInterest>) -> Result<Coordinates> {
        let (rows, cols) = self.roi_ranges(roi);
        let lats = self.latitudes();
        let lons = self.longitudes();
        let time = (0..self.input.dim().0)
            .map(|t| self.start + Duration::minutes(30 * t as i64))
            .collect();
        Ok(Coordinates {
            time,
            latitude: rows.iter().map(|&r| lats[r]).collect(),
            longitude: cols.iter().map(|&c| lons[c]).collect(),
        })
    }

    fn input_file_attributes(&self) -> BTreeMap<String, String> {
        self.attributes.clone()
    }
}

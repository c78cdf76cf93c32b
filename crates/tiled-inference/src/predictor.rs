//! Interface to the neural network.
//!
//! The network and its probabilistic output heads are opaque to the engine.
//! A [`Predictor`] turns an input tile into raw outputs keyed by output name
//! and derives posterior statistics from them.
//!
//! Shape conventions, with `B` the batch (time) dimension and `L` the number
//! of vertical levels:
//!
//! | call | scalar target | profile target |
//! |---|---|---|
//! | `posterior_mean` | `[B, H, W]` | `[B, L, H, W]` |
//! | `posterior_quantiles` | `[B, Q, H, W]` | n/a |
//! | `probability_larger_than` | `[B, H, W]` | n/a |
//!
//! Classification heads are used directly: `cloud_mask` is `[B, 1, H, W]`
//! holding the cloud probability and `cloud_class` is `[B, K, L, H, W]`
//! holding per-class probabilities with class 0 being "no cloud".

use std::collections::BTreeMap;

use ndarray::{ArrayD, ArrayView4};

use crate::config::Precision;
use crate::error::{InferenceError, Result};

/// Raw model outputs keyed by output name.
pub type ModelOutput = BTreeMap<String, ArrayD<f32>>;

/// A model capable of retrieving the targets from an input tile.
pub trait Predictor {
    /// Move the model to the given compute device.
    fn to_device(&mut self, device: &str) -> Result<()> {
        let _ = device;
        Ok(())
    }

    /// Run the forward pass on a `[B, C, H, W]` tile. `H` and `W` are
    /// multiples of [`crate::padding::ALIGNMENT`].
    fn predict(&mut self, input: ArrayView4<'_, f32>, precision: Precision) -> Result<ModelOutput>;

    fn posterior_mean(&self, output: &ArrayD<f32>, key: &str) -> Result<ArrayD<f32>>;

    /// Posterior quantiles stacked along axis 1.
    fn posterior_quantiles(
        &self,
        output: &ArrayD<f32>,
        quantiles: &[f32],
        key: &str,
    ) -> Result<ArrayD<f32>>;

    /// Probability that the target exceeds `threshold`.
    fn probability_larger_than(
        &self,
        output: &ArrayD<f32>,
        threshold: f32,
        key: &str,
    ) -> Result<ArrayD<f32>>;
}

impl<P: Predictor + ?Sized> Predictor for Box<P> {
    fn to_device(&mut self, device: &str) -> Result<()> {
        (**self).to_device(device)
    }

    fn predict(&mut self, input: ArrayView4<'_, f32>, precision: Precision) -> Result<ModelOutput> {
        (**self).predict(input, precision)
    }

    fn posterior_mean(&self, output: &ArrayD<f32>, key: &str) -> Result<ArrayD<f32>> {
        (**self).posterior_mean(output, key)
    }

    fn posterior_quantiles(
        &self,
        output: &ArrayD<f32>,
        quantiles: &[f32],
        key: &str,
    ) -> Result<ArrayD<f32>> {
        (**self).posterior_quantiles(output, quantiles, key)
    }

    fn probability_larger_than(
        &self,
        output: &ArrayD<f32>,
        threshold: f32,
        key: &str,
    ) -> Result<ArrayD<f32>> {
        (**self).probability_larger_than(output, threshold, key)
    }
}

/// Look up a raw output by key.
pub fn model_output<'a>(outputs: &'a ModelOutput, key: &str) -> Result<&'a ArrayD<f32>> {
    outputs
        .get(key)
        .ok_or_else(|| InferenceError::MissingOutput(key.to_string()))
}

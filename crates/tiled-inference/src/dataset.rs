//! Labeled result dataset produced by a retrieval.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use ndarray::ArrayD;
use serde::Serialize;

use crate::error::{InferenceError, Result};

pub const TIME: &str = "time";
pub const LATITUDE: &str = "latitude";
pub const LONGITUDE: &str = "longitude";
pub const ALTITUDE: &str = "altitude";
pub const CI_BOUNDS: &str = "ci_bounds";

/// Number of levels of the vertical grid of profile targets.
pub const ALTITUDE_LEVEL_COUNT: usize = 20;

/// Heights of the vertical grid in meters: 500 m spacing starting at 500 m.
pub fn altitude_levels() -> Vec<f32> {
    (1..=ALTITUDE_LEVEL_COUNT).map(|k| k as f32 * 500.0).collect()
}

/// Typed data of an output variable.
#[derive(Debug, Clone, PartialEq)]
pub enum VariableData {
    Float32(ArrayD<f32>),
    UInt8(ArrayD<u8>),
    Bool(ArrayD<bool>),
}

impl VariableData {
    pub fn shape(&self) -> &[usize] {
        match self {
            Self::Float32(a) => a.shape(),
            Self::UInt8(a) => a.shape(),
            Self::Bool(a) => a.shape(),
        }
    }

    pub fn dtype_name(&self) -> &'static str {
        match self {
            Self::Float32(_) => "float32",
            Self::UInt8(_) => "uint8",
            Self::Bool(_) => "bool",
        }
    }

    pub fn as_f32(&self) -> Option<&ArrayD<f32>> {
        match self {
            Self::Float32(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> Option<&ArrayD<u8>> {
        match self {
            Self::UInt8(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<&ArrayD<bool>> {
        match self {
            Self::Bool(a) => Some(a),
            _ => None,
        }
    }
}

/// An array together with the names of its dimensions.
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub dims: Vec<String>,
    pub data: VariableData,
}

impl Variable {
    pub fn new(dims: &[&str], data: VariableData) -> Result<Self> {
        if dims.len() != data.shape().len() {
            return Err(InferenceError::shape_mismatch(format!(
                "dimensions {:?} do not match array of shape {:?}",
                dims,
                data.shape()
            )));
        }
        Ok(Self {
            dims: dims.iter().map(|d| d.to_string()).collect(),
            data,
        })
    }
}

/// Min, max and mean of a float field, ignoring missing values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FieldSummary {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    /// Number of NaN pixels.
    pub n_missing: usize,
}

/// Result of one retrieval: named variables plus coordinates.
#[derive(Debug, Clone, Default)]
pub struct RetrievalResults {
    pub variables: BTreeMap<String, Variable>,
    pub time: Vec<DateTime<Utc>>,
    pub latitude: Vec<f64>,
    pub longitude: Vec<f64>,
    /// Vertical grid, present when a profile variable was retrieved.
    pub altitude: Option<Vec<f32>>,
    pub attributes: BTreeMap<String, String>,
}

impl RetrievalResults {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, variable: Variable) {
        self.variables.insert(name.into(), variable);
    }

    pub fn get(&self, name: &str) -> Option<&Variable> {
        self.variables.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.variables.contains_key(name)
    }

    pub fn variable_names(&self) -> impl Iterator<Item = &str> {
        self.variables.keys().map(String::as_str)
    }

    /// Size of every dimension used by a variable or coordinate.
    pub fn dimension_sizes(&self) -> Result<BTreeMap<String, usize>> {
        let mut sizes = BTreeMap::new();
        for (name, variable) in &self.variables {
            for (dim, &len) in variable.dims.iter().zip(variable.data.shape()) {
                match sizes.insert(dim.clone(), len) {
                    Some(previous) if previous != len => {
                        return Err(InferenceError::shape_mismatch(format!(
                            "variable '{name}' has {dim}={len}, other variables have {previous}"
                        )));
                    }
                    _ => {}
                }
            }
        }
        Ok(sizes)
    }

    /// Summary statistics of a float variable. `None` if the variable is
    /// absent or not a float field.
    pub fn summarize(&self, name: &str) -> Option<FieldSummary> {
        let data = self.get(name)?.data.as_f32()?;

        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        let mut sum = 0.0;
        let mut count = 0usize;
        let mut n_missing = 0usize;
        for &value in data.iter() {
            if value.is_nan() {
                n_missing += 1;
                continue;
            }
            let value = value as f64;
            min = min.min(value);
            max = max.max(value);
            sum += value;
            count += 1;
        }

        if count == 0 {
            return Some(FieldSummary {
                min: f64::NAN,
                max: f64::NAN,
                mean: f64::NAN,
                n_missing,
            });
        }

        Some(FieldSummary {
            min,
            max,
            mean: sum / count as f64,
            n_missing,
        })
    }
}

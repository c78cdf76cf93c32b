//! Interface to readers of retrieval input files.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use ndarray::Array4;

use crate::config::RegionOfInterest;
use crate::error::Result;

/// Coordinates of a retrieval input, restricted to the region of interest
/// when one is given.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Coordinates {
    pub time: Vec<DateTime<Utc>>,
    pub latitude: Vec<f64>,
    pub longitude: Vec<f64>,
}

/// A satellite input file that can be turned into retrieval input.
pub trait InputReader {
    /// Normalized `[time, channel, latitude, longitude]` input. Missing
    /// pixels hold the normalizer's sentinel value.
    fn retrieval_input(&self, roi: Option<&RegionOfInterest>) -> Result<Array4<f32>>;

    /// Coordinates matching [`InputReader::retrieval_input`] for the same
    /// region of interest.
    fn coordinates(&self, roi: Option<&RegionOfInterest>) -> Result<Coordinates>;

    /// Global attributes copied into the retrieval results.
    fn input_file_attributes(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }
}

//! Tiled inference over a full retrieval input.

use std::collections::BTreeMap;
use std::time::Instant;

use ndarray::{ArrayD, ArrayView4, Axis, IxDyn};
use tracing::{debug, info, instrument};

use crate::config::{Precision, RegionOfInterest, RetrievalSettings};
use crate::dataset::{
    altitude_levels, RetrievalResults, Variable, VariableData, ALTITUDE, ALTITUDE_LEVEL_COUNT,
    CI_BOUNDS, LATITUDE, LONGITUDE, TIME,
};
use crate::error::{InferenceError, Result};
use crate::input::{Coordinates, InputReader};
use crate::invalid::{inpainted_mask, invalid_mask};
use crate::padding::{calculate_padding, ALIGNMENT};
use crate::predictor::{ModelOutput, Predictor};
use crate::targets::{aggregate_tile, determine_cloud_class, VariableKind};
use crate::tiler::{TileGrid, Tiler};

/// Per-variable tile results, addressed by tile index.
struct Accumulator {
    kind: VariableKind,
    tiles: TileGrid<ArrayD<f32>>,
}

/// Run the retrieval on a `[time, channel, row, col]` input array.
///
/// Tiles are processed in row-major order. Any failure aborts the whole
/// call. The returned results carry no coordinate values except the
/// vertical grid; see [`process_input_file`].
#[instrument(skip_all, fields(shape = ?input.shape()))]
pub fn process_input<P>(
    predictor: &mut P,
    input: ArrayView4<'_, f32>,
    settings: &RetrievalSettings,
) -> Result<RetrievalResults>
where
    P: Predictor + ?Sized,
{
    settings.validate()?;
    let start = Instant::now();

    let (_, _, rows, cols) = input.dim();
    let tiler = Tiler::new(
        rows,
        cols,
        settings.tile_size,
        settings.overlap,
        settings.wrap_columns(),
    )?;
    let (m, n) = tiler.tile_count();

    info!(
        tiles = m * n,
        targets = settings.targets.len(),
        device = %settings.device,
        precision = settings.precision.as_str(),
        "Starting tiled inference"
    );

    predictor.to_device(&settings.device)?;
    let interval = settings.interval_quantiles();
    let mut accumulators: BTreeMap<String, Accumulator> = BTreeMap::new();

    for i in 0..m {
        for j in 0..n {
            let tile = tiler.get_tile(&input, i, j)?;
            let outputs = run_model(predictor, tile.view(), settings.precision)?;
            let invalid = invalid_mask(tile.view())?;

            for &target in &settings.targets {
                for stat in aggregate_tile(target, &*predictor, &outputs, &invalid, interval)? {
                    let accumulator =
                        accumulators
                            .entry(stat.variable)
                            .or_insert_with(|| Accumulator {
                                kind: stat.kind,
                                tiles: TileGrid::new(m, n),
                            });
                    accumulator.tiles.set(i, j, stat.data)?;
                }
            }

            debug!(i, j, "Processed tile");
        }
    }

    let mut results = RetrievalResults::new();
    for (name, accumulator) in accumulators {
        let assembled = tiler.assemble(&accumulator.tiles)?;
        let variable = finalize_variable(&name, accumulator.kind, assembled)?;
        if variable.dims.iter().any(|d| d == ALTITUDE) {
            results.altitude = Some(altitude_levels());
        }
        results.insert(name, variable);
    }

    if settings.inpainted_mask {
        let mask = inpainted_mask(input).into_dyn();
        results.insert(
            "inpainted",
            Variable::new(&[TIME, LATITUDE, LONGITUDE], VariableData::Bool(mask))?,
        );
    }

    info!(
        variables = results.variables.len(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Tiled inference complete"
    );

    Ok(results)
}

/// Run the retrieval on an input file.
///
/// Reads the input for the configured region of interest, runs
/// [`process_input`] and attaches the reader's coordinates and global
/// attributes to the results.
#[instrument(skip_all)]
pub fn process_input_file<P, R>(
    predictor: &mut P,
    reader: &R,
    settings: &RetrievalSettings,
) -> Result<RetrievalResults>
where
    P: Predictor + ?Sized,
    R: InputReader + ?Sized,
{
    let roi = settings.roi.as_ref();
    let input = reader.retrieval_input(roi)?;
    let coordinates = reader.coordinates(roi)?;
    let (time, _, rows, cols) = input.dim();
    if coordinates.time.len() != time
        || coordinates.latitude.len() != rows
        || coordinates.longitude.len() != cols
    {
        return Err(InferenceError::shape_mismatch(format!(
            "coordinates ({}, {}, {}) do not match input of shape {:?}",
            coordinates.time.len(),
            coordinates.latitude.len(),
            coordinates.longitude.len(),
            input.shape()
        )));
    }

    if let Some(roi) = roi {
        check_within_roi(roi, &coordinates)?;
    }

    let mut results = process_input(predictor, input.view(), settings)?;
    results.time = coordinates.time;
    results.latitude = coordinates.latitude;
    results.longitude = coordinates.longitude;
    results.attributes.extend(reader.input_file_attributes());

    Ok(results)
}

/// Reject input that is empty or extends beyond `roi`.
fn check_within_roi(roi: &RegionOfInterest, coordinates: &Coordinates) -> Result<()> {
    let extent = |values: &[f64]| {
        values
            .iter()
            .fold(None, |acc: Option<(f64, f64)>, &v| match acc {
                Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
                None => Some((v, v)),
            })
    };

    let (Some((lat_lo, lat_hi)), Some((lon_lo, lon_hi))) = (
        extent(&coordinates.latitude),
        extent(&coordinates.longitude),
    ) else {
        return Err(InferenceError::invalid_settings(format!(
            "region of interest {roi:?} contains no input pixels"
        )));
    };

    if !roi.contains(lon_lo, lat_lo) || !roi.contains(lon_hi, lat_hi) {
        return Err(InferenceError::shape_mismatch(format!(
            "input spans lon [{lon_lo}, {lon_hi}], lat [{lat_lo}, {lat_hi}] \
             outside of region of interest {roi:?}"
        )));
    }
    Ok(())
}

/// Forward pass with alignment padding. Outputs are cropped back to the
/// tile's spatial shape.
fn run_model<P>(
    predictor: &mut P,
    tile: ArrayView4<'_, f32>,
    precision: Precision,
) -> Result<ModelOutput>
where
    P: Predictor + ?Sized,
{
    let padding = calculate_padding(tile.shape(), ALIGNMENT);
    if padding.is_empty() {
        return predictor.predict(tile, precision);
    }

    let padded = padding.apply(&tile)?;
    let outputs = predictor.predict(padded.view(), precision)?;
    outputs
        .into_iter()
        .map(|(key, value)| Ok((key, padding.crop(&value)?.to_owned())))
        .collect()
}

/// Give an assembled array its output layout: spatial axes first, then the
/// vertical or interval axis.
fn finalize_variable(name: &str, kind: VariableKind, assembled: ArrayD<f32>) -> Result<Variable> {
    match kind {
        VariableKind::Statistic => match assembled.ndim() {
            3 => Variable::new(
                &[TIME, LATITUDE, LONGITUDE],
                VariableData::Float32(assembled),
            ),
            4 => {
                check_levels(name, assembled.shape()[1])?;
                Variable::new(
                    &[TIME, LATITUDE, LONGITUDE, ALTITUDE],
                    VariableData::Float32(move_axis_last(assembled)),
                )
            }
            _ => Err(unexpected_rank(name, assembled.shape())),
        },
        VariableKind::ConfidenceInterval => {
            if assembled.ndim() != 4 {
                return Err(unexpected_rank(name, assembled.shape()));
            }
            Variable::new(
                &[TIME, LATITUDE, LONGITUDE, CI_BOUNDS],
                VariableData::Float32(move_axis_last(assembled)),
            )
        }
        VariableKind::CloudClass => {
            if assembled.ndim() != 5 {
                return Err(unexpected_rank(name, assembled.shape()));
            }
            check_levels(name, assembled.shape()[2])?;
            let classes = determine_cloud_class(assembled.view(), Axis(1));
            Variable::new(
                &[TIME, LATITUDE, LONGITUDE, ALTITUDE],
                VariableData::UInt8(move_axis_last(classes)),
            )
        }
    }
}

/// Move axis 1 of a 4-D array to the end, keeping standard layout.
fn move_axis_last<A: Clone>(array: ArrayD<A>) -> ArrayD<A> {
    array
        .permuted_axes(IxDyn(&[0, 2, 3, 1]))
        .as_standard_layout()
        .into_owned()
}

fn check_levels(name: &str, levels: usize) -> Result<()> {
    if levels != ALTITUDE_LEVEL_COUNT {
        return Err(InferenceError::shape_mismatch(format!(
            "'{name}' has {levels} vertical levels, expected {ALTITUDE_LEVEL_COUNT}"
        )));
    }
    Ok(())
}

fn unexpected_rank(name: &str, shape: &[usize]) -> InferenceError {
    InferenceError::shape_mismatch(format!("'{name}' assembled to unexpected shape {shape:?}"))
}

//! Retrieval targets and the per-tile statistics derived for them.

use ndarray::{concatenate, Array3, ArrayD, ArrayViewD, Axis, Slice};
use serde::{Deserialize, Serialize};

use crate::error::{InferenceError, Result};
use crate::predictor::{model_output, ModelOutput, Predictor};

/// Below this probability of "no cloud" a pixel is assigned a cloud type.
pub const NO_CLOUD_THRESHOLD: f32 = 0.638;

/// Class index reported where no cloud class could be determined.
pub const CLOUD_CLASS_MISSING: u8 = 255;

/// Fill value of masked classification probabilities.
pub const CLASSIFICATION_FILL: f32 = -1.0;

/// Physical quantities the retrieval can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    /// Total ice water path.
    Tiwp,
    /// Total ice water path, footprint averaged.
    TiwpFpavg,
    /// Total ice water content profile.
    Tiwc,
    /// Probability that the column contains a cloud.
    CloudProb2d,
    /// Probability of cloud presence per level.
    CloudProb3d,
    /// Cloud type per level.
    CloudType,
}

impl Target {
    pub const ALL: [Target; 6] = [
        Target::Tiwp,
        Target::TiwpFpavg,
        Target::Tiwc,
        Target::CloudProb2d,
        Target::CloudProb3d,
        Target::CloudType,
    ];

    pub fn descriptor(&self) -> &'static TargetDescriptor {
        match self {
            Target::Tiwp => &DESCRIPTORS[0],
            Target::TiwpFpavg => &DESCRIPTORS[1],
            Target::Tiwc => &DESCRIPTORS[2],
            Target::CloudProb2d => &DESCRIPTORS[3],
            Target::CloudProb3d => &DESCRIPTORS[4],
            Target::CloudType => &DESCRIPTORS[5],
        }
    }

    pub fn name(&self) -> &'static str {
        self.descriptor().name
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.name() == name)
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// How the output of a target is derived from the model output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StatisticClass {
    /// Posterior mean only.
    Mean,
    /// Posterior mean, confidence interval and exceedance probability.
    MeanWithInterval { threshold: f32 },
    Classification(ClassificationKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassificationKind {
    /// Channel 0 of the `cloud_mask` head.
    CloudPresence2d,
    /// `1 - P(no cloud)` of the `cloud_class` head.
    CloudPresence3d,
    /// Most likely class of the `cloud_class` head.
    CloudType,
}

/// Whether a target is a single field or a vertical profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    Scalar,
    Profile,
}

/// Static description of a target.
#[derive(Debug)]
pub struct TargetDescriptor {
    pub name: &'static str,
    /// Key of the model output the target is derived from.
    pub output_key: &'static str,
    pub class: StatisticClass,
    pub layout: Layout,
}

static DESCRIPTORS: [TargetDescriptor; 6] = [
    TargetDescriptor {
        name: "tiwp",
        output_key: "tiwp",
        class: StatisticClass::MeanWithInterval { threshold: 1e-3 },
        layout: Layout::Scalar,
    },
    TargetDescriptor {
        name: "tiwp_fpavg",
        output_key: "tiwp_fpavg",
        class: StatisticClass::MeanWithInterval { threshold: 1e-3 },
        layout: Layout::Scalar,
    },
    TargetDescriptor {
        name: "tiwc",
        output_key: "tiwc",
        class: StatisticClass::Mean,
        layout: Layout::Profile,
    },
    TargetDescriptor {
        name: "cloud_prob_2d",
        output_key: "cloud_mask",
        class: StatisticClass::Classification(ClassificationKind::CloudPresence2d),
        layout: Layout::Scalar,
    },
    TargetDescriptor {
        name: "cloud_prob_3d",
        output_key: "cloud_class",
        class: StatisticClass::Classification(ClassificationKind::CloudPresence3d),
        layout: Layout::Profile,
    },
    TargetDescriptor {
        name: "cloud_type",
        output_key: "cloud_class",
        class: StatisticClass::Classification(ClassificationKind::CloudType),
        layout: Layout::Profile,
    },
];

/// What a per-tile statistic turns into once assembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableKind {
    /// A float field with dimensions `(time, latitude, longitude[, altitude])`.
    Statistic,
    /// Interval bounds stacked along axis 1, stored with a trailing
    /// `ci_bounds` dimension.
    ConfidenceInterval,
    /// Class probabilities along axis 1, reduced to a class index.
    CloudClass,
}

/// One output variable of one tile. Spatial axes are always trailing.
#[derive(Debug, Clone)]
pub struct TileStatistic {
    pub variable: String,
    pub kind: VariableKind,
    pub data: ArrayD<f32>,
}

/// Derive all output variables of `target` for one tile and mask the
/// invalid pixels.
pub fn aggregate_tile<P>(
    target: Target,
    predictor: &P,
    outputs: &ModelOutput,
    invalid: &Array3<bool>,
    interval: [f32; 2],
) -> Result<Vec<TileStatistic>>
where
    P: Predictor + ?Sized,
{
    let descriptor = target.descriptor();
    let raw = model_output(outputs, descriptor.output_key)?;
    let mut stats = Vec::with_capacity(3);

    match descriptor.class {
        StatisticClass::Mean | StatisticClass::MeanWithInterval { .. } => {
            let mut mean = predictor.posterior_mean(raw, descriptor.output_key)?;
            apply_mask(&mut mean, invalid, f32::NAN)?;
            stats.push(TileStatistic {
                variable: descriptor.name.to_string(),
                kind: VariableKind::Statistic,
                data: mean,
            });
        }
        StatisticClass::Classification(kind) => {
            let (mut data, fill, variable_kind) = classification(kind, raw)?;
            apply_mask(&mut data, invalid, fill)?;
            stats.push(TileStatistic {
                variable: descriptor.name.to_string(),
                kind: variable_kind,
                data,
            });
        }
    }

    if let StatisticClass::MeanWithInterval { threshold } = descriptor.class {
        let mut bounds = predictor.posterior_quantiles(raw, &interval, descriptor.output_key)?;
        apply_mask(&mut bounds, invalid, f32::NAN)?;
        stats.push(TileStatistic {
            variable: format!("{}_ci", descriptor.name),
            kind: VariableKind::ConfidenceInterval,
            data: bounds,
        });

        let mut exceedance =
            predictor.probability_larger_than(raw, threshold, descriptor.output_key)?;
        apply_mask(&mut exceedance, invalid, f32::NAN)?;
        stats.push(TileStatistic {
            variable: format!("p_{}", descriptor.name),
            kind: VariableKind::Statistic,
            data: exceedance,
        });
    }

    Ok(stats)
}

fn classification(
    kind: ClassificationKind,
    raw: &ArrayD<f32>,
) -> Result<(ArrayD<f32>, f32, VariableKind)> {
    if raw.ndim() < 4 || raw.shape()[1] == 0 {
        return Err(InferenceError::shape_mismatch(format!(
            "classification output has shape {:?}",
            raw.shape()
        )));
    }

    let first_channel = raw.index_axis(Axis(1), 0);
    match kind {
        ClassificationKind::CloudPresence2d => {
            Ok((first_channel.to_owned(), f32::NAN, VariableKind::Statistic))
        }
        ClassificationKind::CloudPresence3d => Ok((
            first_channel.mapv(|p| 1.0 - p),
            f32::NAN,
            VariableKind::Statistic,
        )),
        ClassificationKind::CloudType => {
            let first = raw.slice_axis(Axis(1), Slice::from(0..1));
            let types = softmax(raw.slice_axis(Axis(1), Slice::from(1..)), Axis(1));
            let probs = concatenate(Axis(1), &[first, types.view()])?;
            Ok((probs, CLASSIFICATION_FILL, VariableKind::CloudClass))
        }
    }
}

fn softmax(values: ArrayViewD<'_, f32>, axis: Axis) -> ArrayD<f32> {
    let mut out = values.to_owned();
    for mut lane in out.lanes_mut(axis) {
        let max = lane.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        lane.mapv_inplace(|v| (v - max).exp());
        let sum = lane.sum();
        if sum > 0.0 {
            lane.mapv_inplace(|v| v / sum);
        }
    }
    out
}

/// Set every pixel flagged in the `[B, H, W]` mask to `fill`, for all
/// intermediate axes of `data`.
fn apply_mask(data: &mut ArrayD<f32>, invalid: &Array3<bool>, fill: f32) -> Result<()> {
    let nd = data.ndim();
    let (batch, rows, cols) = invalid.dim();
    if nd < 3
        || data.shape()[0] != batch
        || data.shape()[nd - 2] != rows
        || data.shape()[nd - 1] != cols
    {
        return Err(InferenceError::shape_mismatch(format!(
            "statistic of shape {:?} does not match mask of shape {:?}",
            data.shape(),
            invalid.shape()
        )));
    }

    for (index, value) in data.indexed_iter_mut() {
        if invalid[[index[0], index[nd - 2], index[nd - 1]]] {
            *value = fill;
        }
    }
    Ok(())
}

/// Reduce class probabilities along `axis` to a class index.
///
/// Class 0 is reported when the "no cloud" probability reaches
/// [`NO_CLOUD_THRESHOLD`], otherwise `1 + argmax` over the remaining
/// classes. Negative or NaN "no cloud" probabilities mark masked pixels and
/// yield [`CLOUD_CLASS_MISSING`].
pub fn determine_cloud_class(probs: ArrayViewD<'_, f32>, axis: Axis) -> ArrayD<u8> {
    probs.map_axis(axis, |lane| {
        let Some(&no_cloud) = lane.get(0) else {
            return CLOUD_CLASS_MISSING;
        };
        if no_cloud.is_nan() || no_cloud < 0.0 {
            return CLOUD_CLASS_MISSING;
        }
        if no_cloud >= NO_CLOUD_THRESHOLD {
            return 0;
        }

        let mut best = 0;
        let mut best_prob = f32::NEG_INFINITY;
        for (k, &p) in lane.iter().enumerate().skip(1) {
            if p > best_prob {
                best = k;
                best_prob = p;
            }
        }
        best.max(1) as u8
    })
}

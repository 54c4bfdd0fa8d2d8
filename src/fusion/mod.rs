//! Label fusion - turns per-model probabilities into one global label map

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::core::error::{Result, SegError};
use crate::core::types::{LabelId, BACKGROUND_LABEL};
use crate::volume::{LabelMap, Volume};

/// Which sub-model keeps a voxel that two of them label as foreground
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// The later sub-model in orchestration order overwrites
    #[default]
    LastWins,
    /// The first sub-model to claim a voxel keeps it
    FirstWins,
}

/// What one fusion step changed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FusionReport {
    /// Voxels the sub-model labelled as foreground
    pub foreground: usize,
    /// Voxels the global map ended up taking from this sub-model
    pub written: usize,
    /// Voxels already carrying another sub-model's label
    pub conflicts: usize,
}

/// Index of the most probable channel at every voxel
///
/// Ties resolve to the lowest channel index, so an all-equal voxel is
/// background.
pub fn argmax(probabilities: &Volume<f32>) -> Result<Volume<LabelId>> {
    let channels = probabilities.channels();
    if channels > LabelId::MAX as usize + 1 {
        return Err(SegError::Format(format!(
            "{} channels do not fit the label type",
            channels
        )));
    }
    let voxels = probabilities.voxels();
    let data = probabilities.data();

    let labels: Vec<LabelId> = (0..voxels)
        .into_par_iter()
        .map(|v| {
            let mut best = 0usize;
            let mut best_value = data[v];
            for c in 1..channels {
                let value = data[c * voxels + v];
                if value > best_value {
                    best = c;
                    best_value = value;
                }
            }
            best as LabelId
        })
        .collect();

    Volume::from_data(probabilities.shape(), 1, *probabilities.geometry(), labels)
}

/// Write the foreground of a sub-model's local labels into `global`
///
/// Local label `l > 0` becomes `l + offset`; local background never
/// overwrites anything.
pub fn fuse(
    global: &mut LabelMap,
    local: &Volume<LabelId>,
    offset: LabelId,
    policy: ConflictPolicy,
) -> Result<FusionReport> {
    if !global.same_grid(local) || local.channels() != 1 || global.channels() != 1 {
        return Err(SegError::Geometry(format!(
            "cannot fuse labels of shape {:?} into a map of shape {:?} on a different grid",
            local.shape(),
            global.shape()
        )));
    }

    let mut report = FusionReport::default();
    for (dst, &src) in global.data_mut().iter_mut().zip(local.data()) {
        if src == BACKGROUND_LABEL {
            continue;
        }
        let label = src.checked_add(offset).ok_or_else(|| {
            SegError::Config(format!("label {} with offset {} overflows", src, offset))
        })?;
        report.foreground += 1;

        if *dst != BACKGROUND_LABEL {
            report.conflicts += 1;
            if policy == ConflictPolicy::FirstWins {
                continue;
            }
        }
        *dst = label;
        report.written += 1;
    }

    if report.conflicts > 0 {
        tracing::warn!(
            conflicts = report.conflicts,
            offset,
            ?policy,
            "Sub-models claimed the same voxels"
        );
    }
    Ok(report)
}

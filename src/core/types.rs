//! Core type definitions used throughout the codebase

use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Voxel counts along (x, y, z)
pub type Shape3 = [usize; 3];

/// Voxel index along (x, y, z)
pub type Index3 = [usize; 3];

/// Physical voxel size in millimetres along (x, y, z)
pub type Spacing3 = [f64; 3];

/// Global label identifier in the fused output (0 = background)
pub type LabelId = u16;

pub const BACKGROUND_LABEL: LabelId = 0;

/// Total voxel count of a shape
#[inline]
pub fn voxel_count(shape: Shape3) -> usize {
    shape[0] * shape[1] * shape[2]
}

/// Execution device a model can be placed on
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DeviceId {
    #[display(fmt = "cpu")]
    Cpu,
    #[display(fmt = "cuda:{}", _0)]
    Gpu(u32),
}

impl DeviceId {
    pub fn is_gpu(&self) -> bool {
        matches!(self, DeviceId::Gpu(_))
    }
}

/// Resolution/cost trade-off of a task
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeedMode {
    #[default]
    #[display(fmt = "normal")]
    Normal,
    #[display(fmt = "fast")]
    Fast,
}

impl SpeedMode {
    pub fn from_fast_flag(fast: bool) -> Self {
        if fast {
            SpeedMode::Fast
        } else {
            SpeedMode::Normal
        }
    }
}

/// Segmentation tasks known to the catalog
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskName {
    /// Whole-body CT
    #[display(fmt = "total")]
    Total,
    /// Whole-body MR
    #[display(fmt = "total_mr")]
    TotalMr,
}

impl TaskName {
    pub const ALL: [TaskName; 2] = [TaskName::Total, TaskName::TotalMr];
}

impl FromStr for TaskName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "total" => Ok(TaskName::Total),
            "total_mr" => Ok(TaskName::TotalMr),
            other => Err(format!(
                "unknown task '{}' (expected one of: total, total_mr)",
                other
            )),
        }
    }
}

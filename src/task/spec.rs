//! Static description of one sub-model

use serde::{Deserialize, Serialize};

use crate::core::error::{Result, SegError};
use crate::core::types::{voxel_count, LabelId, Shape3, Spacing3};
use crate::volume::Volume;

/// Intensity preprocessing a model was trained with
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Normalization {
    /// Raw intensities
    None,
    /// Clip to `[lower, upper]` then `(x - mean) / std` with dataset statistics
    Clip {
        lower: f32,
        upper: f32,
        mean: f32,
        std: f32,
    },
    /// `(x - mean) / std` with the statistics of the volume itself
    ZScore,
}

impl Normalization {
    /// Normalize a single-channel intensity volume in place
    pub fn apply(&self, volume: &mut Volume<f32>) {
        match *self {
            Normalization::None => {}
            Normalization::Clip {
                lower,
                upper,
                mean,
                std,
            } => {
                let std = if std > 0.0 { std } else { 1.0 };
                for v in volume.data_mut() {
                    *v = (v.clamp(lower, upper) - mean) / std;
                }
            }
            Normalization::ZScore => {
                let data = volume.data_mut();
                let n = data.len() as f64;
                let mean = data.iter().map(|&v| v as f64).sum::<f64>() / n;
                let var = data
                    .iter()
                    .map(|&v| {
                        let d = v as f64 - mean;
                        d * d
                    })
                    .sum::<f64>()
                    / n;
                let std = var.sqrt().max(1e-8);
                for v in data.iter_mut() {
                    *v = ((*v as f64 - mean) / std) as f32;
                }
            }
        }
    }
}

/// Placement preference of a model; a hint, never a hard requirement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceAffinity {
    #[default]
    Any,
    PreferGpu,
    PreferCpu,
}

/// Everything the pipeline needs to know about one network
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Short model identifier, e.g. `M291`
    pub name: String,
    /// File name of the weights in the model hub
    pub weights_file: String,
    /// Voxel size the network expects (mm)
    pub target_spacing: Spacing3,
    /// Network input window
    pub patch_shape: Shape3,
    /// Window step; `patch_shape - stride` is the overlap
    pub stride: Shape3,
    /// Foreground classes, in output-channel order starting at channel 1
    pub labels: Vec<String>,
    pub normalization: Normalization,
    #[serde(default)]
    pub device_affinity: DeviceAffinity,
    /// Working memory per patch voxel during a forward pass (bytes)
    pub bytes_per_voxel: u64,
}

impl ModelSpec {
    pub fn label_count(&self) -> LabelId {
        self.labels.len() as LabelId
    }

    /// Output channels including background
    pub fn output_channels(&self) -> usize {
        self.labels.len() + 1
    }

    pub fn patch_voxels(&self) -> usize {
        voxel_count(self.patch_shape)
    }

    /// Memory one patch occupies during a forward pass
    pub fn patch_bytes(&self) -> u64 {
        self.patch_voxels() as u64 * self.bytes_per_voxel
    }

    /// Coarsest voxel size across axes
    pub fn max_spacing(&self) -> f64 {
        self.target_spacing.iter().copied().fold(0.0, f64::max)
    }

    pub fn validate(&self) -> Result<()> {
        if self.labels.is_empty() {
            return Err(SegError::Config(format!("model {} has no labels", self.name)));
        }
        if self.labels.len() >= LabelId::MAX as usize {
            return Err(SegError::Config(format!(
                "model {} has too many labels ({})",
                self.name,
                self.labels.len()
            )));
        }
        if self.target_spacing.iter().any(|s| !s.is_finite() || *s <= 0.0) {
            return Err(SegError::Geometry(format!(
                "model {} has non-positive spacing {:?}",
                self.name, self.target_spacing
            )));
        }
        for axis in 0..3 {
            if self.patch_shape[axis] == 0
                || self.stride[axis] == 0
                || self.stride[axis] > self.patch_shape[axis]
            {
                return Err(SegError::Config(format!(
                    "model {} has invalid patch {:?} / stride {:?}",
                    self.name, self.patch_shape, self.stride
                )));
            }
        }
        Ok(())
    }
}

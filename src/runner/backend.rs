//! Inference backends
//!
//! A [`Backend`] turns a weights blob into a [`Network`] living on one device.
//! Runners are generic over the backend, so the forward call inside the batch
//! loop is statically dispatched.

use serde::{Deserialize, Serialize};

use crate::core::error::{Result, SegError};
use crate::core::types::DeviceId;
use crate::hub::WeightsBlob;
use crate::patch::Patch;
use crate::task::ModelSpec;

/// A loaded network; read-only once loaded and shared by every worker on its device
pub trait Network: Send + Sync {
    /// Per-class probabilities for every patch of the batch
    ///
    /// Each output holds `spec.output_channels()` channels on the patch grid,
    /// channel-major and x-fastest, channel 0 being background.
    fn forward(&self, batch: &[Patch]) -> Result<Vec<Vec<f32>>>;

    /// Device memory the weights occupy
    fn weights_bytes(&self) -> u64;
}

/// Loads networks from weights blobs
pub trait Backend: Send + Sync {
    type Network: Network;

    fn load(&self, weights: &WeightsBlob, spec: &ModelSpec, device: DeviceId) -> Result<Self::Network>;
}

/// One class of a voxel-wise linear classifier
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassWeights {
    pub weight: f32,
    pub bias: f32,
}

/// Weights blob layout of [`VoxelLinearBackend`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoxelLinearWeights {
    /// Background first, then one entry per foreground label
    pub classes: Vec<ClassWeights>,
}

/// Reference backend: a 1x1x1 convolution followed by softmax
///
/// Logit of class `c` at a voxel with normalized intensity `x` is
/// `weight_c * x + bias_c`. Runs on any device id since it only computes on
/// the host; device memory is still accounted through the runner.
#[derive(Debug, Clone, Copy, Default)]
pub struct VoxelLinearBackend;

/// Network produced by [`VoxelLinearBackend`]
#[derive(Debug, Clone)]
pub struct VoxelLinearNetwork {
    classes: Vec<ClassWeights>,
    device: DeviceId,
    weights_bytes: u64,
}

impl Backend for VoxelLinearBackend {
    type Network = VoxelLinearNetwork;

    fn load(&self, weights: &WeightsBlob, spec: &ModelSpec, device: DeviceId) -> Result<Self::Network> {
        let parsed: VoxelLinearWeights = serde_json::from_slice(weights.bytes()).map_err(|e| {
            SegError::ModelResolution(format!(
                "weights '{}' are not voxel-linear JSON ({}); the built-in backend cannot run \
                 trained checkpoints, plug a network runtime in through the Backend trait",
                weights.name(),
                e
            ))
        })?;
        if parsed.classes.len() != spec.output_channels() {
            return Err(SegError::ModelResolution(format!(
                "weights '{}' define {} classes, model {} expects {}",
                weights.name(),
                parsed.classes.len(),
                spec.name,
                spec.output_channels()
            )));
        }
        tracing::debug!(model = %spec.name, %device, "Loaded voxel-linear network");
        Ok(VoxelLinearNetwork {
            classes: parsed.classes,
            device,
            weights_bytes: weights.bytes().len() as u64,
        })
    }
}

impl Network for VoxelLinearNetwork {
    fn forward(&self, batch: &[Patch]) -> Result<Vec<Vec<f32>>> {
        let classes = self.classes.len();
        batch
            .iter()
            .map(|patch| {
                if patch.channels != 1 {
                    return Err(SegError::Inference {
                        device: self.device,
                        message: format!("expected 1 input channel, got {}", patch.channels),
                    });
                }
                let voxels = patch.voxels();
                let mut out = vec![0.0f32; voxels * classes];
                let mut logits = vec![0.0f32; classes];
                for (v, &x) in patch.data.iter().enumerate() {
                    let mut max = f32::NEG_INFINITY;
                    for (c, class) in self.classes.iter().enumerate() {
                        logits[c] = class.weight * x + class.bias;
                        max = max.max(logits[c]);
                    }
                    let mut total = 0.0;
                    for logit in logits.iter_mut() {
                        *logit = (*logit - max).exp();
                        total += *logit;
                    }
                    for (c, logit) in logits.iter().enumerate() {
                        out[c * voxels + v] = logit / total;
                    }
                }
                Ok(out)
            })
            .collect()
    }

    fn weights_bytes(&self) -> u64 {
        self.weights_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Geometry;
    use crate::patch::{tile, BlendMode};
    use crate::task::{DeviceAffinity, Normalization};
    use crate::volume::Volume;

    fn spec() -> ModelSpec {
        ModelSpec {
            name: "T".into(),
            weights_file: "T.json".into(),
            target_spacing: [1.0; 3],
            patch_shape: [2, 2, 2],
            stride: [2, 2, 2],
            labels: vec!["bright".into()],
            normalization: Normalization::None,
            device_affinity: DeviceAffinity::Any,
            bytes_per_voxel: 8,
        }
    }

    fn blob(classes: &[(f32, f32)]) -> WeightsBlob {
        let weights = VoxelLinearWeights {
            classes: classes
                .iter()
                .map(|&(weight, bias)| ClassWeights { weight, bias })
                .collect(),
        };
        WeightsBlob::new("T.json", serde_json::to_vec(&weights).unwrap())
    }

    #[test]
    fn test_class_count_must_match_spec() {
        let err = VoxelLinearBackend
            .load(&blob(&[(0.0, 0.0)]), &spec(), DeviceId::Cpu)
            .unwrap_err();
        assert!(matches!(err, SegError::ModelResolution(_)));
    }

    #[test]
    fn test_forward_thresholds_intensity() {
        // Foreground wins where x > 0.5
        let net = VoxelLinearBackend
            .load(&blob(&[(0.0, 0.0), (10.0, -5.0)]), &spec(), DeviceId::Cpu)
            .unwrap();
        let geometry = Geometry::with_spacing([1.0; 3]).unwrap();
        let data = vec![0.0, 1.0, 0.0, 1.0, 0.0, 1.0, 0.0, 1.0];
        let volume = Volume::from_data([2, 2, 2], 1, geometry, data).unwrap();
        let batch: Vec<_> = tile(&volume, [2, 2, 2], [2, 2, 2], BlendMode::Constant, 0.0)
            .unwrap()
            .collect();

        let outputs = net.forward(&batch).unwrap();
        assert_eq!(outputs.len(), 1);
        let out = &outputs[0];
        assert_eq!(out.len(), 16);
        assert!(out[0] > 0.99 && out[8] < 0.01);
        assert!(out[1] < 0.01 && out[9] > 0.99);
        for v in 0..8 {
            assert!((out[v] + out[8 + v] - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_checkpoint_weights_point_to_backend_trait() {
        let checkpoint = WeightsBlob::new("M291.pt", b"PK\x03\x04archive".to_vec());
        let err = VoxelLinearBackend.load(&checkpoint, &spec(), DeviceId::Cpu).unwrap_err();
        assert!(matches!(err, SegError::ModelResolution(_)));
        let message = err.to_string();
        assert!(message.contains("M291.pt"));
        assert!(message.contains("Backend trait"));
    }
}

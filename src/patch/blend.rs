//! Blend weights for overlapping windows

use serde::{Deserialize, Serialize};

use crate::core::types::{voxel_count, Index3, Shape3};

/// Smallest weight a Gaussian kernel is allowed to reach at its corners
const GAUSSIAN_MIN_WEIGHT: f32 = 1e-3;

/// Per-voxel weighting of a window's output before summation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlendMode {
    /// Linear ramp over the overlap width on each side, flat in the middle
    #[default]
    Linear,
    /// Gaussian centered on the window, sigma = patch / 8 per axis
    Gaussian,
    /// Uniform weights
    Constant,
}

/// Separable weight mask for one patch shape
///
/// The 3D weight is the product of three 1D profiles. Every profile value is
/// strictly positive, so every voxel inside a window contributes.
#[derive(Debug, Clone, PartialEq)]
pub struct BlendKernel {
    shape: Shape3,
    profiles: [Vec<f32>; 3],
}

impl BlendKernel {
    pub fn new(patch_shape: Shape3, stride: Shape3, mode: BlendMode) -> Self {
        let profiles = [0, 1, 2].map(|axis| {
            let p = patch_shape[axis];
            let overlap = p.saturating_sub(stride[axis]);
            match mode {
                BlendMode::Constant => vec![1.0; p],
                BlendMode::Linear => linear_profile(p, overlap),
                BlendMode::Gaussian => gaussian_profile(p),
            }
        });
        Self {
            shape: patch_shape,
            profiles,
        }
    }

    pub fn shape(&self) -> Shape3 {
        self.shape
    }

    #[inline]
    pub fn weight(&self, local: Index3) -> f32 {
        self.profiles[0][local[0]] * self.profiles[1][local[1]] * self.profiles[2][local[2]]
    }

    /// Dense x-fastest weight volume, mainly for inspection
    pub fn to_dense(&self) -> Vec<f32> {
        let mut dense = Vec::with_capacity(voxel_count(self.shape));
        for k in 0..self.shape[2] {
            for j in 0..self.shape[1] {
                for i in 0..self.shape[0] {
                    dense.push(self.weight([i, j, k]));
                }
            }
        }
        dense
    }
}

/// `w(t) = min(1, (t+1)/(o+1), (p-t)/(o+1))`; all ones without overlap
fn linear_profile(p: usize, overlap: usize) -> Vec<f32> {
    if overlap == 0 {
        return vec![1.0; p];
    }
    let ramp = (overlap + 1) as f32;
    (0..p)
        .map(|t| {
            let rising = (t + 1) as f32 / ramp;
            let falling = (p - t) as f32 / ramp;
            rising.min(falling).min(1.0)
        })
        .collect()
}

fn gaussian_profile(p: usize) -> Vec<f32> {
    let sigma = (p as f32 / 8.0).max(0.5);
    let center = (p as f32 - 1.0) / 2.0;
    (0..p)
        .map(|t| {
            let d = t as f32 - center;
            (-(d * d) / (2.0 * sigma * sigma))
                .exp()
                .max(GAUSSIAN_MIN_WEIGHT)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_profile_tapers() {
        let profile = linear_profile(4, 2);
        let expected = [1.0 / 3.0, 2.0 / 3.0, 2.0 / 3.0, 1.0 / 3.0];
        for (w, e) in profile.iter().zip(expected) {
            assert!((w - e).abs() < 1e-6);
        }
        let wide = linear_profile(8, 2);
        assert_eq!(wide[3], 1.0);
        assert_eq!(wide[4], 1.0);
    }

    #[test]
    fn test_no_overlap_is_uniform() {
        let kernel = BlendKernel::new([4, 4, 4], [4, 4, 4], BlendMode::Linear);
        assert!(kernel.to_dense().iter().all(|&w| w == 1.0));
    }

    #[test]
    fn test_weights_strictly_positive() {
        for mode in [BlendMode::Linear, BlendMode::Gaussian, BlendMode::Constant] {
            let kernel = BlendKernel::new([16, 8, 5], [8, 4, 1], mode);
            assert!(kernel.to_dense().iter().all(|&w| w > 0.0), "{:?}", mode);
        }
    }

    #[test]
    fn test_gaussian_peaks_in_center() {
        let kernel = BlendKernel::new([9, 9, 9], [4, 4, 4], BlendMode::Gaussian);
        assert!((kernel.weight([4, 4, 4]) - 1.0).abs() < 1e-6);
        assert!(kernel.weight([0, 4, 4]) < kernel.weight([2, 4, 4]));
    }
}

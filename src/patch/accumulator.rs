//! Weighted reassembly of window outputs into one volume

use rayon::prelude::*;

use super::PatchOutput;
use crate::core::error::{Result, SegError};
use crate::core::types::{voxel_count, Shape3};
use crate::geometry::Geometry;
use crate::volume::Volume;

/// Running weighted sum and weight sum over a whole volume
///
/// Single writer: outputs are applied one at a time, in whatever order the
/// caller feeds them. Feeding them in tiling order makes the float sums, and
/// therefore the final volume, reproducible bit for bit.
#[derive(Debug)]
pub struct Accumulator {
    shape: Shape3,
    channels: usize,
    geometry: Geometry,
    sums: Vec<f32>,
    weights: Vec<f32>,
    applied: usize,
}

impl Accumulator {
    pub fn new(shape: Shape3, channels: usize, geometry: Geometry) -> Self {
        let voxels = voxel_count(shape);
        Self {
            shape,
            channels,
            geometry,
            sums: vec![0.0; voxels * channels],
            weights: vec![0.0; voxels],
            applied: 0,
        }
    }

    pub fn shape(&self) -> Shape3 {
        self.shape
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Outputs accumulated so far
    pub fn applied(&self) -> usize {
        self.applied
    }

    /// Add `output * blend_weight` into the sums and the weight into the weight sum
    pub fn accumulate(&mut self, output: &PatchOutput) -> Result<()> {
        if output.channels != self.channels {
            return Err(SegError::Geometry(format!(
                "patch output has {} channels, accumulator expects {}",
                output.channels, self.channels
            )));
        }
        let region = output.region;
        for axis in 0..3 {
            if region.origin[axis] + region.valid[axis] > self.shape[axis] {
                return Err(SegError::Geometry(format!(
                    "patch at {:?} with extent {:?} exceeds volume {:?}",
                    region.origin, region.valid, self.shape
                )));
            }
        }

        let [nx, ny, _] = self.shape;
        let voxels = voxel_count(self.shape);
        let patch_voxels = voxel_count(output.shape);
        let [px, py, _] = output.shape;

        for k in 0..region.valid[2] {
            for j in 0..region.valid[1] {
                for i in 0..region.valid[0] {
                    let w = output.kernel.weight([i, j, k]);
                    let dst = ((region.origin[2] + k) * ny + region.origin[1] + j) * nx
                        + region.origin[0]
                        + i;
                    let src = (k * py + j) * px + i;
                    self.weights[dst] += w;
                    for c in 0..self.channels {
                        self.sums[c * voxels + dst] += w * output.data[c * patch_voxels + src];
                    }
                }
            }
        }
        self.applied += 1;
        Ok(())
    }

    /// Smallest accumulated weight over all voxels
    pub fn min_weight(&self) -> f32 {
        self.weights.iter().copied().fold(f32::INFINITY, f32::min)
    }

    /// Divide sums by weight sums
    ///
    /// Voxels that never received weight are assigned entirely to channel 0
    /// (background).
    pub fn finalize(self) -> Result<Volume<f32>> {
        let voxels = voxel_count(self.shape);
        let uncovered = self.weights.iter().filter(|&&w| w <= 0.0).count();
        if uncovered > 0 {
            tracing::warn!(uncovered, "Voxels received no patch weight, defaulting to background");
        }

        let weights = &self.weights;
        let mut data = self.sums;
        data.par_chunks_mut(voxels)
            .enumerate()
            .for_each(|(channel, values)| {
                for (value, &w) in values.iter_mut().zip(weights.iter()) {
                    *value = if w > 0.0 {
                        *value / w
                    } else if channel == 0 {
                        1.0
                    } else {
                        0.0
                    };
                }
            });

        Volume::from_data(self.shape, self.channels, self.geometry, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::{tile, BlendMode, PatchOutput};

    #[test]
    fn test_constant_outputs_reassemble_exactly() {
        let geometry = Geometry::with_spacing([1.0; 3]).unwrap();
        let volume = Volume::<f32>::zeros([7, 6, 5], geometry).unwrap();
        let mut acc = Accumulator::new(volume.shape(), 2, geometry);

        for patch in tile(&volume, [4, 4, 4], [2, 3, 1], BlendMode::Linear, 0.0).unwrap() {
            let n = patch.voxels();
            let mut data = vec![0.25; n];
            data.extend(std::iter::repeat(0.75).take(n));
            acc.accumulate(&PatchOutput::for_patch(&patch, 2, data).unwrap())
                .unwrap();
        }
        assert!(acc.min_weight() > 0.0);

        let result = acc.finalize().unwrap();
        assert!(result.channel(0).iter().all(|v| (v - 0.25).abs() < 1e-6));
        assert!(result.channel(1).iter().all(|v| (v - 0.75).abs() < 1e-6));
    }

    #[test]
    fn test_uncovered_voxels_default_to_background() {
        let geometry = Geometry::with_spacing([1.0; 3]).unwrap();
        let acc = Accumulator::new([2, 2, 2], 3, geometry);
        let result = acc.finalize().unwrap();
        assert!(result.channel(0).iter().all(|&v| v == 1.0));
        assert!(result.channel(2).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_channel_mismatch_rejected() {
        let geometry = Geometry::with_spacing([1.0; 3]).unwrap();
        let volume = Volume::<f32>::zeros([4, 4, 4], geometry).unwrap();
        let patch = tile(&volume, [4, 4, 4], [4, 4, 4], BlendMode::Linear, 0.0)
            .unwrap()
            .next()
            .unwrap();
        let output = PatchOutput::for_patch(&patch, 1, vec![0.0; 64]).unwrap();
        let mut acc = Accumulator::new([4, 4, 4], 2, geometry);
        assert!(acc.accumulate(&output).is_err());
    }
}

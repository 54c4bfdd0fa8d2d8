//! Patch scheduling - sliding-window tiling and weighted reassembly
//!
//! A volume is covered by fixed-shape windows laid out on a regular grid with
//! the last window on every axis pulled back so it ends exactly on the volume
//! boundary. Windows are produced lazily by [`Tiler`]; their outputs are summed
//! with per-voxel blend weights in an [`Accumulator`] and normalized at the end.

pub mod accumulator;
pub mod blend;

pub use accumulator::Accumulator;
pub use blend::{BlendKernel, BlendMode};

use std::sync::Arc;

use crate::core::error::{Result, SegError};
use crate::core::types::{voxel_count, Index3, Shape3};
use crate::volume::Volume;

/// Window start positions along one axis
///
/// Starts at 0, advances by `stride`, and ends with a window anchored at
/// `n - patch` so the far edge is covered without overshooting. A volume
/// shorter than the patch gets a single window at 0.
pub fn axis_positions(n: usize, patch: usize, stride: usize) -> Vec<usize> {
    if n <= patch {
        return vec![0];
    }
    let last = n - patch;
    let mut positions: Vec<usize> = (0..last).step_by(stride).collect();
    positions.push(last);
    positions
}

/// The layout of all windows over one volume, without any voxel data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileGrid {
    volume_shape: Shape3,
    patch_shape: Shape3,
    stride: Shape3,
    positions: [Vec<usize>; 3],
}

impl TileGrid {
    pub fn new(volume_shape: Shape3, patch_shape: Shape3, stride: Shape3) -> Result<Self> {
        for axis in 0..3 {
            if patch_shape[axis] == 0 || stride[axis] == 0 {
                return Err(SegError::Config(format!(
                    "patch shape {:?} and stride {:?} must be positive",
                    patch_shape, stride
                )));
            }
            if stride[axis] > patch_shape[axis] {
                return Err(SegError::Config(format!(
                    "stride {:?} exceeds patch shape {:?}; voxels would be skipped",
                    stride, patch_shape
                )));
            }
        }
        let positions = [0, 1, 2]
            .map(|axis| axis_positions(volume_shape[axis], patch_shape[axis], stride[axis]));
        Ok(Self {
            volume_shape,
            patch_shape,
            stride,
            positions,
        })
    }

    /// Number of windows
    pub fn len(&self) -> usize {
        self.positions.iter().map(Vec::len).product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn patch_shape(&self) -> Shape3 {
        self.patch_shape
    }

    pub fn stride(&self) -> Shape3 {
        self.stride
    }

    pub fn volume_shape(&self) -> Shape3 {
        self.volume_shape
    }

    /// Region of the `seq`-th window in x-fastest order
    pub fn region(&self, seq: usize) -> Option<PatchRegion> {
        if seq >= self.len() {
            return None;
        }
        let nx = self.positions[0].len();
        let ny = self.positions[1].len();
        let origin = [
            self.positions[0][seq % nx],
            self.positions[1][(seq / nx) % ny],
            self.positions[2][seq / (nx * ny)],
        ];
        let valid = [0, 1, 2].map(|axis| {
            self.patch_shape[axis].min(self.volume_shape[axis] - origin[axis])
        });
        Some(PatchRegion { seq, origin, valid })
    }

    pub fn regions(&self) -> impl Iterator<Item = PatchRegion> + '_ {
        (0..self.len()).filter_map(move |seq| self.region(seq))
    }
}

/// Where a window sits in its volume
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchRegion {
    /// Position in tiling order, used to reassemble deterministically
    pub seq: usize,
    /// Index of the window's first voxel in the volume
    pub origin: Index3,
    /// Extent of the window that lies inside the volume
    pub valid: Shape3,
}

impl PatchRegion {
    #[inline]
    pub fn contains_local(&self, local: Index3) -> bool {
        local[0] < self.valid[0] && local[1] < self.valid[1] && local[2] < self.valid[2]
    }
}

/// One network input window
#[derive(Debug, Clone)]
pub struct Patch {
    pub region: PatchRegion,
    pub shape: Shape3,
    pub channels: usize,
    /// Channel-major, x-fastest, padded with background outside `region.valid`
    pub data: Vec<f32>,
    kernel: Arc<BlendKernel>,
}

impl Patch {
    /// Blend weight of a voxel, zero outside the valid extent
    #[inline]
    pub fn blend_weight(&self, local: Index3) -> f32 {
        if self.region.contains_local(local) {
            self.kernel.weight(local)
        } else {
            0.0
        }
    }

    pub fn kernel(&self) -> &Arc<BlendKernel> {
        &self.kernel
    }

    pub fn voxels(&self) -> usize {
        voxel_count(self.shape)
    }
}

/// Network output for one window: per-class probabilities on the patch grid
#[derive(Debug, Clone)]
pub struct PatchOutput {
    pub region: PatchRegion,
    pub shape: Shape3,
    pub channels: usize,
    pub data: Vec<f32>,
    pub kernel: Arc<BlendKernel>,
}

impl PatchOutput {
    /// Output for `patch` with the same window and blend weights
    pub fn for_patch(patch: &Patch, channels: usize, data: Vec<f32>) -> Result<Self> {
        if data.len() != channels * patch.voxels() {
            return Err(SegError::Geometry(format!(
                "output of {} values does not fit {} channels of patch {:?}",
                data.len(),
                channels,
                patch.shape
            )));
        }
        Ok(Self {
            region: patch.region,
            shape: patch.shape,
            channels,
            data,
            kernel: Arc::clone(&patch.kernel),
        })
    }
}

/// Lazy, pull-based window sequence over a volume
pub struct Tiler<'a> {
    volume: &'a Volume<f32>,
    grid: TileGrid,
    kernel: Arc<BlendKernel>,
    background: f32,
    next: usize,
}

/// Tile `volume` into windows of `patch_shape` advancing by `stride`
pub fn tile<'a>(
    volume: &'a Volume<f32>,
    patch_shape: Shape3,
    stride: Shape3,
    mode: BlendMode,
    background: f32,
) -> Result<Tiler<'a>> {
    let grid = TileGrid::new(volume.shape(), patch_shape, stride)?;
    let kernel = Arc::new(BlendKernel::new(patch_shape, stride, mode));
    Ok(Tiler {
        volume,
        grid,
        kernel,
        background,
        next: 0,
    })
}

impl<'a> Tiler<'a> {
    pub fn grid(&self) -> &TileGrid {
        &self.grid
    }

    pub fn kernel(&self) -> &Arc<BlendKernel> {
        &self.kernel
    }

    fn extract(&self, region: PatchRegion) -> Patch {
        let shape = self.grid.patch_shape;
        let channels = self.volume.channels();
        let patch_voxels = voxel_count(shape);
        let mut data = vec![self.background; patch_voxels * channels];

        for c in 0..channels {
            let src = self.volume.channel(c);
            let dst = &mut data[c * patch_voxels..(c + 1) * patch_voxels];
            for k in 0..region.valid[2] {
                for j in 0..region.valid[1] {
                    let src_start = self.volume.offset([
                        region.origin[0],
                        region.origin[1] + j,
                        region.origin[2] + k,
                    ]);
                    let dst_start = (k * shape[1] + j) * shape[0];
                    dst[dst_start..dst_start + region.valid[0]]
                        .copy_from_slice(&src[src_start..src_start + region.valid[0]]);
                }
            }
        }

        Patch {
            region,
            shape,
            channels,
            data,
            kernel: Arc::clone(&self.kernel),
        }
    }
}

impl<'a> Iterator for Tiler<'a> {
    type Item = Patch;

    fn next(&mut self) -> Option<Patch> {
        let region = self.grid.region(self.next)?;
        self.next += 1;
        Some(self.extract(region))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.grid.len() - self.next;
        (remaining, Some(remaining))
    }
}

impl<'a> ExactSizeIterator for Tiler<'a> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Geometry;

    #[test]
    fn test_axis_positions_back_anchor() {
        assert_eq!(axis_positions(10, 4, 2), vec![0, 2, 4, 6]);
        assert_eq!(axis_positions(11, 4, 3), vec![0, 3, 6, 7]);
        assert_eq!(axis_positions(8, 4, 4), vec![0, 4]);
        assert_eq!(axis_positions(3, 4, 2), vec![0]);
        assert_eq!(axis_positions(4, 4, 4), vec![0]);
    }

    #[test]
    fn test_stride_larger_than_patch_rejected() {
        assert!(TileGrid::new([10, 10, 10], [4, 4, 4], [5, 2, 2]).is_err());
        assert!(TileGrid::new([10, 10, 10], [4, 4, 4], [0, 2, 2]).is_err());
    }

    #[test]
    fn test_region_order_is_x_fastest() {
        let grid = TileGrid::new([10, 10, 10], [4, 4, 4], [2, 2, 2]).unwrap();
        assert_eq!(grid.len(), 64);
        assert_eq!(grid.region(1).unwrap().origin, [2, 0, 0]);
        assert_eq!(grid.region(4).unwrap().origin, [0, 2, 0]);
        assert_eq!(grid.region(63).unwrap().origin, [6, 6, 6]);
        assert!(grid.region(64).is_none());
    }

    #[test]
    fn test_small_volume_is_padded() {
        let geometry = Geometry::with_spacing([1.0; 3]).unwrap();
        let data: Vec<f32> = (0..8).map(|v| v as f32 + 1.0).collect();
        let volume = Volume::from_data([2, 2, 2], 1, geometry, data).unwrap();

        let patches: Vec<Patch> = tile(&volume, [4, 4, 4], [2, 2, 2], BlendMode::Linear, -9.0)
            .unwrap()
            .collect();
        assert_eq!(patches.len(), 1);
        let patch = &patches[0];
        assert_eq!(patch.region.valid, [2, 2, 2]);
        assert_eq!(patch.data[0], 1.0);
        assert_eq!(patch.data[1], 2.0);
        assert_eq!(patch.data[2], -9.0);
        assert_eq!(patch.data[(1 * 4 + 1) * 4 + 1], 8.0);
        assert!(patch.blend_weight([1, 1, 1]) > 0.0);
        assert_eq!(patch.blend_weight([2, 0, 0]), 0.0);
    }

    #[test]
    fn test_tiler_is_lazy_and_exact_size() {
        let geometry = Geometry::with_spacing([1.0; 3]).unwrap();
        let volume = Volume::<f32>::zeros([9, 5, 5], geometry).unwrap();
        let mut tiler = tile(&volume, [4, 4, 4], [3, 3, 3], BlendMode::Linear, 0.0).unwrap();
        // x: 0,3,5  y: 0,1  z: 0,1
        assert_eq!(tiler.len(), 12);
        tiler.next();
        assert_eq!(tiler.len(), 11);
    }
}

//! Dense voxel grids with physical geometry
//!
//! Storage is channel-major and x-fastest: voxel `(c, i, j, k)` lives at
//! `c * nx*ny*nz + k * nx*ny + j * nx + i`, which matches the raw layout of
//! MetaImage files so volumes can be read and written without reordering.

use crate::core::error::{Result, SegError};
use crate::core::types::{voxel_count, Index3, LabelId, Shape3};
use crate::geometry::Geometry;

/// Scalar types a volume can hold
pub trait Voxel: Copy + Default + PartialEq + Send + Sync + std::fmt::Debug + 'static {
    fn to_f32(self) -> f32;
    fn from_f32(value: f32) -> Self;
}

impl Voxel for f32 {
    #[inline]
    fn to_f32(self) -> f32 {
        self
    }
    #[inline]
    fn from_f32(value: f32) -> Self {
        value
    }
}

impl Voxel for u16 {
    #[inline]
    fn to_f32(self) -> f32 {
        self as f32
    }
    #[inline]
    fn from_f32(value: f32) -> Self {
        value.round().clamp(0.0, u16::MAX as f32) as u16
    }
}

/// A dense 3D (optionally multi-channel) grid with an index-to-physical affine
#[derive(Debug, Clone, PartialEq)]
pub struct Volume<T: Voxel> {
    shape: Shape3,
    channels: usize,
    geometry: Geometry,
    data: Vec<T>,
}

/// Integer segmentation in native geometry, 0 = background
pub type LabelMap = Volume<LabelId>;

impl<T: Voxel> Volume<T> {
    /// Volume filled with a constant value
    pub fn filled(shape: Shape3, channels: usize, geometry: Geometry, value: T) -> Result<Self> {
        check_shape(shape, channels)?;
        Ok(Self {
            shape,
            channels,
            geometry,
            data: vec![value; voxel_count(shape) * channels],
        })
    }

    /// Single-channel volume filled with `T::default()`
    pub fn zeros(shape: Shape3, geometry: Geometry) -> Result<Self> {
        Self::filled(shape, 1, geometry, T::default())
    }

    /// Wrap existing channel-major, x-fastest data
    pub fn from_data(shape: Shape3, channels: usize, geometry: Geometry, data: Vec<T>) -> Result<Self> {
        check_shape(shape, channels)?;
        let expected = voxel_count(shape) * channels;
        if data.len() != expected {
            return Err(SegError::Geometry(format!(
                "data length {} does not match shape {:?} x {} channels ({} voxels)",
                data.len(),
                shape,
                channels,
                expected
            )));
        }
        Ok(Self {
            shape,
            channels,
            geometry,
            data,
        })
    }

    pub fn shape(&self) -> Shape3 {
        self.shape
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Voxels per channel
    pub fn voxels(&self) -> usize {
        voxel_count(self.shape)
    }

    pub fn data(&self) -> &[T] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<T> {
        self.data
    }

    /// Flat offset of a voxel within one channel
    #[inline]
    pub fn offset(&self, index: Index3) -> usize {
        (index[2] * self.shape[1] + index[1]) * self.shape[0] + index[0]
    }

    #[inline]
    pub fn contains(&self, index: Index3) -> bool {
        index[0] < self.shape[0] && index[1] < self.shape[1] && index[2] < self.shape[2]
    }

    #[inline]
    pub fn get(&self, channel: usize, index: Index3) -> Option<T> {
        if channel < self.channels && self.contains(index) {
            Some(self.data[channel * self.voxels() + self.offset(index)])
        } else {
            None
        }
    }

    #[inline]
    pub fn set(&mut self, channel: usize, index: Index3, value: T) {
        if channel < self.channels && self.contains(index) {
            let at = channel * self.voxels() + self.offset(index);
            self.data[at] = value;
        }
    }

    /// Contiguous data of one channel
    pub fn channel(&self, channel: usize) -> &[T] {
        let n = self.voxels();
        &self.data[channel * n..(channel + 1) * n]
    }

    pub fn channel_mut(&mut self, channel: usize) -> &mut [T] {
        let n = self.voxels();
        &mut self.data[channel * n..(channel + 1) * n]
    }

    /// Same shape and geometry, different contents
    pub fn map<U: Voxel>(&self, f: impl Fn(T) -> U) -> Volume<U> {
        Volume {
            shape: self.shape,
            channels: self.channels,
            geometry: self.geometry,
            data: self.data.iter().map(|v| f(*v)).collect(),
        }
    }

    /// Whether two volumes describe the same voxel grid
    pub fn same_grid<U: Voxel>(&self, other: &Volume<U>) -> bool {
        self.shape == other.shape && self.geometry == other.geometry
    }

    /// Approximate heap footprint in bytes
    pub fn size_bytes(&self) -> u64 {
        (self.data.len() * std::mem::size_of::<T>()) as u64
    }
}

impl LabelMap {
    /// Empty (all background) label map on the given grid
    pub fn background(shape: Shape3, geometry: Geometry) -> Result<Self> {
        Self::zeros(shape, geometry)
    }

    /// Number of voxels carrying each non-background label, sorted by label
    pub fn label_counts(&self) -> Vec<(LabelId, usize)> {
        let mut counts: ahash::AHashMap<LabelId, usize> = ahash::AHashMap::new();
        for &label in self.data.iter().filter(|&&l| l != 0) {
            *counts.entry(label).or_default() += 1;
        }
        let mut counts: Vec<_> = counts.into_iter().collect();
        counts.sort_unstable();
        counts
    }
}

fn check_shape(shape: Shape3, channels: usize) -> Result<()> {
    if shape.iter().any(|&n| n == 0) || channels == 0 {
        return Err(SegError::Geometry(format!(
            "volume must be non-empty, got shape {:?} with {} channels",
            shape, channels
        )));
    }
    Ok(())
}

//! Physical geometry of voxel grids and resampling between grids

pub mod resample;

pub use resample::{resample, unresample, Interpolation, ResampleContext, Sampled};

use glam::{DAffine3, DMat3, DVec3};

use crate::core::error::{Result, SegError};
use crate::core::types::Spacing3;

/// Smallest |det| accepted for a direction matrix
const MIN_DIRECTION_DET: f64 = 1e-9;

/// Index-to-physical mapping of a voxel grid: `x = origin + direction * diag(spacing) * index`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Geometry {
    origin: DVec3,
    spacing: DVec3,
    direction: DMat3,
}

impl Geometry {
    /// Build a geometry, rejecting non-positive spacing and singular directions
    pub fn new(origin: [f64; 3], spacing: Spacing3, direction: DMat3) -> Result<Self> {
        if spacing.iter().any(|s| !s.is_finite() || *s <= 0.0) {
            return Err(SegError::Geometry(format!(
                "spacing must be strictly positive, got {:?}",
                spacing
            )));
        }
        if origin.iter().any(|o| !o.is_finite()) {
            return Err(SegError::Geometry(format!("origin is not finite: {:?}", origin)));
        }
        let det = direction.determinant();
        if !det.is_finite() || det.abs() < MIN_DIRECTION_DET {
            return Err(SegError::Geometry(format!(
                "direction matrix is singular (det = {})",
                det
            )));
        }
        Ok(Self {
            origin: DVec3::from_array(origin),
            spacing: DVec3::from_array(spacing),
            direction,
        })
    }

    /// Axis-aligned grid at the physical origin
    pub fn with_spacing(spacing: Spacing3) -> Result<Self> {
        Self::new([0.0; 3], spacing, DMat3::IDENTITY)
    }

    pub fn origin(&self) -> [f64; 3] {
        self.origin.to_array()
    }

    pub fn spacing(&self) -> Spacing3 {
        self.spacing.to_array()
    }

    pub fn direction(&self) -> DMat3 {
        self.direction
    }

    /// Same origin and direction, different voxel size
    pub fn respaced(&self, spacing: Spacing3) -> Result<Self> {
        Self::new(self.origin(), spacing, self.direction)
    }

    /// Affine taking continuous voxel indices to physical coordinates
    pub fn index_to_physical(&self) -> DAffine3 {
        DAffine3 {
            matrix3: self.direction * DMat3::from_diagonal(self.spacing),
            translation: self.origin,
        }
    }

    /// Affine taking physical coordinates to continuous voxel indices
    pub fn physical_to_index(&self) -> DAffine3 {
        self.index_to_physical().inverse()
    }

    /// Physical position of a voxel center
    pub fn voxel_center(&self, index: [f64; 3]) -> [f64; 3] {
        self.index_to_physical()
            .transform_point3(DVec3::from_array(index))
            .to_array()
    }
}

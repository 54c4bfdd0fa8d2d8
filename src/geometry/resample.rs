//! Resampling between the native image grid and a model grid
//!
//! The model grid shares the native origin and direction cosines and only
//! changes the voxel size. Both directions of the mapping are computed once
//! and stored in a [`ResampleContext`], so mapping back always uses the exact
//! inverse of the forward transform.
//!
//! The interpolation is chosen by voxel type through [`Sampled`]: intensities
//! (`f32`) are sampled trilinearly, labels (`u16`) with nearest neighbour.
//! There is no way to trilinearly interpolate a label volume.

use glam::{DAffine3, DVec3};
use rayon::prelude::*;

use super::Geometry;
use crate::core::error::{Result, SegError};
use crate::core::types::{Shape3, Spacing3};
use crate::volume::{Volume, Voxel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interpolation {
    Linear,
    Nearest,
}

/// Voxel types with a fixed interpolation rule
pub trait Sampled: Voxel {
    const INTERPOLATION: Interpolation;
}

impl Sampled for f32 {
    const INTERPOLATION: Interpolation = Interpolation::Linear;
}

impl Sampled for u16 {
    const INTERPOLATION: Interpolation = Interpolation::Nearest;
}

/// Everything needed to map a model-grid volume back onto the native grid
#[derive(Debug, Clone, PartialEq)]
pub struct ResampleContext {
    native_shape: Shape3,
    native_geometry: Geometry,
    model_shape: Shape3,
    model_geometry: Geometry,
    /// Model voxel index -> native voxel index
    model_to_native: DAffine3,
    /// Native voxel index -> model voxel index (exact inverse of the above)
    native_to_model: DAffine3,
}

impl ResampleContext {
    /// Plan a resampling of `native` onto a grid with `target_spacing`
    pub fn plan(
        native_shape: Shape3,
        native_geometry: &Geometry,
        target_spacing: Spacing3,
        target_shape_hint: Option<Shape3>,
    ) -> Result<Self> {
        let model_geometry = native_geometry.respaced(target_spacing)?;
        let model_shape = match target_shape_hint {
            Some(hint) => {
                if hint.iter().any(|&n| n == 0) {
                    return Err(SegError::Geometry(format!(
                        "target shape hint must be non-empty, got {:?}",
                        hint
                    )));
                }
                hint
            }
            None => model_shape_for(native_shape, native_geometry.spacing(), target_spacing),
        };

        let model_to_native =
            native_geometry.physical_to_index() * model_geometry.index_to_physical();
        let det = model_to_native.matrix3.determinant();
        if !det.is_finite() || det == 0.0 {
            return Err(SegError::Geometry(format!(
                "grid mapping is singular (det = {})",
                det
            )));
        }
        let native_to_model = model_to_native.inverse();

        Ok(Self {
            native_shape,
            native_geometry: *native_geometry,
            model_shape,
            model_geometry,
            model_to_native,
            native_to_model,
        })
    }

    pub fn native_shape(&self) -> Shape3 {
        self.native_shape
    }

    pub fn native_geometry(&self) -> &Geometry {
        &self.native_geometry
    }

    pub fn model_shape(&self) -> Shape3 {
        self.model_shape
    }

    pub fn model_geometry(&self) -> &Geometry {
        &self.model_geometry
    }

    /// Both grids have the same voxel size and shape, so no sampling is needed
    pub fn is_identity(&self) -> bool {
        self.native_shape == self.model_shape
            && self.native_geometry.spacing() == self.model_geometry.spacing()
    }
}

/// Model grid holding the nearest model voxel of every native voxel center
///
/// With shared origins the last native center sits at model index
/// `span = (n - 1) * s_native / s_target`, so the grid has `round(span) + 1`
/// voxels along each axis. Its last center is then at most half a model
/// voxel past the last native center.
pub fn model_shape_for(native_shape: Shape3, native_spacing: Spacing3, target_spacing: Spacing3) -> Shape3 {
    let mut shape = [1usize; 3];
    for axis in 0..3 {
        let span = native_shape[axis].saturating_sub(1) as f64 * native_spacing[axis] / target_spacing[axis];
        shape[axis] = span.round().max(0.0) as usize + 1;
    }
    shape
}

/// Resample `volume` onto a grid with `target_spacing`
///
/// Samples falling outside the native image take `background`.
pub fn resample<T: Sampled>(
    volume: &Volume<T>,
    target_spacing: Spacing3,
    target_shape_hint: Option<Shape3>,
    background: T,
) -> Result<(Volume<T>, ResampleContext)> {
    let context = ResampleContext::plan(
        volume.shape(),
        volume.geometry(),
        target_spacing,
        target_shape_hint,
    )?;

    if context.is_identity() {
        let copy = Volume::from_data(
            context.model_shape,
            volume.channels(),
            context.model_geometry,
            volume.data().to_vec(),
        )?;
        return Ok((copy, context));
    }

    let data = sample_grid(
        volume,
        context.model_shape,
        &context.model_to_native,
        half_voxel(context.model_geometry.spacing(), context.native_geometry.spacing()),
        background,
    );
    let resampled = Volume::from_data(
        context.model_shape,
        volume.channels(),
        context.model_geometry,
        data,
    )?;

    tracing::debug!(
        from = ?volume.shape(),
        to = ?context.model_shape,
        spacing = ?target_spacing,
        "Resampled volume to model grid"
    );
    Ok((resampled, context))
}

/// Map a model-grid volume back onto the native grid recorded in `context`
pub fn unresample<T: Sampled>(volume: &Volume<T>, context: &ResampleContext, background: T) -> Result<Volume<T>> {
    if volume.shape() != context.model_shape {
        return Err(SegError::Geometry(format!(
            "volume shape {:?} does not match the model grid {:?}",
            volume.shape(),
            context.model_shape
        )));
    }

    let data = if context.is_identity() {
        volume.data().to_vec()
    } else {
        sample_grid(
            volume,
            context.native_shape,
            &context.native_to_model,
            half_voxel(context.native_geometry.spacing(), context.model_geometry.spacing()),
            background,
        )
    };

    Volume::from_data(
        context.native_shape,
        volume.channels(),
        context.native_geometry,
        data,
    )
}

/// How far past the first and last source centers an output center may fall:
/// half an output voxel in source index units, never less than half a source voxel
fn half_voxel(output_spacing: Spacing3, source_spacing: Spacing3) -> DVec3 {
    let ratio = DVec3::from_array(output_spacing) / DVec3::from_array(source_spacing);
    (ratio * 0.5).max(DVec3::splat(0.5))
}

/// Sample every voxel of an output grid from `source` through `output_to_source`
///
/// An output voxel is inside when its mapped center lies within `reach` of the
/// source grid's outer centers along every axis.
fn sample_grid<T: Sampled>(
    source: &Volume<T>,
    output_shape: Shape3,
    output_to_source: &DAffine3,
    reach: DVec3,
    background: T,
) -> Vec<T> {
    let [nx, ny, nz] = output_shape;
    let slice_len = nx * ny;
    let mut data = vec![background; slice_len * nz * source.channels()];

    // One chunk per (channel, z) slice
    data.par_chunks_mut(slice_len)
        .enumerate()
        .for_each(|(chunk, slice)| {
            let channel = chunk / nz;
            let k = chunk % nz;
            let src = source.channel(channel);
            for j in 0..ny {
                for i in 0..nx {
                    let pos = output_to_source
                        .transform_point3(DVec3::new(i as f64, j as f64, k as f64));
                    let value = match T::INTERPOLATION {
                        Interpolation::Nearest => sample_nearest(src, source.shape(), pos, reach),
                        Interpolation::Linear => sample_linear(src, source.shape(), pos, reach),
                    };
                    if let Some(value) = value {
                        slice[j * nx + i] = value;
                    }
                }
            }
        });

    data
}

/// Clamp a continuous index into `[0, n - 1]` if it lies within `reach` of the grid
#[inline]
fn footprint_clamp(pos: f64, n: usize, reach: f64) -> Option<f64> {
    if pos < -reach || pos > (n - 1) as f64 + reach {
        None
    } else {
        Some(pos.clamp(0.0, (n - 1) as f64))
    }
}

#[inline]
fn sample_nearest<T: Voxel>(src: &[T], shape: Shape3, pos: DVec3, reach: DVec3) -> Option<T> {
    let x = footprint_clamp(pos.x, shape[0], reach.x)?;
    let y = footprint_clamp(pos.y, shape[1], reach.y)?;
    let z = footprint_clamp(pos.z, shape[2], reach.z)?;
    // Half-up rounding keeps ties deterministic across platforms
    let i = ((x + 0.5).floor() as usize).min(shape[0] - 1);
    let j = ((y + 0.5).floor() as usize).min(shape[1] - 1);
    let k = ((z + 0.5).floor() as usize).min(shape[2] - 1);
    Some(src[(k * shape[1] + j) * shape[0] + i])
}

#[inline]
fn sample_linear<T: Voxel>(src: &[T], shape: Shape3, pos: DVec3, reach: DVec3) -> Option<T> {
    let x = footprint_clamp(pos.x, shape[0], reach.x)?;
    let y = footprint_clamp(pos.y, shape[1], reach.y)?;
    let z = footprint_clamp(pos.z, shape[2], reach.z)?;

    let (x0, fx) = split(x, shape[0]);
    let (y0, fy) = split(y, shape[1]);
    let (z0, fz) = split(z, shape[2]);
    let x1 = (x0 + 1).min(shape[0] - 1);
    let y1 = (y0 + 1).min(shape[1] - 1);
    let z1 = (z0 + 1).min(shape[2] - 1);

    let at = |i: usize, j: usize, k: usize| src[(k * shape[1] + j) * shape[0] + i].to_f32() as f64;

    let c00 = at(x0, y0, z0) * (1.0 - fx) + at(x1, y0, z0) * fx;
    let c10 = at(x0, y1, z0) * (1.0 - fx) + at(x1, y1, z0) * fx;
    let c01 = at(x0, y0, z1) * (1.0 - fx) + at(x1, y0, z1) * fx;
    let c11 = at(x0, y1, z1) * (1.0 - fx) + at(x1, y1, z1) * fx;
    let c0 = c00 * (1.0 - fy) + c10 * fy;
    let c1 = c01 * (1.0 - fy) + c11 * fy;
    Some(T::from_f32((c0 * (1.0 - fz) + c1 * fz) as f32))
}

#[inline]
fn split(pos: f64, n: usize) -> (usize, f64) {
    let base = (pos.floor() as usize).min(n - 1);
    (base, pos - base as f64)
}

//! Per-offset patch weights with a smooth-disc radial falloff.
//!
//! Patch-edge offsets carry less reliable structure than the center, so
//! their contribution to patch distances is down-weighted. The profile is
//! built once per run in physical units (1.0 inside a disc of radius
//! `r/2`, a cubic Hermite blend down to 0.0 between `r/2` and `r + 1`)
//! and then resampled into voxel-index space with the image's per-axis
//! spacing, so anisotropic voxels get anisotropic effective extents.

use crate::error::DenoiseError;
use crate::float_trait::DenoiseFloat;
use crate::patch::PatchShape;

/// Build the `L`-length weight table for a patch shape.
///
/// With `use_smooth_disc` off every offset weighs 1.0. Otherwise the
/// smooth-disc profile is rasterized in physical space and resampled into
/// the voxel grid; the resampled center weight is verified to be exactly
/// 1.0 and all weights land in `[0, 1]`.
pub fn compute_patch_weights<F: DenoiseFloat>(
    shape: &PatchShape,
    physical_radius: f64,
    spacing: &[f64],
    use_smooth_disc: bool,
) -> Result<Vec<F>, DenoiseError> {
    if !use_smooth_disc {
        return Ok(vec![F::one(); shape.len()]);
    }

    for (axis, &s) in spacing.iter().enumerate() {
        if !(s.is_finite() && s > 0.0) {
            return Err(DenoiseError::DegenerateSpacing { axis, spacing: s });
        }
    }

    let raster = PhysicalRaster::new(physical_radius, spacing.len());

    // resample into the voxel grid, centered on the raster center so the
    // central voxel samples the profile peak exactly
    let voxel_radius = shape.radius();
    let diameter = shape.diameter();
    let dims = spacing.len();
    let mut weights = Vec::with_capacity(shape.len());
    let mut voxel = vec![0usize; dims];
    for _ in 0..shape.len() {
        let physical: Vec<f64> = (0..dims)
            .map(|d| (voxel[d] as f64 - voxel_radius[d] as f64) * spacing[d])
            .collect();
        let w = raster.interpolate(&physical).clamp(0.0, 1.0);
        weights.push(w);
        increment_index(&mut voxel, &diameter);
    }

    let center = shape.center();
    if (weights[center] - 1.0).abs() > 1e-10 {
        return Err(DenoiseError::WeightCenterNotUnity {
            got: weights[center],
        });
    }
    weights[center] = 1.0;

    Ok(weights.into_iter().map(F::from_f64_c).collect())
}

/// Smooth-disc profile sampled on an integer grid in physical units.
struct PhysicalRaster {
    values: Vec<f64>,
    half_extent: usize,
    extent: usize,
    dims: usize,
}

impl PhysicalRaster {
    fn new(radius: f64, dims: usize) -> Self {
        let half_extent = radius.ceil() as usize;
        let extent = 2 * half_extent + 1;
        let total: usize = (0..dims).map(|_| extent).product();

        let mut values = Vec::with_capacity(total);
        let mut index = vec![0usize; dims];
        let extents = vec![extent; dims];
        for _ in 0..total {
            let dist = index
                .iter()
                .map(|&i| {
                    let p = i as f64 - half_extent as f64;
                    p * p
                })
                .sum::<f64>()
                .sqrt();
            values.push(disc_profile(dist, radius));
            increment_index(&mut index, &extents);
        }

        Self {
            values,
            half_extent,
            extent,
            dims,
        }
    }

    /// Multilinear interpolation at a physical position; zero outside.
    fn interpolate(&self, physical: &[f64]) -> f64 {
        let coords: Vec<f64> = physical
            .iter()
            .map(|&p| p + self.half_extent as f64)
            .collect();

        let mut value = 0.0;
        for corner in 0..(1usize << self.dims) {
            let mut weight = 1.0;
            let mut offset = 0usize;
            let mut in_bounds = true;
            for d in 0..self.dims {
                let base = coords[d].floor();
                let frac = coords[d] - base;
                let (cell, w) = if corner & (1 << d) == 0 {
                    (base, 1.0 - frac)
                } else {
                    (base + 1.0, frac)
                };
                if w == 0.0 {
                    weight = 0.0;
                    break;
                }
                if cell < 0.0 || cell >= self.extent as f64 {
                    in_bounds = false;
                    break;
                }
                weight *= w;
                offset = offset * self.extent + cell as usize;
            }
            if weight != 0.0 && in_bounds {
                value += weight * self.values[offset];
            }
        }
        value
    }
}

/// Radial falloff: unity disc, cubic Hermite shoulder, zero outside.
fn disc_profile(dist: f64, radius: f64) -> f64 {
    let disc_radius = radius / 2.0;
    let outer = radius + 1.0;
    if dist >= outer {
        0.0
    } else if dist <= disc_radius {
        1.0
    } else {
        let interval = outer - disc_radius;
        let t = outer - dist;
        let w = (-2.0 / interval.powi(3)) * t.powi(3) + (3.0 / interval.powi(2)) * t.powi(2);
        w.clamp(0.0, 1.0)
    }
}

fn increment_index(index: &mut [usize], extents: &[usize]) {
    for d in (0..index.len()).rev() {
        index[d] += 1;
        if index[d] < extents[d] {
            return;
        }
        index[d] = 0;
    }
}

//! Patch geometry: the hyper-cube of offsets compared between image locations.
//!
//! A patch is never materialized as its own pixel container. It is a set of
//! per-axis displacements around a center pixel, enumerated once per run in
//! row-major order together with their flat-offset deltas, so that walking a
//! patch at any location is a sequence of integer additions. Offsets that
//! fall outside the image near a boundary are tracked with a boolean mask,
//! never clamped.

use crate::float_trait::DenoiseFloat;
use crate::image::VectorImage;

/// Fixed patch geometry for one image shape.
#[derive(Debug, Clone)]
pub struct PatchShape {
    radius: Vec<usize>,
    image_size: Vec<usize>,
    /// Per-offset, per-axis displacement from the center, row-major order.
    offsets: Vec<Vec<isize>>,
    /// Per-offset flat-index delta for the image's row-major strides.
    flat_deltas: Vec<isize>,
}

impl PatchShape {
    /// Enumerate the `(2r+1)^D` patch offsets for an image shape.
    pub fn new<F: DenoiseFloat>(radius: &[usize], image: &VectorImage<F>) -> Self {
        assert_eq!(radius.len(), image.ndim());
        let diameter: Vec<usize> = radius.iter().map(|&r| 2 * r + 1).collect();
        let length: usize = diameter.iter().product();
        let strides = image.strides();

        let mut offsets = Vec::with_capacity(length);
        let mut flat_deltas = Vec::with_capacity(length);
        for flat in 0..length {
            let mut rem = flat;
            let mut offset = vec![0isize; radius.len()];
            for d in (0..radius.len()).rev() {
                offset[d] = (rem % diameter[d]) as isize - radius[d] as isize;
                rem /= diameter[d];
            }
            let delta: isize = offset
                .iter()
                .zip(strides.iter())
                .map(|(&o, &s)| o * s as isize)
                .sum();
            offsets.push(offset);
            flat_deltas.push(delta);
        }

        Self {
            radius: radius.to_vec(),
            image_size: image.size().to_vec(),
            offsets,
            flat_deltas,
        }
    }

    /// Number of offsets in the patch (`L`).
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Index of the central offset, `(L - 1) / 2`.
    pub fn center(&self) -> usize {
        (self.len() - 1) / 2
    }

    pub fn radius(&self) -> &[usize] {
        &self.radius
    }

    /// Per-axis patch diameter `2r + 1`.
    pub fn diameter(&self) -> Vec<usize> {
        self.radius.iter().map(|&r| 2 * r + 1).collect()
    }

    /// Flat-offset delta of patch offset `j` under the image's strides.
    ///
    /// Valid only for offsets that are in bounds at the location where the
    /// delta is applied; pair with [`PatchShape::in_bounds_mask`].
    #[inline]
    pub fn flat_delta(&self, j: usize) -> isize {
        self.flat_deltas[j]
    }

    /// Per-offset in-bounds flags for a patch centered at `center_index`.
    pub fn in_bounds_mask(&self, center_index: &[usize]) -> Vec<bool> {
        self.offsets
            .iter()
            .map(|offset| {
                offset
                    .iter()
                    .zip(center_index.iter().zip(self.image_size.iter()))
                    .all(|(&o, (&i, &n))| {
                        let pos = i as isize + o;
                        pos >= 0 && (pos as usize) < n
                    })
            })
            .collect()
    }

    /// Whether the whole patch is in bounds at `center_index`.
    pub fn fully_in_bounds(&self, center_index: &[usize]) -> bool {
        center_index
            .iter()
            .zip(self.radius.iter().zip(self.image_size.iter()))
            .all(|(&i, (&r, &n))| i >= r && i + r < n)
    }
}

/// Convert a physical patch radius into per-axis voxel radii.
///
/// Anisotropic voxels get anisotropic patch extents: each axis divides the
/// physical radius by its spacing, truncating, with a floor of one voxel.
pub fn radius_in_voxels(physical_radius: f64, spacing: &[f64]) -> Vec<usize> {
    spacing
        .iter()
        .map(|&s| ((physical_radius / s).floor() as usize).max(1))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::VectorImage;

    #[test]
    fn test_offsets_row_major_and_center() {
        let img = VectorImage::<f64>::new(&[8, 8], 1, &[1.0, 1.0]);
        let shape = PatchShape::new(&[1, 1], &img);

        assert_eq!(shape.len(), 9);
        assert_eq!(shape.center(), 4);
        // center offset has zero displacement and zero flat delta
        assert_eq!(shape.offsets[4], vec![0, 0]);
        assert_eq!(shape.flat_delta(4), 0);
        // first offset is the top-left corner
        assert_eq!(shape.offsets[0], vec![-1, -1]);
        assert_eq!(shape.flat_delta(0), -9);
        // last offset is the bottom-right corner
        assert_eq!(shape.offsets[8], vec![1, 1]);
        assert_eq!(shape.flat_delta(8), 9);
    }

    #[test]
    fn test_anisotropic_patch_length() {
        let img = VectorImage::<f64>::new(&[10, 10, 10], 1, &[1.0, 1.0, 1.0]);
        let shape = PatchShape::new(&[2, 1, 1], &img);
        assert_eq!(shape.len(), 5 * 3 * 3);
        assert_eq!(shape.diameter(), vec![5, 3, 3]);
    }

    #[test]
    fn test_in_bounds_mask_interior_and_corner() {
        let img = VectorImage::<f64>::new(&[5, 5], 1, &[1.0, 1.0]);
        let shape = PatchShape::new(&[1, 1], &img);

        let interior = shape.in_bounds_mask(&[2, 2]);
        assert!(interior.iter().all(|&b| b), "interior patch fully in bounds");
        assert!(shape.fully_in_bounds(&[2, 2]));

        let corner = shape.in_bounds_mask(&[0, 0]);
        assert!(!shape.fully_in_bounds(&[0, 0]));
        // only the 2x2 lower-right quadrant of the 3x3 patch is in bounds
        assert_eq!(corner.iter().filter(|&&b| b).count(), 4);
        assert!(corner[shape.center()], "center offset always in bounds");
        assert!(!corner[0], "top-left offset out of bounds at the corner");
    }

    #[test]
    fn test_radius_in_voxels() {
        assert_eq!(radius_in_voxels(2.0, &[1.0, 1.0]), vec![2, 2]);
        assert_eq!(radius_in_voxels(4.0, &[1.0, 2.0]), vec![4, 2]);
        // truncating division
        assert_eq!(radius_in_voxels(2.0, &[0.8, 1.0]), vec![2, 2]);
        // never below one voxel
        assert_eq!(radius_in_voxels(1.0, &[3.0]), vec![1]);
    }
}

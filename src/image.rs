//! In-memory vector image and rectangular region model.
//!
//! The denoiser does not own image I/O; it consumes a [`VectorImage`]: a
//! D-dimensional grid of fixed-length pixel vectors with per-axis spacing.
//! Pixel storage is a single `(total_pixels, components)` array addressed
//! by row-major flat offsets, which keeps patch arithmetic to integer
//! offset additions.

use ndarray::{Array2, ArrayView1, ArrayViewMut1};

use crate::float_trait::DenoiseFloat;

/// A D-dimensional image of C-component pixels with physical spacing.
#[derive(Debug, Clone)]
pub struct VectorImage<F: DenoiseFloat> {
    data: Array2<F>,
    size: Vec<usize>,
    strides: Vec<usize>,
    spacing: Vec<f64>,
}

impl<F: DenoiseFloat> VectorImage<F> {
    /// Create a zero-filled image.
    ///
    /// # Panics
    /// Panics if `size` is empty or any extent is zero.
    pub fn new(size: &[usize], components: usize, spacing: &[f64]) -> Self {
        let total = checked_total(size);
        Self {
            data: Array2::zeros((total, components)),
            size: size.to_vec(),
            strides: row_major_strides(size),
            spacing: spacing.to_vec(),
        }
    }

    /// Wrap an existing `(total_pixels, components)` pixel buffer.
    ///
    /// # Panics
    /// Panics if the buffer's row count does not match the product of `size`.
    pub fn from_data(size: &[usize], spacing: &[f64], data: Array2<F>) -> Self {
        let total = checked_total(size);
        assert_eq!(
            data.nrows(),
            total,
            "pixel buffer has {} rows but the image geometry implies {}",
            data.nrows(),
            total
        );
        Self {
            data,
            size: size.to_vec(),
            strides: row_major_strides(size),
            spacing: spacing.to_vec(),
        }
    }

    pub fn ndim(&self) -> usize {
        self.size.len()
    }

    pub fn size(&self) -> &[usize] {
        &self.size
    }

    pub fn spacing(&self) -> &[f64] {
        &self.spacing
    }

    pub fn components(&self) -> usize {
        self.data.ncols()
    }

    pub fn total_pixels(&self) -> usize {
        self.data.nrows()
    }

    /// Row-major strides (in pixels) for flat-offset arithmetic.
    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    /// Component values of the pixel at a flat offset.
    #[inline]
    pub fn pixel(&self, offset: usize) -> ArrayView1<'_, F> {
        self.data.row(offset)
    }

    #[inline]
    pub fn pixel_mut(&mut self, offset: usize) -> ArrayViewMut1<'_, F> {
        self.data.row_mut(offset)
    }

    /// The underlying `(total_pixels, components)` buffer.
    pub fn data(&self) -> &Array2<F> {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut Array2<F> {
        &mut self.data
    }

    /// Flat offset of a multi-dimensional index.
    #[inline]
    pub fn offset_of(&self, index: &[usize]) -> usize {
        debug_assert_eq!(index.len(), self.size.len());
        index
            .iter()
            .zip(self.strides.iter())
            .map(|(i, s)| i * s)
            .sum()
    }

    /// Multi-dimensional index of a flat offset.
    pub fn index_of(&self, offset: usize) -> Vec<usize> {
        let mut index = vec![0; self.size.len()];
        let mut rem = offset;
        for (d, stride) in self.strides.iter().enumerate() {
            index[d] = rem / stride;
            rem %= stride;
        }
        index
    }

    /// The full-image region.
    pub fn region(&self) -> ImageRegion {
        ImageRegion {
            index: vec![0; self.size.len()],
            size: self.size.clone(),
        }
    }
}

fn checked_total(size: &[usize]) -> usize {
    assert!(!size.is_empty(), "image must have at least one dimension");
    assert!(
        size.iter().all(|&s| s > 0),
        "image extents must be nonzero, got {size:?}"
    );
    size.iter().product()
}

fn row_major_strides(size: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; size.len()];
    for d in (0..size.len().saturating_sub(1)).rev() {
        strides[d] = strides[d + 1] * size[d + 1];
    }
    strides
}

/// A rectangular sub-region of an image: per-axis start index and extent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRegion {
    pub index: Vec<usize>,
    pub size: Vec<usize>,
}

impl ImageRegion {
    pub fn num_pixels(&self) -> usize {
        self.size.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.size.iter().any(|&s| s == 0)
    }

    /// Whether a multi-dimensional index lies inside the region.
    pub fn contains(&self, index: &[usize]) -> bool {
        index
            .iter()
            .zip(self.index.iter().zip(self.size.iter()))
            .all(|(&i, (&start, &len))| i >= start && i < start + len)
    }
}

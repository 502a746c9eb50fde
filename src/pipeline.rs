//! Per-iteration image update: entropy gradient plus fidelity pull.
//!
//! Every pixel's next value is computed from the previous iterate only and
//! staged into a shadow update buffer; a separate publish step copies the
//! buffer into the live image once all workers are done. No worker ever
//! writes the live image during the update scan, so pixel processing order
//! across workers cannot affect the result.

use std::ops::Range;

use log::warn;
use ndarray::{Array2, ArrayViewMut2, Axis};
use rayon::prelude::*;

use crate::float_trait::DenoiseFloat;
use crate::image::VectorImage;
use crate::patch::PatchShape;
use crate::sampling::{patch_constraint_region, PatchSampler};

/// Internal step size for the entropy-gradient term; small enough to avoid
/// update instabilities.
const STEP_SIZE_SMOOTHING: f64 = 0.2;

/// Gradient factor of the Gaussian-noise fidelity term.
const FIDELITY_GRADIENT_FACTOR: f64 = 2.0;

/// One worker's share of the pixel domain plus its private sampler clone.
pub(crate) struct Worker {
    pub range: Range<usize>,
    pub sampler: PatchSampler,
}

/// Partition `total` pixels into contiguous near-equal chunks, one per
/// worker. Chunk boundaries depend only on `total` and `workers`, which is
/// what makes results reproducible for a fixed thread count.
pub(crate) fn chunk_ranges(total: usize, workers: usize) -> Vec<Range<usize>> {
    let count = workers.clamp(1, total.max(1));
    let base = total / count;
    let extra = total % count;
    let mut ranges = Vec::with_capacity(count);
    let mut start = 0;
    for i in 0..count {
        let len = base + usize::from(i < extra);
        ranges.push(start..start + len);
        start += len;
    }
    ranges
}

/// Read-only inputs shared by every worker during one update scan.
pub(crate) struct UpdateParams<'a, F: DenoiseFloat> {
    /// Previous iterate (the live output image); read-only during the scan.
    pub image: &'a VectorImage<F>,
    /// The original noisy observation, for the fidelity term.
    pub original: &'a VectorImage<F>,
    pub shape: &'a PatchShape,
    pub patch_weights: &'a [F],
    /// Per-component kernel sigma, raw intensity units.
    pub sigma: &'a [F],
    pub smoothing_weight: F,
    pub fidelity_weight: F,
    pub min_probability: F,
}

/// Compute the next iterate for every pixel into `update`, in parallel.
///
/// `update` rows are partitioned to match the worker ranges, so each worker
/// owns its slice exclusively and no locking is needed. When
/// `gradient_capture` is provided, the raw entropy-gradient field is staged
/// into it alongside the update (diagnostic raster).
pub(crate) fn compute_image_update<F: DenoiseFloat>(
    params: &UpdateParams<'_, F>,
    workers: &mut [Worker],
    update: &mut Array2<F>,
    gradient_capture: Option<&mut Array2<F>>,
    pool: &rayon::ThreadPool,
) {
    let chunk_lens: Vec<usize> = workers.iter().map(|w| w.range.len()).collect();
    let update_chunks = split_rows(update.view_mut(), &chunk_lens);
    let grad_chunks: Vec<Option<ArrayViewMut2<'_, F>>> = match gradient_capture {
        Some(buf) => split_rows(buf.view_mut(), &chunk_lens)
            .into_iter()
            .map(Some)
            .collect(),
        None => workers.iter().map(|_| None).collect(),
    };

    pool.install(|| {
        workers
            .par_iter_mut()
            .zip(update_chunks.into_par_iter().zip(grad_chunks))
            .for_each(|(worker, (mut chunk, mut grad_chunk))| {
                scan_worker(params, worker, &mut chunk, grad_chunk.as_mut());
            });
    });
}

/// Publish the staged update into the live image (two-phase commit).
pub(crate) fn apply_update<F: DenoiseFloat>(update: &Array2<F>, image: &mut VectorImage<F>) {
    image.data_mut().assign(update);
}

fn split_rows<'a, F>(
    mut view: ArrayViewMut2<'a, F>,
    lens: &[usize],
) -> Vec<ArrayViewMut2<'a, F>> {
    let mut chunks = Vec::with_capacity(lens.len());
    for &len in lens {
        let (head, tail) = view.split_at(Axis(0), len);
        chunks.push(head);
        view = tail;
    }
    chunks
}

fn scan_worker<F: DenoiseFloat>(
    params: &UpdateParams<'_, F>,
    worker: &mut Worker,
    update_chunk: &mut ArrayViewMut2<'_, F>,
    mut grad_chunk: Option<&mut ArrayViewMut2<'_, F>>,
) {
    let components = params.image.components();
    let mut result = vec![F::zero(); components];

    worker.sampler.set_can_select_query(true);

    for (row, offset) in worker.range.clone().enumerate() {
        let current = params.image.pixel(offset);
        for c in 0..components {
            result[c] = current[c];
        }

        if params.smoothing_weight > F::zero() {
            match compute_gradient_joint_entropy(params, worker, offset) {
                Some(gradient) => {
                    for c in 0..components {
                        result[c] += params.smoothing_weight
                            * F::from_f64_c(STEP_SIZE_SMOOTHING)
                            * gradient[c];
                    }
                    if let Some(grad) = grad_chunk.as_mut() {
                        for c in 0..components {
                            grad.row_mut(row)[c] = gradient[c];
                        }
                    }
                }
                None => {
                    // recoverable: this pixel keeps a zero entropy term for
                    // this iteration
                    warn!("image update: empty patch sample at offset {offset}, skipping entropy term");
                }
            }
        }

        if params.fidelity_weight > F::zero() {
            // Gaussian noise model; other models are rejected at
            // initialization
            let original = params.original.pixel(offset);
            for c in 0..components {
                result[c] += params.fidelity_weight
                    * F::from_f64_c(FIDELITY_GRADIENT_FACTOR)
                    * (original[c] - current[c]);
            }
        }

        for c in 0..components {
            update_chunk.row_mut(row)[c] = result[c];
        }
    }
}

/// Kernel-weighted mean-shift direction for one pixel.
///
/// Draws a patch sample set (self-selection allowed here, unlike the sigma
/// pass), accumulates a Gaussian kernel over weighted patch distances and
/// returns the kernel-weighted mean of center differences. Only offsets
/// that are in bounds for the query patch contribute; the constraint region
/// guarantees every candidate is at least as in-bounds as the query.
fn compute_gradient_joint_entropy<F: DenoiseFloat>(
    params: &UpdateParams<'_, F>,
    worker: &mut Worker,
    offset: usize,
) -> Option<Vec<F>> {
    let image = params.image;
    let shape = params.shape;
    let components = image.components();
    let length = shape.len();
    let center = shape.center();

    let index = image.index_of(offset);
    let constraint = patch_constraint_region(&index, shape.radius(), image.size());
    let selected = match worker.sampler.search(&index, &constraint, image.strides()) {
        Ok(s) if !s.is_empty() => s,
        Ok(_) => return None,
        Err(_) => return None,
    };

    // cache the query patch and its in-bounds mask once
    let mask = shape.in_bounds_mask(&index);
    let mut query_vals = vec![F::zero(); length * components];
    for j in 0..length {
        if !mask[j] {
            continue;
        }
        let qoff = (offset as isize + shape.flat_delta(j)) as usize;
        let pixel = image.pixel(qoff);
        for c in 0..components {
            query_vals[j * components + c] = pixel[c];
        }
    }

    let mut sum_of_gaussians = F::zero();
    let mut gradient = vec![F::zero(); components];
    let mut center_difference = vec![F::zero(); components];

    for &selected_offset in &selected {
        let mut distance = F::zero();
        for c in 0..components {
            let sigma = params.sigma[c];
            let mut squared_norm = F::zero();
            for j in 0..length {
                if !mask[j] {
                    continue;
                }
                let soff = (selected_offset as isize + shape.flat_delta(j)) as usize;
                let diff = params.patch_weights[j]
                    * (image.pixel(soff)[c] - query_vals[j * components + c]);
                squared_norm += diff * diff;
                if j == center {
                    center_difference[c] = diff;
                }
            }
            distance += squared_norm / (sigma * sigma);
        }

        let gaussian = (-distance / F::from_f64_c(2.0)).exp();
        sum_of_gaussians += gaussian;
        for c in 0..components {
            gradient[c] += center_difference[c] * gaussian;
        }
    }

    for g in gradient.iter_mut() {
        *g /= sum_of_gaussians + params.min_probability;
    }
    Some(gradient)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::VectorImage;
    use crate::patch::PatchShape;
    use crate::sampling::PatchSampler;

    fn test_pool() -> rayon::ThreadPool {
        rayon::ThreadPoolBuilder::new()
            .num_threads(2)
            .build()
            .unwrap()
    }

    fn make_workers(total: usize, count: usize, sampler: &PatchSampler) -> Vec<Worker> {
        chunk_ranges(total, count)
            .into_iter()
            .enumerate()
            .map(|(i, range)| Worker {
                range,
                sampler: sampler.clone_for_worker(i as u64),
            })
            .collect()
    }

    // ==================== Chunking Tests ====================

    #[test]
    fn test_chunk_ranges_cover_domain() {
        for (total, workers) in [(100, 4), (7, 3), (5, 8), (1, 1)] {
            let ranges = chunk_ranges(total, workers);
            assert_eq!(ranges[0].start, 0);
            assert_eq!(ranges.last().unwrap().end, total);
            for pair in ranges.windows(2) {
                assert_eq!(pair[0].end, pair[1].start, "chunks must be contiguous");
            }
            let sum: usize = ranges.iter().map(|r| r.len()).sum();
            assert_eq!(sum, total);
        }
    }

    #[test]
    fn test_chunk_ranges_never_more_chunks_than_pixels() {
        let ranges = chunk_ranges(3, 8);
        assert_eq!(ranges.len(), 3);
        assert!(ranges.iter().all(|r| !r.is_empty()));
    }

    // ==================== Update Engine Tests ====================

    #[test]
    fn test_zero_weights_leave_image_unchanged() {
        let mut image = VectorImage::<f64>::new(&[8, 8], 1, &[1.0, 1.0]);
        for off in 0..64 {
            image.pixel_mut(off)[0] = (off % 13) as f64;
        }
        let original = image.clone();
        let shape = PatchShape::new(&[2, 2], &image);
        let weights = vec![1.0f64; shape.len()];
        let sampler = PatchSampler::uniform(vec![4, 4], 8);
        let mut workers = make_workers(64, 2, &sampler);
        let mut update = Array2::zeros((64, 1));
        let pool = test_pool();

        let params = UpdateParams {
            image: &image,
            original: &original,
            shape: &shape,
            patch_weights: &weights,
            sigma: &[1.0],
            smoothing_weight: 0.0,
            fidelity_weight: 0.0,
            min_probability: f64::MIN_POSITIVE,
        };
        compute_image_update(&params, &mut workers, &mut update, None, &pool);

        assert_eq!(
            update,
            *image.data(),
            "with both weights zero the update must equal the input exactly"
        );
    }

    #[test]
    fn test_fidelity_term_pulls_toward_original() {
        // current iterate differs from the original; a pure fidelity update
        // must move every pixel toward the original value
        let mut original = VectorImage::<f64>::new(&[6, 6], 1, &[1.0, 1.0]);
        for off in 0..36 {
            original.pixel_mut(off)[0] = 10.0;
        }
        let mut image = original.clone();
        for off in 0..36 {
            image.pixel_mut(off)[0] = 4.0;
        }
        let shape = PatchShape::new(&[1, 1], &image);
        let weights = vec![1.0f64; shape.len()];
        let sampler = PatchSampler::uniform(vec![3, 3], 4);
        let mut workers = make_workers(36, 2, &sampler);
        let mut update = Array2::zeros((36, 1));
        let pool = test_pool();

        let params = UpdateParams {
            image: &image,
            original: &original,
            shape: &shape,
            patch_weights: &weights,
            sigma: &[1.0],
            smoothing_weight: 0.0,
            fidelity_weight: 0.1,
            min_probability: f64::MIN_POSITIVE,
        };
        compute_image_update(&params, &mut workers, &mut update, None, &pool);

        for off in 0..36 {
            // 4.0 + 0.1 * 2.0 * (10.0 - 4.0) = 5.2
            assert!(
                (update[[off, 0]] - 5.2).abs() < 1e-12,
                "fidelity update wrong at {off}: {}",
                update[[off, 0]]
            );
        }
    }

    #[test]
    fn test_entropy_gradient_zero_on_uniform_image() {
        // all patches identical: every center difference is zero, so the
        // entropy gradient vanishes and the image is a fixed point
        let mut image = VectorImage::<f64>::new(&[8, 8], 1, &[1.0, 1.0]);
        for off in 0..64 {
            image.pixel_mut(off)[0] = 3.5;
        }
        let original = image.clone();
        let shape = PatchShape::new(&[1, 1], &image);
        let weights = vec![1.0f64; shape.len()];
        let sampler = PatchSampler::uniform(vec![4, 4], 8);
        let mut workers = make_workers(64, 2, &sampler);
        let mut update = Array2::zeros((64, 1));
        let pool = test_pool();

        let params = UpdateParams {
            image: &image,
            original: &original,
            shape: &shape,
            patch_weights: &weights,
            sigma: &[1.0],
            smoothing_weight: 1.0,
            fidelity_weight: 0.0,
            min_probability: f64::MIN_POSITIVE,
        };
        compute_image_update(&params, &mut workers, &mut update, None, &pool);

        for off in 0..64 {
            assert!(
                (update[[off, 0]] - 3.5).abs() < 1e-12,
                "uniform image must be a fixed point, got {} at {off}",
                update[[off, 0]]
            );
        }
    }

    #[test]
    fn test_gradient_capture_shape_and_content() {
        let mut image = VectorImage::<f64>::new(&[8, 8], 1, &[1.0, 1.0]);
        for off in 0..64 {
            image.pixel_mut(off)[0] = ((off * 7) % 11) as f64;
        }
        let original = image.clone();
        let shape = PatchShape::new(&[1, 1], &image);
        let weights = vec![1.0f64; shape.len()];
        let sampler = PatchSampler::uniform(vec![4, 4], 8);
        let mut workers = make_workers(64, 2, &sampler);
        let mut update = Array2::zeros((64, 1));
        let mut gradient = Array2::zeros((64, 1));
        let pool = test_pool();

        let params = UpdateParams {
            image: &image,
            original: &original,
            shape: &shape,
            patch_weights: &weights,
            sigma: &[5.0],
            smoothing_weight: 1.0,
            fidelity_weight: 0.0,
            min_probability: f64::MIN_POSITIVE,
        };
        compute_image_update(&params, &mut workers, &mut update, Some(&mut gradient), &pool);

        // the staged update must equal current + 0.2 * gradient
        for off in 0..64 {
            let expected = image.pixel(off)[0] + 0.2 * gradient[[off, 0]];
            assert!(
                (update[[off, 0]] - expected).abs() < 1e-12,
                "update/gradient mismatch at {off}"
            );
        }
    }

    #[test]
    fn test_apply_update_publishes_buffer() {
        let mut image = VectorImage::<f64>::new(&[4, 4], 2, &[1.0, 1.0]);
        let mut update = Array2::zeros((16, 2));
        for off in 0..16 {
            update[[off, 0]] = off as f64;
            update[[off, 1]] = -(off as f64);
        }

        apply_update(&update, &mut image);
        for off in 0..16 {
            assert_eq!(image.pixel(off)[0], off as f64);
            assert_eq!(image.pixel(off)[1], -(off as f64));
        }
    }

    #[test]
    fn test_boundary_pixels_produce_finite_updates() {
        // minimal legal image: size == 2 * radius + 1 in every axis; the
        // single interior pixel's patch spans the whole image
        let mut image = VectorImage::<f64>::new(&[5, 5], 1, &[1.0, 1.0]);
        for off in 0..25 {
            image.pixel_mut(off)[0] = ((off * 3) % 7) as f64;
        }
        let original = image.clone();
        let shape = PatchShape::new(&[2, 2], &image);
        let weights = vec![1.0f64; shape.len()];
        let sampler = PatchSampler::uniform(vec![4, 4], 8);
        let mut workers = make_workers(25, 2, &sampler);
        let mut update = Array2::zeros((25, 1));
        let pool = test_pool();

        let params = UpdateParams {
            image: &image,
            original: &original,
            shape: &shape,
            patch_weights: &weights,
            sigma: &[2.0],
            smoothing_weight: 1.0,
            fidelity_weight: 0.1,
            min_probability: f64::MIN_POSITIVE,
        };
        compute_image_update(&params, &mut workers, &mut update, None, &pool);

        for off in 0..25 {
            assert!(
                update[[off, 0]].is_finite(),
                "non-finite update at boundary pixel {off}"
            );
        }
    }
}

//! Newton-Raphson estimation of the Gaussian kernel bandwidth.
//!
//! For each pixel component the estimator searches for the kernel sigma
//! that maximizes a joint-entropy objective over patch differences, using
//! closed-form first and second derivatives of the entropy with respect to
//! sigma. The scan is decimated (a fixed fraction of pixels participate),
//! restricted to pixels whose patch is fully in bounds, and parallelized
//! over worker chunks with a single-threaded reduction.
//!
//! Intensities are rescaled to a working range of 100 during estimation to
//! keep the derivatives well conditioned; the user's multiplication factor
//! is divided out before each estimation round and re-applied afterwards so
//! it never compounds.

use log::{debug, warn};
use rayon::prelude::*;

use crate::error::DenoiseError;
use crate::float_trait::DenoiseFloat;
use crate::image::VectorImage;
use crate::patch::PatchShape;
use crate::pipeline::Worker;
use crate::sampling::patch_constraint_region;

/// Maximum number of Newton-Raphson rounds per estimation call.
pub const MAX_SIGMA_UPDATE_ITERATIONS: usize = 20;

/// Relative convergence tolerance: a component is converged once its update
/// magnitude drops below `sigma * tolerance`.
pub const SIGMA_UPDATE_CONVERGENCE_TOLERANCE: f64 = 0.01;

/// Largest allowed relative Newton step; larger updates are clamped.
const SIGMA_STEP_FRACTION: f64 = 0.3;

/// Working intensity range used while estimating.
const INTENSITY_RESCALE_RANGE: f64 = 100.0;

/// Initial sigma as a fraction of the working intensity range.
const INITIAL_SIGMA_FRACTION: f64 = 0.1;

/// Guard for constant image components during rescale-factor computation.
const RANGE_EPSILON: f64 = 1e-10;

/// Per-component kernel bandwidth state, persistent across iterations.
#[derive(Debug)]
pub struct BandwidthEstimator<F: DenoiseFloat> {
    /// Sigma per component, in raw intensity units, multiplier applied.
    sigma: Vec<F>,
    converged: Vec<bool>,
    min_sigma: F,
    min_probability: F,
    rescale_inv_factor: Vec<F>,
    decimation_factor: usize,
    multiplication_factor: F,
    compute_conditional_derivatives: bool,
    total_pixels: usize,
}

/// Entropy-derivative sums produced by one worker's decimated scan.
struct DerivativeAccumulator<F> {
    first: Vec<F>,
    second: Vec<F>,
    valid: bool,
}

impl<F: DenoiseFloat> BandwidthEstimator<F> {
    /// Set up bandwidth state from the input image statistics.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        image: &VectorImage<F>,
        fraction_pixels: f64,
        multiplication_factor: f64,
        initial_sigma: Option<F>,
        do_estimation: bool,
        compute_conditional_derivatives: bool,
    ) -> Result<Self, DenoiseError> {
        let components = image.components();
        let total_pixels = image.total_pixels();
        let min_sigma = F::min_positive_value();
        let multiplier = F::from_f64_c(multiplication_factor);

        // per-component intensity range, guarded so constant components
        // degrade to a unit rescale instead of an infinite one
        let mut rescale_inv_factor = Vec::with_capacity(components);
        for c in 0..components {
            let col = image.data().column(c);
            let lo = col.iter().copied().fold(F::infinity(), F::min);
            let hi = col.iter().copied().fold(F::neg_infinity(), F::max);
            let range = (hi - lo).max(F::from_f64_c(RANGE_EPSILON));
            rescale_inv_factor.push(F::from_f64_c(INTENSITY_RESCALE_RANGE) / range);
        }

        let mut sigma = Vec::with_capacity(components);
        for c in 0..components {
            let s = match initial_sigma {
                Some(s) => s,
                // 10% of the intensity range, expressed in raw units
                None => F::from_f64_c(INTENSITY_RESCALE_RANGE * INITIAL_SIGMA_FRACTION)
                    / rescale_inv_factor[c],
            };
            if !do_estimation && s <= min_sigma {
                return Err(DenoiseError::InvalidConfig(format!(
                    "initial kernel sigma {s:?} for component {c} is not above the minimum"
                )));
            }
            sigma.push(s * multiplier);
        }

        // keep one pixel out of every `decimation_factor`, but always use at
        // least 1% of the image
        let mut decimation = (1.0 / fraction_pixels).round() as usize;
        decimation = decimation.min(((total_pixels as f64) / 100.0).round().max(1.0) as usize);
        let decimation_factor = decimation.max(1);

        Ok(Self {
            sigma,
            converged: vec![false; components],
            min_sigma,
            min_probability: F::min_positive_value(),
            rescale_inv_factor,
            decimation_factor,
            multiplication_factor: multiplier,
            compute_conditional_derivatives,
            total_pixels,
        })
    }

    /// Current per-component sigma in raw intensity units.
    pub fn sigma(&self) -> &[F] {
        &self.sigma
    }

    pub fn min_probability(&self) -> F {
        self.min_probability
    }

    pub fn decimation_factor(&self) -> usize {
        self.decimation_factor
    }

    /// Run one estimation round: up to [`MAX_SIGMA_UPDATE_ITERATIONS`]
    /// Newton-Raphson steps over a decimated pixel subsample.
    ///
    /// Returns the last per-component update magnitudes (diagnostic).
    /// Exhausting the iteration budget without convergence is accepted
    /// silently.
    pub(crate) fn update(
        &mut self,
        image: &VectorImage<F>,
        shape: &PatchShape,
        workers: &mut [Worker],
        pool: &rayon::ThreadPool,
    ) -> Vec<F> {
        let components = image.components();
        self.converged = vec![false; components];

        // back out the multiplication factor prior to optimizing, and work
        // in the rescaled intensity domain
        for c in 0..components {
            self.sigma[c] = self.sigma[c] / self.multiplication_factor * self.rescale_inv_factor[c];
        }

        let mut deltas = vec![F::zero(); components];
        for round in 0..MAX_SIGMA_UPDATE_ITERATIONS {
            let accumulators: Vec<DerivativeAccumulator<F>> = pool.install(|| {
                workers
                    .par_iter_mut()
                    .map(|worker| self.scan_worker(image, shape, worker))
                    .collect()
            });

            deltas = self.resolve_update(&accumulators);
            debug!(
                "sigma round {round}: sigma {:?}, update {:?}",
                self.sigma, deltas
            );

            let mut all_converged = true;
            for c in 0..components {
                if !self.converged[c] {
                    if deltas[c].abs()
                        < self.sigma[c] * F::from_f64_c(SIGMA_UPDATE_CONVERGENCE_TOLERANCE)
                    {
                        self.converged[c] = true;
                    } else {
                        all_converged = false;
                    }
                }
            }
            if all_converged {
                break;
            }
        }

        // undo the rescale and put the multiplication factor back in
        for c in 0..components {
            self.sigma[c] = self.sigma[c] / self.rescale_inv_factor[c] * self.multiplication_factor;
        }
        deltas
    }

    /// Decimated derivative scan over one worker's chunk of the image.
    ///
    /// Only pixels whose patch is fully in bounds participate; the sampler
    /// runs with self-selection off (density estimation convention; the
    /// image-update pass differs, see `pipeline`).
    fn scan_worker(
        &self,
        image: &VectorImage<F>,
        shape: &PatchShape,
        worker: &mut Worker,
    ) -> DerivativeAccumulator<F> {
        let components = image.components();
        let length = shape.len();
        let center = shape.center();
        let length_f = F::usize_as(length);

        let mut accum = DerivativeAccumulator {
            first: vec![F::zero(); components],
            second: vec![F::zero(); components],
            valid: false,
        };
        let mut nbhd_first = vec![F::zero(); components];
        let mut nbhd_second = vec![F::zero(); components];

        worker.sampler.set_can_select_query(false);

        let mut query_vals = vec![F::zero(); length * components];
        let mut interior_count = 0usize;
        for offset in worker.range.clone() {
            let index = image.index_of(offset);
            if !shape.fully_in_bounds(&index) {
                continue;
            }
            let kept = interior_count % self.decimation_factor == 0;
            interior_count += 1;
            if !kept {
                continue;
            }

            let constraint = patch_constraint_region(&index, shape.radius(), image.size());
            let selected =
                match worker
                    .sampler
                    .search(&index, &constraint, image.strides())
                {
                    Ok(s) if !s.is_empty() => s,
                    Ok(_) => {
                        warn!("sigma scan: empty search result at offset {offset}, skipping");
                        continue;
                    }
                    Err(err) => {
                        warn!("sigma scan: search failed at offset {offset}: {err}");
                        continue;
                    }
                };

            // cache the query patch once per kept pixel
            for j in 0..length {
                let qoff = (offset as isize + shape.flat_delta(j)) as usize;
                let pixel = image.pixel(qoff);
                for c in 0..components {
                    query_vals[j * components + c] = pixel[c];
                }
            }

            let num_patches = F::usize_as(selected.len());
            let mut prob = vec![F::zero(); components];
            let mut prob_first = vec![F::zero(); components];
            let mut prob_second = vec![F::zero(); components];
            let mut patch_prob = vec![F::zero(); components];
            let mut patch_first = vec![F::zero(); components];
            let mut patch_second = vec![F::zero(); components];

            for &selected_offset in &selected {
                for c in 0..components {
                    if self.converged[c] {
                        continue;
                    }
                    let sigma_kernel = self.sigma[c];
                    let rescale = self.rescale_inv_factor[c];

                    let mut squared_norm = F::zero();
                    let mut center_difference = F::zero();
                    for j in 0..length {
                        let soff = (selected_offset as isize + shape.flat_delta(j)) as usize;
                        let diff =
                            rescale * (query_vals[j * components + c] - image.pixel(soff)[c]);
                        squared_norm += diff * diff;
                        if j == center {
                            center_difference = diff;
                        }
                    }

                    let gaussian = (-squared_norm / (sigma_kernel * sigma_kernel)
                        / F::from_f64_c(2.0))
                    .exp();
                    let factor = squared_norm / sigma_kernel.powi(3) - length_f / sigma_kernel;

                    prob[c] += gaussian;
                    prob_first[c] += gaussian * factor;
                    prob_second[c] += gaussian
                        * (factor * factor + length_f / (sigma_kernel * sigma_kernel)
                            - F::from_f64_c(3.0) * squared_norm / sigma_kernel.powi(4));

                    if self.compute_conditional_derivatives {
                        let patch_sq = squared_norm - center_difference * center_difference;
                        let patch_gaussian = (-patch_sq
                            / (sigma_kernel * sigma_kernel)
                            / F::from_f64_c(2.0))
                        .exp();
                        let patch_factor = patch_sq / sigma_kernel.powi(3)
                            - (length_f - F::one()) / sigma_kernel;
                        patch_prob[c] += patch_gaussian;
                        patch_first[c] += patch_gaussian * patch_factor;
                        patch_second[c] += patch_gaussian
                            * (patch_factor * patch_factor
                                + (length_f - F::one()) / (sigma_kernel * sigma_kernel)
                                - F::from_f64_c(3.0) * patch_sq / sigma_kernel.powi(4));
                    }
                }
            }

            for c in 0..components {
                if self.converged[c] {
                    continue;
                }
                let p = prob[c] / num_patches + self.min_probability;
                let pf = prob_first[c] / num_patches + self.min_probability;
                let ps = prob_second[c] / num_patches + self.min_probability;
                accum.first[c] -= pf / p;
                accum.second[c] -= ps / p - (pf / p) * (pf / p);

                if self.compute_conditional_derivatives {
                    let p = patch_prob[c] / num_patches + self.min_probability;
                    let pf = patch_first[c] / num_patches + self.min_probability;
                    let ps = patch_second[c] / num_patches + self.min_probability;
                    nbhd_first[c] -= pf / p;
                    nbhd_second[c] -= ps / p - (pf / p) * (pf / p);
                }
            }
            accum.valid = true;
        }

        if self.compute_conditional_derivatives {
            for c in 0..components {
                accum.first[c] -= nbhd_first[c];
                accum.second[c] -= nbhd_second[c];
            }
        }
        accum
    }

    /// Combine worker accumulators and apply one guarded Newton step per
    /// unconverged component.
    fn resolve_update(&mut self, accumulators: &[DerivativeAccumulator<F>]) -> Vec<F> {
        let components = self.sigma.len();
        let total = F::usize_as(self.total_pixels);
        let mut deltas = vec![F::zero(); components];

        for c in 0..components {
            if self.converged[c] {
                continue;
            }
            let mut first = F::zero();
            let mut second = F::zero();
            for accum in accumulators.iter().filter(|a| a.valid) {
                first += accum.first[c];
                second += accum.second[c];
            }
            first /= total;
            second /= total;

            let (new_sigma, delta) =
                newton_step(first, second, self.sigma[c], self.min_sigma);
            self.sigma[c] = new_sigma;
            deltas[c] = delta;
        }
        deltas
    }
}

/// One guarded Newton-Raphson step for a single component.
///
/// Degeneracy policy: a vanishing second derivative yields a unit step to
/// escape the flat region; a negative second derivative falls back to a
/// damped gradient step of `0.3 * sigma`; any step larger than
/// `0.3 * sigma` is clamped; a step that would drop sigma below the floor
/// averages sigma with the floor instead.
fn newton_step<F: DenoiseFloat>(first: F, second: F, sigma: F, min_sigma: F) -> (F, F) {
    let step_limit = sigma * F::from_f64_c(SIGMA_STEP_FRACTION);

    let mut delta = if second == F::zero() {
        debug!("sigma update: zero second derivative, unit step");
        F::one()
    } else if second < F::zero() {
        debug!("sigma update: negative second derivative, damped step");
        -first.signum() * step_limit
    } else {
        -first / second
    };

    if delta.abs() > step_limit {
        debug!("sigma update: restricting large update");
        delta = delta.signum() * step_limit;
    }

    let new_sigma = if sigma + delta < min_sigma {
        debug!("sigma update: floor reached, averaging with minimum");
        (sigma + min_sigma) / F::from_f64_c(2.0)
    } else {
        sigma + delta
    };
    (new_sigma, delta)
}

//! Random patch selection around a query location.
//!
//! Given a query pixel, the sampler draws a bounded set of other in-image
//! locations to compare patches against. Draws are confined to the
//! intersection of a per-query constraint region and a search window around
//! the query. Two selection policies exist: uniform within the window, and
//! Gaussian around the query with rejection sampling. An out-of-window
//! Gaussian draw is redrawn, never clamped; clamping would pile
//! probability mass onto the window edge.
//!
//! Each worker thread owns an independent clone with its own seed, so
//! results depend only on the worker index, not on thread scheduling.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::error::SamplerError;
use crate::image::ImageRegion;

/// Candidate selection policy, a closed set of variants.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SamplingPolicy {
    /// Uniform draws within the search window.
    Uniform,
    /// Gaussian draws centered on the query, with the given variance in
    /// voxel units, rejection-sampled into the window.
    Gaussian { variance: f64 },
}

/// Bounded random sampler of patch-center locations.
#[derive(Debug, Clone)]
pub struct PatchSampler {
    policy: SamplingPolicy,
    search_radius: Vec<usize>,
    max_results: usize,
    can_select_query: bool,
    seed: u64,
    rng: StdRng,
}

impl PatchSampler {
    /// Uniform-random sampler over a window of `search_radius` voxels.
    pub fn uniform(search_radius: Vec<usize>, max_results: usize) -> Self {
        Self::new(SamplingPolicy::Uniform, search_radius, max_results)
    }

    /// Gaussian-random sampler with the given variance (voxel units).
    pub fn gaussian(search_radius: Vec<usize>, variance: f64, max_results: usize) -> Self {
        assert!(variance > 0.0, "Gaussian variance must be positive");
        Self::new(
            SamplingPolicy::Gaussian { variance },
            search_radius,
            max_results,
        )
    }

    fn new(policy: SamplingPolicy, search_radius: Vec<usize>, max_results: usize) -> Self {
        assert!(max_results > 0, "max_results must be positive");
        Self {
            policy,
            search_radius,
            max_results,
            can_select_query: true,
            seed: 0,
            rng: StdRng::seed_from_u64(0),
        }
    }

    pub fn policy(&self) -> SamplingPolicy {
        self.policy
    }

    pub fn search_radius(&self) -> &[usize] {
        &self.search_radius
    }

    pub fn max_results(&self) -> usize {
        self.max_results
    }

    /// Whether the query point itself may appear among the results.
    pub fn set_can_select_query(&mut self, allow: bool) {
        self.can_select_query = allow;
    }

    pub fn can_select_query(&self) -> bool {
        self.can_select_query
    }

    /// Reseed the random stream.
    pub fn set_seed(&mut self, seed: u64) {
        self.seed = seed;
        self.rng = StdRng::seed_from_u64(seed);
    }

    /// Independent clone for a worker thread, deterministically seeded.
    pub fn clone_for_worker(&self, worker_seed: u64) -> Self {
        let mut clone = self.clone();
        clone.set_seed(worker_seed);
        clone
    }

    /// Draw up to `max_results` candidate locations for a query pixel.
    ///
    /// The search window is the per-axis intersection of
    /// `[query - search_radius, query + search_radius]` with `constraint`.
    /// Returns flat offsets under the given row-major `strides`. Draws are
    /// with replacement; duplicates may appear.
    pub fn search(
        &mut self,
        query_index: &[usize],
        constraint: &ImageRegion,
        strides: &[usize],
    ) -> Result<Vec<usize>, SamplerError> {
        if constraint.is_empty() {
            return Err(SamplerError::EmptyConstraintRegion);
        }
        if !constraint.contains(query_index) {
            let query = query_index
                .iter()
                .zip(strides.iter())
                .map(|(i, s)| i * s)
                .sum();
            return Err(SamplerError::QueryOutsideConstraint { query });
        }

        let dims = query_index.len();
        let mut start = vec![0usize; dims];
        let mut end = vec![0usize; dims];
        let mut window_volume = 1usize;
        for d in 0..dims {
            let lo = query_index[d].saturating_sub(self.search_radius[d]);
            let hi = query_index[d] + self.search_radius[d];
            start[d] = lo.max(constraint.index[d]);
            end[d] = hi.min(constraint.index[d] + constraint.size[d] - 1);
            window_volume *= end[d] - start[d] + 1;
        }

        let mut wanted = self.max_results.min(window_volume);
        if !self.can_select_query {
            // the window always contains the query; with self-selection off
            // there is one fewer admissible point
            if window_volume == 1 {
                return Err(SamplerError::OnlyQueryInWindow);
            }
            wanted = wanted.min(window_volume - 1);
        }

        let mut results = Vec::with_capacity(wanted);
        let mut index = vec![0usize; dims];
        while results.len() < wanted {
            for d in 0..dims {
                index[d] = self.draw_axis(query_index[d], start[d], end[d]);
            }
            if !self.can_select_query && index == query_index {
                continue;
            }
            let offset = index
                .iter()
                .zip(strides.iter())
                .map(|(i, s)| i * s)
                .sum();
            results.push(offset);
        }
        Ok(results)
    }

    #[inline]
    fn draw_axis(&mut self, query: usize, start: usize, end: usize) -> usize {
        match self.policy {
            SamplingPolicy::Uniform => self.rng.random_range(start..=end),
            SamplingPolicy::Gaussian { variance } => {
                let std_dev = variance.sqrt();
                // rejection sampling: redraw until the variate lands in the
                // window; clamping would bias the draw toward the boundary
                loop {
                    let z: f64 = self.rng.sample(StandardNormal);
                    let candidate = (query as f64 + z * std_dev).round();
                    if candidate >= start as f64 && candidate <= end as f64 {
                        return candidate as usize;
                    }
                }
            }
        }
    }
}

/// Constraint region for a query patch: every candidate drawn from it has a
/// patch with the same out-of-bounds axes as the query patch, or fewer.
///
/// Per axis the admissible range is `min(i, r) ..= max(i, size - r - 1)`,
/// the symmetric shrink that makes boundary patches comparable without
/// special-casing individual offsets.
pub fn patch_constraint_region(
    query_index: &[usize],
    radius: &[usize],
    image_size: &[usize],
) -> ImageRegion {
    let mut index = vec![0usize; query_index.len()];
    let mut size = vec![0usize; query_index.len()];
    for d in 0..query_index.len() {
        let start = query_index[d].min(radius[d]);
        let end = query_index[d].max(image_size[d] - radius[d] - 1);
        index[d] = start;
        size[d] = end - start + 1;
    }
    ImageRegion { index, size }
}

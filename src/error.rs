//! Error types for the denoising core.
//!
//! Fatal initialization errors abort a run and propagate out of
//! [`crate::orchestration::PatchBasedDenoiser::run`]; per-pixel sampling
//! anomalies are surfaced as [`SamplerError`], logged by the caller and
//! skipped without affecting control flow.

use thiserror::Error;

use crate::orchestration::NoiseModel;

/// Fatal errors raised during filter initialization or configuration.
#[derive(Debug, Error)]
pub enum DenoiseError {
    /// The patch does not fit inside the image along some axis.
    #[error(
        "patch is larger than the image along axis {axis}: image extent {extent}, \
         patch diameter {diameter}; use a smaller patch radius"
    )]
    PatchTooLarge {
        axis: usize,
        extent: usize,
        diameter: usize,
    },

    /// No patch sampler was supplied before `run` was called.
    #[error("no patch sampler configured; supply one before running the filter")]
    NoSampler,

    /// Image spacing is unusable for resampling the patch weights.
    #[error("degenerate spacing {spacing} along axis {axis}; cannot resample patch weights")]
    DegenerateSpacing { axis: usize, spacing: f64 },

    /// The resampled weight table lost the exact unit weight at the patch center.
    #[error("patch weight at the center offset is {got}, expected exactly 1.0")]
    WeightCenterNotUnity { got: f64 },

    /// A configuration parameter failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The selected noise model has no fidelity-term implementation.
    #[error("noise model {0:?} is not implemented; only Gaussian is supported")]
    UnimplementedNoiseModel(NoiseModel),

    /// Image and configuration disagree on basic geometry.
    #[error("image has {image_dims} dimensions but spacing has {spacing_dims} entries")]
    DimensionMismatch {
        image_dims: usize,
        spacing_dims: usize,
    },
}

/// Recoverable per-query failures from the patch sampler.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SamplerError {
    /// The constraint region handed to `search` contains no pixels.
    #[error("constraint region is empty; no candidate patches to draw from")]
    EmptyConstraintRegion,

    /// The query point lies outside the constraint region.
    #[error("query offset {query} falls outside the constraint region")]
    QueryOutsideConstraint { query: usize },

    /// The only admissible candidate is the query itself, which is excluded.
    #[error("search window contains only the query point and self-selection is disabled")]
    OnlyQueryInWindow,
}

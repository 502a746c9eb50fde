//! Patch-Based Denoising Core Library
//!
//! Pure Rust implementation of a patch-based iterative denoiser for
//! multi-component images: each pixel is pulled toward a kernel-weighted
//! combination of similar patches sampled elsewhere in the image, with the
//! kernel bandwidth estimated automatically by Newton-Raphson optimization
//! over a decimated pixel subsample. This crate contains the algorithm
//! only; image I/O lives with the caller.

pub mod bandwidth_estimation;
pub mod error;
pub mod float_trait;
pub mod image;
pub mod orchestration;
pub mod patch;
pub mod patch_weights;
mod pipeline;
pub mod sampling;

// Re-export commonly used types at the crate root
pub use bandwidth_estimation::{
    BandwidthEstimator, MAX_SIGMA_UPDATE_ITERATIONS, SIGMA_UPDATE_CONVERGENCE_TOLERANCE,
};
pub use error::{DenoiseError, SamplerError};
pub use float_trait::DenoiseFloat;
pub use image::{ImageRegion, VectorImage};
pub use orchestration::{DenoiseConfig, NoiseModel, PatchBasedDenoiser};
pub use patch::{radius_in_voxels, PatchShape};
pub use patch_weights::compute_patch_weights;
pub use sampling::{patch_constraint_region, PatchSampler, SamplingPolicy};

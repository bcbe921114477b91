//! # streaming-mmd
//!
//! Streaming, block-wise Maximum Mean Discrepancy (MMD) two-sample testing.
//!
//! ## Intuition
//!
//! MMD embeds two distributions P and Q into a Reproducing Kernel Hilbert
//! Space and measures the distance between their mean embeddings. The
//! quadratic-time estimator needs the full (n_x + n_y)² Gram matrix, which
//! does not scale. This crate computes the statistic block by block instead:
//! each step pulls a P-block and a Q-block, merges them, builds one small
//! kernel matrix, reduces it to a scalar and folds that scalar into a running
//! estimate. Memory stays bounded by a single block no matter how long the
//! stream is.
//!
//! ## Pipeline
//!
//! | Stage | Type | Role |
//! |-------|------|------|
//! | Produce | [`DataManager`] | Pull bursts of paired blocks from two [`SampleSource`]s |
//! | Merge | [`Features::create_merged_copy`] | Concatenate P and Q, optionally shuffle (null) |
//! | Evaluate | [`BoundKernel`] | Clone, bind, build the kernel matrix, release |
//! | Reduce | [`ComputationManager`] | Run estimator jobs per block on a [`ComputeBackend`] |
//! | Fold | [`RunningEstimate`] | Welford-style running mean / variance per kernel |
//! | Normalize | [`MmdVariant`] | Test-specific scaling of the final statistic |
//!
//! ## Quick Start
//!
//! ```rust
//! use streaming_mmd::{DenseSource, Features, GaussianKernel, MmdConfig, MmdVariant, StreamingMmd};
//!
//! let p: Vec<Vec<f64>> = (0..40).map(|i| vec![(i % 7) as f64 * 0.1]).collect();
//! let q: Vec<Vec<f64>> = (0..40).map(|i| vec![5.0 + (i % 5) as f64 * 0.1]).collect();
//!
//! let mut mmd = StreamingMmd::new(
//!     MmdVariant::BTest,
//!     Box::new(DenseSource::new(Features::from_rows(&p).unwrap())),
//!     Box::new(DenseSource::new(Features::from_rows(&q).unwrap())),
//!     MmdConfig::new().seed(7),
//! )
//! .unwrap();
//! mmd.set_kernel(Box::new(GaussianKernel::new(1.0).unwrap()));
//! mmd.set_blocksize(20).unwrap();
//! mmd.set_num_blocks_per_burst(2).unwrap();
//!
//! // Clearly different distributions
//! let statistic = mmd.compute_statistic().unwrap();
//! assert!(statistic > 0.5);
//! ```
//!
//! ## Estimators
//!
//! - **Statistic**: biased-full, unbiased-full or unbiased-incomplete MMD²
//!   per block ([`StatisticType`]).
//! - **Variance**: within-block direct closed form, or within-block
//!   permutation ([`VarianceEstimationMethod`]).
//! - **Null distribution**: repeated streaming passes with every merged block
//!   randomly relabelled ([`StreamingMmd::sample_null`]).
//! - **Kernel choice**: maximum MMD, maximum power ratio or the median
//!   heuristic over candidate kernels ([`KernelSelectionMethod`],
//!   [`StreamingMmd::select_kernel`]).
//!
//! ## What Can Go Wrong
//!
//! 1. **Block too large**: the kernel matrix of a merged block is (B_x+B_y)².
//!    Failures are reported per block as [`Error::KernelMatrix`]; lower the
//!    blocksize or the number of blocks per burst.
//! 2. **Tiny blocks**: unbiased estimators need at least 2 samples per block
//!    and side, the direct variance needs at least 4 per merged block.
//!    Statistic-only calls never build the variance job.
//! 3. **Null sampling cost**: every null sample is a full streaming pass.
//!
//! ## References
//!
//! - Gretton et al. (2012). "A Kernel Two-Sample Test" (JMLR)
//! - Gretton et al. (2012). "Optimal kernel choice for large-scale two-sample tests" (NIPS)
//! - Zaremba, Gretton, Blaschko (2013). "B-test: A Non-parametric, Low Variance Kernel Two-sample Test" (NIPS)
//! - Welford (1962). "Note on a Method for Calculating Corrected Sums of Squares and Products"

use thiserror::Error;

pub mod aggregator;
pub mod computation;
pub mod config;
pub mod data;
pub mod estimator;
pub mod features;
pub mod kernel;
pub mod kernel_manager;
pub mod mmd;
pub mod selection;
pub mod variant;

pub use aggregator::{
    fold_mean, fold_variance_direct, MultiKernelEstimate, RunningEstimate, WelfordVariance,
};
pub use computation::{
    BlockResult, ComputationManager, ComputeBackend, CpuBackend, KernelBlock, SequentialBackend,
};
pub use config::MmdConfig;
pub use data::{Burst, DataManager, DenseSource, MeanShiftSource, SampleSource};
pub use estimator::{
    ComputeMmd, Estimator, Job, NullApproximationMethod, StatisticType, VarianceEstimationMethod,
    WithinBlockDirect, WithinBlockPermutation,
};
pub use features::Features;
pub use kernel::{
    laplacian, linear, median_bandwidth, polynomial, rbf, BoundKernel, CombinedKernel,
    GaussianKernel, Kernel, KernelType, LaplacianKernel, LinearKernel, PolynomialKernel,
};
pub use kernel_manager::KernelManager;
pub use mmd::{StatisticVariance, StreamingMmd, TestResult};
pub use selection::{KernelSelectionMethod, POWER_REGULARIZER};
pub use variant::{MmdVariant, SampleDims};

/// Errors for streaming MMD computations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("empty input")]
    EmptyInput,

    #[error("dimension mismatch: {0} vs {1}")]
    DimensionMismatch(usize, usize),

    #[error("invalid bandwidth: {0}")]
    InvalidBandwidth(f64),

    #[error("index {index} out of bounds for {len} vectors")]
    IndexOutOfBounds { index: usize, len: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("kernel is not set")]
    KernelNotSet,

    #[error("multiple kernels requested, but underlying kernel is {0:?}, not combined")]
    NotCombined(KernelType),

    #[error("expected a single kernel, but {0} kernels are active")]
    MultipleKernels(usize),

    #[error("{method} is not supported by {variant}")]
    Unsupported { variant: &'static str, method: String },

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("kernel {kernel}, block {block}: {source}; try using fewer blocks per burst or a smaller blocksize")]
    KernelMatrix {
        kernel: usize,
        block: usize,
        #[source]
        source: Box<Error>,
    },

    #[error("stream error on source {source_index}: {message}")]
    Stream { source_index: usize, message: String },

    #[error("no alternate compute backend installed")]
    BackendUnavailable,

    #[error("no block could be processed for kernel {0}")]
    NoBlocksProcessed(usize),
}

pub type Result<T> = std::result::Result<T, Error>;

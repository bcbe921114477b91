//! Run configuration for the streaming MMD engine.
//!
//! Every pass latches a copy of [`MmdConfig`] when it starts, so changing
//! settings between passes never affects a pass in flight.

use crate::estimator::{NullApproximationMethod, StatisticType, VarianceEstimationMethod};
use crate::selection::KernelSelectionMethod;
use crate::{Error, Result};

/// Configuration options for [`StreamingMmd`](crate::StreamingMmd).
#[derive(Debug, Clone, PartialEq)]
pub struct MmdConfig {
    // =========================================================================
    // Estimators
    // =========================================================================

    /// Per-block statistic estimator. Default: unbiased-full.
    pub statistic_type: StatisticType,

    /// How the variance of the statistic is estimated. Default: direct.
    pub variance_estimation_method: VarianceEstimationMethod,

    /// How the null distribution is approximated. Only permutation is
    /// computed by this crate. Default: permutation.
    pub null_approximation_method: NullApproximationMethod,

    /// How `select_kernel` ranks candidates. Default: maximize MMD.
    pub kernel_selection_method: KernelSelectionMethod,

    // =========================================================================
    // Null sampling
    // =========================================================================

    /// Number of streaming passes made by `sample_null`. Default: 250.
    pub num_null_samples: usize,

    /// Randomly relabel every merged block before evaluating kernels.
    ///
    /// Set for the duration of `sample_null`; setting it by hand turns every
    /// pass into one null sample. Default: false.
    pub simulate_null: bool,

    /// Optional deterministic seed for the permutation source.
    ///
    /// Default: None (seeded from OS entropy).
    pub seed: Option<u64>,

    // =========================================================================
    // Resources
    // =========================================================================

    /// Route estimator jobs through the installed alternate backend.
    /// Default: false.
    pub use_gpu: bool,

    /// Largest kernel matrix (in elements) a block may allocate.
    ///
    /// Blocks exceeding it fail with a resource error and are skipped.
    /// Default: None (no limit beyond allocation failure).
    pub max_kernel_matrix_elements: Option<usize>,
}

impl Default for MmdConfig {
    fn default() -> Self {
        Self {
            statistic_type: StatisticType::UnbiasedFull,
            variance_estimation_method: VarianceEstimationMethod::Direct,
            null_approximation_method: NullApproximationMethod::Permutation,
            kernel_selection_method: KernelSelectionMethod::MaximizeMmd,

            num_null_samples: 250,
            simulate_null: false,
            seed: None,

            use_gpu: false,
            max_kernel_matrix_elements: None,
        }
    }
}

impl MmdConfig {
    /// Create a new configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a quick configuration for development: 50 null samples.
    pub fn quick() -> Self {
        Self {
            num_null_samples: 50,
            ..Default::default()
        }
    }

    /// Create a thorough configuration: 1,000 null samples.
    pub fn thorough() -> Self {
        Self {
            num_null_samples: 1_000,
            ..Default::default()
        }
    }

    // =========================================================================
    // Builder methods
    // =========================================================================

    pub fn statistic_type(mut self, stype: StatisticType) -> Self {
        self.statistic_type = stype;
        self
    }

    pub fn variance_estimation_method(mut self, method: VarianceEstimationMethod) -> Self {
        self.variance_estimation_method = method;
        self
    }

    pub fn null_approximation_method(mut self, method: NullApproximationMethod) -> Self {
        self.null_approximation_method = method;
        self
    }

    pub fn kernel_selection_method(mut self, method: KernelSelectionMethod) -> Self {
        self.kernel_selection_method = method;
        self
    }

    pub fn num_null_samples(mut self, samples: usize) -> Self {
        self.num_null_samples = samples;
        self
    }

    pub fn simulate_null(mut self, simulate: bool) -> Self {
        self.simulate_null = simulate;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn use_gpu(mut self, gpu: bool) -> Self {
        self.use_gpu = gpu;
        self
    }

    pub fn max_kernel_matrix_elements(mut self, limit: usize) -> Self {
        self.max_kernel_matrix_elements = Some(limit);
        self
    }

    /// Check settings that are invalid regardless of the test variant.
    pub fn validate(&self) -> Result<()> {
        if self.num_null_samples == 0 {
            return Err(Error::InvalidConfig(
                "number of null samples has to be positive".to_string(),
            ));
        }
        if self.max_kernel_matrix_elements == Some(0) {
            return Err(Error::InvalidConfig(
                "kernel matrix element limit has to be positive".to_string(),
            ));
        }
        Ok(())
    }
}

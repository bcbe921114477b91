//! Test variants sharing the streaming engine.
//!
//! | Variant | Blocks | Statistic scaling |
//! |---------|--------|-------------------|
//! | Quadratic-time | one block spanning both samples | `n_x n_y / (n_x + n_y)` |
//! | Linear-time | `min(n_x, n_y) / 2` blocks | `sqrt(n_x n_y / (n_x + n_y))` |
//! | B-test | caller-chosen blocksize | `sqrt(num_blocks)` |

use std::sync::Arc;

use crate::config::MmdConfig;
use crate::data::DataManager;
use crate::estimator::{
    Job, NullApproximationMethod, StatisticType, VarianceEstimationMethod, WithinBlockDirect,
};
use crate::{Error, Result};

/// Sample counts and blocksizes the normalization depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleDims {
    pub num_samples_p: usize,
    pub num_samples_q: usize,
    pub blocksize_p: usize,
    pub blocksize_q: usize,
}

impl SampleDims {
    pub fn from_data_manager(data: &DataManager) -> Result<Self> {
        Ok(Self {
            num_samples_p: data.num_samples_at(0)?,
            num_samples_q: data.num_samples_at(1)?,
            blocksize_p: data.blocksize_at(0)?,
            blocksize_q: data.blocksize_at(1)?,
        })
    }

    /// Blocks in one full pass.
    pub fn num_blocks(&self) -> usize {
        (self.num_samples_p + self.num_samples_q) / (self.blocksize_p + self.blocksize_q)
    }
}

/// MMD test variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MmdVariant {
    QuadraticTime,
    LinearTime,
    BTest,
}

impl MmdVariant {
    pub fn name(&self) -> &'static str {
        match self {
            Self::QuadraticTime => "QuadraticTimeMMD",
            Self::LinearTime => "LinearTimeMMD",
            Self::BTest => "BTestMMD",
        }
    }

    /// Whether callers may choose the blocksize.
    pub fn allows_custom_blocksize(&self) -> bool {
        matches!(self, Self::BTest)
    }

    /// Closed-form variance job for blocks of `n_x + n_y` samples.
    pub fn direct_estimation_method(&self, n_x: usize, n_y: usize) -> Result<Job> {
        Ok(Arc::new(WithinBlockDirect::new(n_x, n_y)?))
    }

    /// Scale the mean block statistic to the test statistic.
    pub fn normalize_statistic(&self, statistic: f64, dims: &SampleDims) -> f64 {
        let nx = dims.num_samples_p as f64;
        let ny = dims.num_samples_q as f64;
        match self {
            Self::QuadraticTime => nx * ny * statistic / (nx + ny),
            Self::LinearTime => statistic * (nx * ny / (nx + ny)).sqrt(),
            Self::BTest => statistic * (dims.num_blocks() as f64).sqrt(),
        }
    }

    /// Variances of all variants are reported on the block-statistic scale.
    pub fn normalize_variance(&self, variance: f64, _dims: &SampleDims) -> f64 {
        variance
    }

    /// Reject estimator combinations this variant cannot compute.
    pub fn validate(&self, config: &MmdConfig, dims: &SampleDims) -> Result<()> {
        if *self == Self::QuadraticTime
            && config.variance_estimation_method == VarianceEstimationMethod::Permutation
        {
            return Err(self.unsupported(format!(
                "{:?} variance estimation",
                config.variance_estimation_method
            )));
        }
        if config.statistic_type == StatisticType::UnbiasedIncomplete
            && dims.blocksize_p != dims.blocksize_q
        {
            return Err(self.unsupported(format!(
                "UnbiasedIncomplete with blocksizes {} and {}",
                dims.blocksize_p, dims.blocksize_q
            )));
        }
        Ok(())
    }

    /// Only permutation null sampling is computed here.
    pub fn validate_null_approximation(&self, config: &MmdConfig) -> Result<()> {
        match config.null_approximation_method {
            NullApproximationMethod::Permutation => Ok(()),
            other => Err(self.unsupported(format!("{other:?} null approximation"))),
        }
    }

    /// Fix the block layout the variant prescribes.
    pub fn configure_blocks(&self, data: &mut DataManager) -> Result<()> {
        match self {
            Self::QuadraticTime => data.set_full_data(),
            Self::LinearTime => {
                let nx = data.num_samples_at(0)?;
                let ny = data.num_samples_at(1)?;
                let num_blocks = nx.min(ny) / 2;
                if num_blocks == 0 {
                    return Err(Error::InvalidConfig(format!(
                        "linear-time MMD needs at least 2 samples from each distribution, got {nx} and {ny}"
                    )));
                }
                data.set_blocksizes(nx / num_blocks, ny / num_blocks)?;
            }
            Self::BTest => {}
        }
        Ok(())
    }

    fn unsupported(&self, method: String) -> Error {
        Error::Unsupported {
            variant: self.name(),
            method,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::DenseSource;
    use crate::features::Features;

    fn data_manager(nx: usize, ny: usize) -> DataManager {
        let p: Vec<Vec<f64>> = (0..nx).map(|i| vec![i as f64]).collect();
        let q: Vec<Vec<f64>> = (0..ny).map(|i| vec![i as f64]).collect();
        DataManager::new(
            Box::new(DenseSource::new(Features::from_rows(&p).unwrap())),
            Box::new(DenseSource::new(Features::from_rows(&q).unwrap())),
        )
        .unwrap()
    }

    #[test]
    fn test_linear_time_blocks() {
        let mut dm = data_manager(4, 6);
        dm.set_blocksize(5).unwrap();
        MmdVariant::LinearTime.configure_blocks(&mut dm).unwrap();
        assert_eq!(dm.blocksize_at(0).unwrap(), 2);
        assert_eq!(dm.blocksize_at(1).unwrap(), 3);
        assert!(MmdVariant::LinearTime.configure_blocks(&mut data_manager(1, 5)).is_err());
    }

    #[test]
    fn test_quadratic_resets_to_full_data() {
        let mut dm = data_manager(8, 8);
        dm.set_blocksize(4).unwrap();
        MmdVariant::QuadraticTime.configure_blocks(&mut dm).unwrap();
        assert!(!dm.is_blockwise());
    }

    #[test]
    fn test_normalization_constants() {
        let dims = SampleDims {
            num_samples_p: 4,
            num_samples_q: 6,
            blocksize_p: 2,
            blocksize_q: 3,
        };
        let v = 0.5;
        assert!((MmdVariant::QuadraticTime.normalize_statistic(v, &dims) - 1.2).abs() < 1e-12);
        assert!(
            (MmdVariant::LinearTime.normalize_statistic(v, &dims) - 0.5 * 2.4_f64.sqrt()).abs()
                < 1e-12
        );
        assert!(
            (MmdVariant::BTest.normalize_statistic(v, &dims) - 0.5 * 2.0_f64.sqrt()).abs() < 1e-12
        );
        assert_eq!(MmdVariant::BTest.normalize_variance(0.25, &dims), 0.25);
    }

    #[test]
    fn test_validate() {
        let dims = SampleDims {
            num_samples_p: 4,
            num_samples_q: 6,
            blocksize_p: 2,
            blocksize_q: 3,
        };
        let perm = MmdConfig::new().variance_estimation_method(VarianceEstimationMethod::Permutation);
        assert!(matches!(
            MmdVariant::QuadraticTime.validate(&perm, &dims),
            Err(Error::Unsupported { variant: "QuadraticTimeMMD", .. })
        ));
        assert!(MmdVariant::LinearTime.validate(&perm, &dims).is_ok());

        let incomplete = MmdConfig::new().statistic_type(StatisticType::UnbiasedIncomplete);
        assert!(MmdVariant::BTest.validate(&incomplete, &dims).is_err());

        let gamma = MmdConfig::new().null_approximation_method(NullApproximationMethod::Mmd2Gamma);
        assert!(MmdVariant::BTest.validate_null_approximation(&gamma).is_err());
        assert!(MmdVariant::BTest
            .validate_null_approximation(&MmdConfig::new())
            .is_ok());
    }
}

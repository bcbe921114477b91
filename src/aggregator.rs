//! Online aggregation of per-block scalars.
//!
//! Block counts are not known in advance and later blocks may be smaller, so
//! every estimate is folded one observation at a time:
//!
//! - **Statistic**: incremental mean, `m_n = m_{n-1} + (v_n - m_{n-1}) / n`.
//! - **Direct variance**: each block already returns a point estimate of the
//!   variance, so the same incremental mean applies.
//! - **Permutation variance**: the variance *across* blocks of per-block
//!   permuted statistics. Welford's update keeps a running mean and a running
//!   sum of squared deviations.
//!   Reference: Welford (1962), *Technometrics* 4(3), pp. 419–420.

use crate::estimator::VarianceEstimationMethod;

/// Fold `value` into `current`, the mean of the previous `count - 1` values.
///
/// `count` is the 1-based index of `value`.
///
/// ```rust
/// use streaming_mmd::fold_mean;
///
/// let mut mean = 0.0;
/// for (i, v) in [2.0, 4.0, 9.0].into_iter().enumerate() {
///     mean = fold_mean(mean, i + 1, v);
/// }
/// assert!((mean - 5.0).abs() < 1e-12);
/// ```
#[inline]
pub fn fold_mean(current: f64, count: usize, value: f64) -> f64 {
    debug_assert!(count > 0, "count is 1-based");
    current + (value - current) / count as f64
}

/// Direct-method variance: the mean of per-block variance estimates.
#[inline]
pub fn fold_variance_direct(current: f64, count: usize, value: f64) -> f64 {
    fold_mean(current, count, value)
}

/// Welford state for the permutation-method variance.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WelfordVariance {
    mean: f64,
    m2: f64,
}

impl WelfordVariance {
    /// Fold the `count`-th (1-based) permuted statistic.
    #[inline]
    pub fn fold_variance_permutation(&mut self, count: usize, value: f64) {
        let delta = value - self.mean;
        self.mean = fold_mean(self.mean, count, value);
        self.m2 += delta * (value - self.mean);
    }

    /// Mean of the permuted statistics folded so far.
    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Sample variance (denominator `count - 1`). NaN for fewer than two
    /// observations.
    pub fn sample_variance(&self, count: usize) -> f64 {
        if count < 2 {
            return f64::NAN;
        }
        self.m2 / (count - 1) as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum VarianceAccumulator {
    Direct(f64),
    Permutation(WelfordVariance),
}

/// Running statistic and variance for one kernel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunningEstimate {
    count: usize,
    statistic: f64,
    variance: VarianceAccumulator,
}

impl RunningEstimate {
    pub fn new(method: VarianceEstimationMethod) -> Self {
        let variance = match method {
            VarianceEstimationMethod::Direct => VarianceAccumulator::Direct(0.0),
            VarianceEstimationMethod::Permutation => {
                VarianceAccumulator::Permutation(WelfordVariance::default())
            }
        };
        Self {
            count: 0,
            statistic: 0.0,
            variance,
        }
    }

    /// Fold one block's statistic and variance-job output.
    pub fn fold(&mut self, statistic: f64, variance: f64) {
        self.count += 1;
        self.statistic = fold_mean(self.statistic, self.count, statistic);
        match &mut self.variance {
            VarianceAccumulator::Direct(current) => {
                *current = fold_variance_direct(*current, self.count, variance);
            }
            VarianceAccumulator::Permutation(welford) => {
                welford.fold_variance_permutation(self.count, variance);
            }
        }
    }

    /// Number of blocks folded.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Mean per-block statistic, before variant normalization.
    pub fn statistic(&self) -> f64 {
        self.statistic
    }

    /// Variance estimate, before variant normalization.
    pub fn variance(&self) -> f64 {
        match &self.variance {
            VarianceAccumulator::Direct(current) => *current,
            VarianceAccumulator::Permutation(welford) => welford.sample_variance(self.count),
        }
    }
}

/// One [`RunningEstimate`] per active kernel, in kernel order.
#[derive(Debug, Clone, PartialEq)]
pub struct MultiKernelEstimate {
    estimates: Vec<RunningEstimate>,
}

impl MultiKernelEstimate {
    pub fn new(num_kernels: usize, method: VarianceEstimationMethod) -> Self {
        Self {
            estimates: vec![RunningEstimate::new(method); num_kernels],
        }
    }

    /// # Panics
    ///
    /// Panics if `kernel` is out of range.
    pub fn fold(&mut self, kernel: usize, statistic: f64, variance: f64) {
        self.estimates[kernel].fold(statistic, variance);
    }

    pub fn len(&self) -> usize {
        self.estimates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.estimates.is_empty()
    }

    pub fn get(&self, kernel: usize) -> Option<&RunningEstimate> {
        self.estimates.get(kernel)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RunningEstimate> {
        self.estimates.iter()
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn values(max_len: usize) -> impl Strategy<Value = Vec<f64>> {
        proptest::collection::vec(-1e3_f64..1e3, 1..=max_len)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn fold_mean_is_arithmetic_mean(data in values(10_000)) {
            let mut mean = 0.0;
            for (i, &v) in data.iter().enumerate() {
                mean = fold_mean(mean, i + 1, v);
            }
            let expected = data.iter().sum::<f64>() / data.len() as f64;
            prop_assert!(
                (mean - expected).abs() < 1e-8,
                "incremental mean {} differs from {}", mean, expected
            );
        }

        #[test]
        fn permutation_variance_matches_two_pass(data in values(2_000)) {
            prop_assume!(data.len() >= 2);
            let mut welford = WelfordVariance::default();
            for (i, &v) in data.iter().enumerate() {
                welford.fold_variance_permutation(i + 1, v);
            }
            let n = data.len() as f64;
            let mean = data.iter().sum::<f64>() / n;
            let expected = data.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
            let got = welford.sample_variance(data.len());
            prop_assert!(
                (got - expected).abs() <= 1e-9 * expected.max(1.0),
                "welford {} vs two-pass {}", got, expected
            );
        }
    }
}

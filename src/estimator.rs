//! Estimator strategies: reduce one merged-block kernel matrix to a scalar.
//!
//! A kernel matrix over a merged block holds the n_x samples from P first and
//! the n_y samples from Q after them:
//!
//! ```text
//! K = | Kxx  Kxy |
//!     | Kyx  Kyy |
//! ```
//!
//! Jobs are built once per pass (block sizes baked in) and applied unchanged
//! to every block of that pass.

use std::fmt;
use std::sync::Arc;

use ndarray::ArrayView2;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::{Error, Result};

/// Per-block MMD² estimator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatisticType {
    /// V-statistic: all entries of Kxx, Kyy and Kxy.
    BiasedFull,
    /// U-statistic: diagonals of Kxx and Kyy excluded.
    UnbiasedFull,
    /// Additionally excludes the diagonal of Kxy. Needs n_x = n_y.
    UnbiasedIncomplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VarianceEstimationMethod {
    /// Closed-form within-block variance, averaged over blocks.
    Direct,
    /// Variance across blocks of the statistic on randomly relabelled blocks.
    Permutation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NullApproximationMethod {
    Permutation,
    Mmd1Gaussian,
    Mmd2Spectrum,
    Mmd2Gamma,
}

/// A job reducing a kernel matrix to one scalar.
pub trait Estimator: Send + Sync + fmt::Debug {
    /// `rng` is private to this (job, block) pair.
    fn estimate(&self, kernel_matrix: ArrayView2<'_, f64>, rng: &mut StdRng) -> Result<f64>;
}

pub type Job = Arc<dyn Estimator>;

fn check_square(kernel_matrix: &ArrayView2<'_, f64>, expected: usize) -> Result<()> {
    let (rows, cols) = kernel_matrix.dim();
    if rows != expected {
        return Err(Error::DimensionMismatch(expected, rows));
    }
    if cols != expected {
        return Err(Error::DimensionMismatch(expected, cols));
    }
    Ok(())
}

// =============================================================================
// Statistic
// =============================================================================

/// MMD² of one merged block with `n_x` samples from P and `n_y` from Q.
///
/// # Example
///
/// ```rust
/// use ndarray::array;
/// use streaming_mmd::{ComputeMmd, StatisticType};
///
/// // Perfectly separated: k = 1 within a sample, 0 across.
/// let km = array![
///     [1.0, 1.0, 0.0, 0.0],
///     [1.0, 1.0, 0.0, 0.0],
///     [0.0, 0.0, 1.0, 1.0],
///     [0.0, 0.0, 1.0, 1.0],
/// ];
/// let mmd = ComputeMmd::new(2, 2, StatisticType::UnbiasedFull).unwrap();
/// assert!((mmd.compute(km.view()) - 2.0).abs() < 1e-12);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComputeMmd {
    n_x: usize,
    n_y: usize,
    stype: StatisticType,
}

impl ComputeMmd {
    pub fn new(n_x: usize, n_y: usize, stype: StatisticType) -> Result<Self> {
        if n_x == 0 {
            return Err(Error::InvalidConfig(
                "blocksize for samples from P cannot be 0".to_string(),
            ));
        }
        if n_y == 0 {
            return Err(Error::InvalidConfig(
                "blocksize for samples from Q cannot be 0".to_string(),
            ));
        }
        if stype != StatisticType::BiasedFull && (n_x < 2 || n_y < 2) {
            return Err(Error::InvalidConfig(format!(
                "{stype:?} needs at least 2 samples per block from each distribution, got {n_x} and {n_y}"
            )));
        }
        if stype == StatisticType::UnbiasedIncomplete && n_x != n_y {
            return Err(Error::InvalidConfig(format!(
                "UnbiasedIncomplete needs equal blocksizes, got {n_x} and {n_y}"
            )));
        }
        Ok(Self { n_x, n_y, stype })
    }

    pub fn n_x(&self) -> usize {
        self.n_x
    }

    pub fn n_y(&self) -> usize {
        self.n_y
    }

    pub fn statistic_type(&self) -> StatisticType {
        self.stype
    }

    /// MMD² of `kernel_matrix`, which must be (n_x + n_y) square.
    ///
    /// # Panics
    ///
    /// Panics if the matrix is smaller than (n_x + n_y) square.
    pub fn compute(&self, kernel_matrix: ArrayView2<'_, f64>) -> f64 {
        self.compute_with(|i, j| kernel_matrix[[i, j]])
    }

    /// MMD² of the block relabelled by `perm`: sample `i` of the permuted
    /// block is sample `perm[i]` of the original.
    pub fn compute_permuted(&self, kernel_matrix: ArrayView2<'_, f64>, perm: &[usize]) -> f64 {
        self.compute_with(|i, j| kernel_matrix[[perm[i], perm[j]]])
    }

    fn compute_with<F>(&self, k: F) -> f64
    where
        F: Fn(usize, usize) -> f64,
    {
        let (nx, ny) = (self.n_x, self.n_y);
        let size = nx + ny;

        let (mut xx, mut xx_diag) = (0.0, 0.0);
        for i in 0..nx {
            for j in 0..nx {
                if i == j {
                    xx_diag += k(i, j);
                } else {
                    xx += k(i, j);
                }
            }
        }

        let (mut yy, mut yy_diag) = (0.0, 0.0);
        for i in nx..size {
            for j in nx..size {
                if i == j {
                    yy_diag += k(i, j);
                } else {
                    yy += k(i, j);
                }
            }
        }

        let (mut xy, mut xy_diag) = (0.0, 0.0);
        for i in 0..nx {
            for j in 0..ny {
                let v = k(i, nx + j);
                xy += v;
                if i == j {
                    xy_diag += v;
                }
            }
        }

        let (fx, fy) = (nx as f64, ny as f64);
        match self.stype {
            StatisticType::BiasedFull => {
                (xx + xx_diag) / (fx * fx) + (yy + yy_diag) / (fy * fy) - 2.0 * xy / (fx * fy)
            }
            StatisticType::UnbiasedFull => {
                xx / (fx * (fx - 1.0)) + yy / (fy * (fy - 1.0)) - 2.0 * xy / (fx * fy)
            }
            StatisticType::UnbiasedIncomplete => {
                let pairs = fx * (fx - 1.0);
                (xx + yy - 2.0 * (xy - xy_diag)) / pairs
            }
        }
    }
}

impl Estimator for ComputeMmd {
    fn estimate(&self, kernel_matrix: ArrayView2<'_, f64>, _rng: &mut StdRng) -> Result<f64> {
        check_square(&kernel_matrix, self.n_x + self.n_y)?;
        Ok(self.compute(kernel_matrix))
    }
}

// =============================================================================
// Variance
// =============================================================================

/// Closed-form estimate of the null variance of one block's statistic.
///
/// With the diagonal of K zeroed and B = n_x + n_y:
///
/// ```text
/// var = 2 / (B (B-3)) · ( ΣK² + (ΣK)² / ((B-1)(B-2)) - 2 Σ(K·K) / (B-2) )
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WithinBlockDirect {
    size: usize,
}

impl WithinBlockDirect {
    pub fn new(n_x: usize, n_y: usize) -> Result<Self> {
        let size = n_x + n_y;
        if size < 4 {
            return Err(Error::InvalidConfig(format!(
                "direct variance estimation needs at least 4 samples per block, got {size}"
            )));
        }
        Ok(Self { size })
    }

    pub fn compute(&self, kernel_matrix: ArrayView2<'_, f64>) -> f64 {
        let b = self.size;
        let mut sum_sq = 0.0;
        let mut sum = 0.0;
        let mut row_sums = vec![0.0; b];
        let mut col_sums = vec![0.0; b];
        for i in 0..b {
            for j in 0..b {
                if i == j {
                    continue;
                }
                let v = kernel_matrix[[i, j]];
                sum_sq += v * v;
                sum += v;
                row_sums[i] += v;
                col_sums[j] += v;
            }
        }
        // Σ(K·K) = Σ_l colsum_l · rowsum_l
        let sum_product: f64 = col_sums.iter().zip(&row_sums).map(|(c, r)| c * r).sum();

        let fb = b as f64;
        let first = sum_sq;
        let second = sum * sum / (fb - 1.0) / (fb - 2.0);
        let third = 2.0 * sum_product / (fb - 2.0);
        2.0 / fb / (fb - 3.0) * (first + second - third)
    }
}

impl Estimator for WithinBlockDirect {
    fn estimate(&self, kernel_matrix: ArrayView2<'_, f64>, _rng: &mut StdRng) -> Result<f64> {
        check_square(&kernel_matrix, self.size)?;
        Ok(self.compute(kernel_matrix))
    }
}

/// Statistic of one block after a uniformly random relabelling of its
/// samples. The variance of these values across blocks estimates the null
/// variance of the block statistic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WithinBlockPermutation {
    mmd: ComputeMmd,
}

impl WithinBlockPermutation {
    pub fn new(n_x: usize, n_y: usize, stype: StatisticType) -> Result<Self> {
        Ok(Self {
            mmd: ComputeMmd::new(n_x, n_y, stype)?,
        })
    }
}

impl Estimator for WithinBlockPermutation {
    fn estimate(&self, kernel_matrix: ArrayView2<'_, f64>, rng: &mut StdRng) -> Result<f64> {
        let size = self.mmd.n_x + self.mmd.n_y;
        check_square(&kernel_matrix, size)?;
        let mut perm: Vec<usize> = (0..size).collect();
        perm.shuffle(rng);
        Ok(self.mmd.compute_permuted(kernel_matrix, &perm))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::Features;
    use crate::kernel::{BoundKernel, GaussianKernel};
    use ndarray::Array2;
    use rand::SeedableRng;

    /// Samples i/max laid out as in the reference MATLAB scripts.
    fn reference_data(m: usize, n: usize) -> (Features, Features) {
        let d = 3;
        let max_p = (d * m - 1) as f64;
        let max_q = (d * (m + n) - 1) as f64;
        let p: Vec<Vec<f64>> = (0..m)
            .map(|j| (0..d).map(|k| (d * j + k) as f64 / max_p).collect())
            .collect();
        let q: Vec<Vec<f64>> = (0..n)
            .map(|j| (0..d).map(|k| (d * m + d * j + k) as f64 / max_q).collect())
            .collect();
        (Features::from_rows(&p).unwrap(), Features::from_rows(&q).unwrap())
    }

    fn merged_kernel_matrix(p: &Features, q: &Features) -> Array2<f64> {
        let merged = p.create_merged_copy(q).unwrap();
        let kernel = GaussianKernel::new(2.0).unwrap();
        let bound = BoundKernel::init(&kernel, &merged, &merged).unwrap();
        bound.kernel_matrix(None).unwrap()
    }

    #[test]
    fn test_reference_statistics() {
        let (p, q) = reference_data(8, 8);
        let km = merged_kernel_matrix(&p, &q);

        let cases = [
            (StatisticType::BiasedFull, 0.044706366216948),
            (StatisticType::UnbiasedFull, 0.033600235840333),
            (StatisticType::UnbiasedIncomplete, 0.041859943002939),
        ];
        for (stype, expected) in cases {
            let mmd = ComputeMmd::new(8, 8, stype).unwrap();
            let value = mmd.compute(km.view());
            assert!(
                (value - expected).abs() < 1e-10,
                "{stype:?}: expected {expected}, got {value}"
            );
        }
    }

    #[test]
    fn test_unequal_block_sizes() {
        let (p, q) = reference_data(2, 3);
        let km = merged_kernel_matrix(&p, &q);
        let biased = ComputeMmd::new(2, 3, StatisticType::BiasedFull).unwrap();
        let unbiased = ComputeMmd::new(2, 3, StatisticType::UnbiasedFull).unwrap();
        assert!(biased.compute(km.view()) > unbiased.compute(km.view()));
        assert!(ComputeMmd::new(2, 3, StatisticType::UnbiasedIncomplete).is_err());
    }

    #[test]
    fn test_invalid_block_sizes() {
        assert!(ComputeMmd::new(0, 3, StatisticType::BiasedFull).is_err());
        assert!(ComputeMmd::new(3, 0, StatisticType::BiasedFull).is_err());
        assert!(ComputeMmd::new(1, 1, StatisticType::UnbiasedFull).is_err());
        assert!(ComputeMmd::new(1, 1, StatisticType::BiasedFull).is_ok());
        assert!(WithinBlockDirect::new(2, 1).is_err());
    }

    #[test]
    fn test_estimate_checks_shape() {
        let mut rng = StdRng::seed_from_u64(0);
        let mmd = ComputeMmd::new(2, 2, StatisticType::BiasedFull).unwrap();
        let km = Array2::<f64>::zeros((3, 3));
        assert!(matches!(
            mmd.estimate(km.view(), &mut rng),
            Err(Error::DimensionMismatch(4, 3))
        ));
    }

    #[test]
    fn test_reference_direct_variance() {
        let (p, q) = reference_data(8, 8);
        let km = merged_kernel_matrix(&p, &q);
        let direct = WithinBlockDirect::new(8, 8).unwrap();
        let var = direct.compute(km.view());
        assert!((var - 0.004625420785666).abs() < 1e-10, "got {var}");
    }

    #[test]
    fn test_direct_variance_ignores_diagonal() {
        let (p, q) = reference_data(4, 4);
        let mut km = merged_kernel_matrix(&p, &q);
        let direct = WithinBlockDirect::new(4, 4).unwrap();
        let before = direct.compute(km.view());
        km.diag_mut().fill(123.0);
        let after = direct.compute(km.view());
        assert!((before - after).abs() < 1e-14);
    }

    #[test]
    fn test_permutation_matches_shuffled_features() {
        let (p, q) = reference_data(5, 5);
        let km = merged_kernel_matrix(&p, &q);
        let job = WithinBlockPermutation::new(5, 5, StatisticType::UnbiasedFull).unwrap();
        let mmd = ComputeMmd::new(5, 5, StatisticType::UnbiasedFull).unwrap();

        let mut rng = StdRng::seed_from_u64(12345);
        let permuted = job.estimate(km.view(), &mut rng).unwrap();

        // Same draw applied to the features instead of the matrix
        let mut rng = StdRng::seed_from_u64(12345);
        let mut perm: Vec<usize> = (0..10).collect();
        perm.shuffle(&mut rng);
        let mut merged = p.create_merged_copy(&q).unwrap();
        merged.add_subset(&perm).unwrap();
        let kernel = GaussianKernel::new(2.0).unwrap();
        let bound = BoundKernel::init(&kernel, &merged, &merged).unwrap();
        let shuffled_km = bound.kernel_matrix(None).unwrap();

        let expected = mmd.compute(shuffled_km.view());
        assert!((permuted - expected).abs() < 1e-12);
    }

    #[test]
    fn test_identity_permutation_is_statistic() {
        let (p, q) = reference_data(4, 4);
        let km = merged_kernel_matrix(&p, &q);
        let mmd = ComputeMmd::new(4, 4, StatisticType::BiasedFull).unwrap();
        let identity: Vec<usize> = (0..8).collect();
        assert_eq!(mmd.compute_permuted(km.view(), &identity), mmd.compute(km.view()));
    }
}

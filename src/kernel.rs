//! Kernel functions and the clone-bind-release evaluation handle.
//!
//! Kernels are stateless values implementing [`Kernel`]. To evaluate a kernel
//! on a block, the engine clones it and binds the clone to the block's
//! features as a [`BoundKernel`]; the binding borrows the features, so it
//! cannot outlive the block, and dropping it (or calling
//! [`BoundKernel::remove_lhs_and_rhs`]) releases the operands. Kernels shared
//! across worker threads are therefore never mutated.

use std::fmt;

use ndarray::Array2;

use crate::features::Features;
use crate::{Error, Result};

// =============================================================================
// Kernel Functions
// =============================================================================

/// Radial Basis Function (Gaussian) kernel: k(x, y) = exp(-||x-y||² / (2σ²))
///
/// # Example
///
/// ```rust
/// use streaming_mmd::rbf;
///
/// let k = rbf(&[0.0, 0.0], &[1.0, 0.0], 1.0);
/// // exp(-1/(2*1)) = exp(-0.5) ≈ 0.606
/// assert!((k - 0.606).abs() < 0.01);
/// ```
pub fn rbf(x: &[f64], y: &[f64], sigma: f64) -> f64 {
    let sq_dist: f64 = x
        .iter()
        .zip(y.iter())
        .map(|(xi, yi)| (xi - yi).powi(2))
        .sum();
    (-sq_dist / (2.0 * sigma * sigma)).exp()
}

/// Polynomial kernel: k(x, y) = (γ⟨x,y⟩ + c)^d
pub fn polynomial(x: &[f64], y: &[f64], degree: u32, gamma: f64, coef0: f64) -> f64 {
    (gamma * linear(x, y) + coef0).powi(degree as i32)
}

/// Linear kernel: k(x, y) = ⟨x, y⟩
pub fn linear(x: &[f64], y: &[f64]) -> f64 {
    x.iter().zip(y.iter()).map(|(xi, yi)| xi * yi).sum()
}

/// Laplacian kernel: k(x, y) = exp(-||x-y||₁ / σ)
pub fn laplacian(x: &[f64], y: &[f64], sigma: f64) -> f64 {
    let l1_dist: f64 = x.iter().zip(y.iter()).map(|(xi, yi)| (xi - yi).abs()).sum();
    (-l1_dist / sigma).exp()
}

/// Median heuristic for RBF bandwidth selection: σ = median(||xᵢ - xⱼ||) / √2.
///
/// Returns 1.0 for fewer than two vectors.
pub fn median_bandwidth(features: &Features) -> f64 {
    let n = features.num_vectors();
    if n < 2 {
        return 1.0;
    }

    let mut distances = Vec::with_capacity(n * (n - 1) / 2);
    for i in 0..n {
        for j in (i + 1)..n {
            let sq_dist: f64 = features
                .vector(i)
                .iter()
                .zip(features.vector(j))
                .map(|(a, b)| (a - b).powi(2))
                .sum();
            distances.push(sq_dist.sqrt());
        }
    }

    distances.sort_by(f64::total_cmp);
    distances[distances.len() / 2] / std::f64::consts::SQRT_2
}

fn check_bandwidth(sigma: f64) -> Result<f64> {
    if sigma.is_finite() && sigma > 0.0 {
        Ok(sigma)
    } else {
        Err(Error::InvalidBandwidth(sigma))
    }
}

// =============================================================================
// Kernel Objects
// =============================================================================

/// Kind of a kernel, used to tell combined kernels apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelType {
    Gaussian,
    Linear,
    Polynomial,
    Laplacian,
    Combined,
    Other,
}

/// A positive-definite kernel evaluated on pairs of feature vectors.
pub trait Kernel: Send + Sync + fmt::Debug {
    fn kernel_type(&self) -> KernelType;

    /// Independent copy used for one binding.
    fn clone_kernel(&self) -> Box<dyn Kernel>;

    fn compute(&self, x: &[f64], y: &[f64]) -> f64;

    /// Sub-kernels of a combined kernel, in registration order.
    fn subkernels(&self) -> &[Box<dyn Kernel>] {
        &[]
    }

    /// Gaussian bandwidth σ, for median-heuristic kernel selection.
    fn bandwidth(&self) -> Option<f64> {
        None
    }

    /// Validate a pair of operands before they are bound.
    fn check_operands(&self, lhs: &Features, rhs: &Features) -> Result<()> {
        if lhs.dim() != rhs.dim() {
            return Err(Error::DimensionMismatch(lhs.dim(), rhs.dim()));
        }
        Ok(())
    }
}

impl Clone for Box<dyn Kernel> {
    fn clone(&self) -> Self {
        self.clone_kernel()
    }
}

/// Gaussian kernel with bandwidth σ, see [`rbf`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GaussianKernel {
    sigma: f64,
}

impl GaussianKernel {
    pub fn new(sigma: f64) -> Result<Self> {
        Ok(Self {
            sigma: check_bandwidth(sigma)?,
        })
    }

    /// Bandwidth picked by [`median_bandwidth`] on `features`.
    pub fn with_median_heuristic(features: &Features) -> Result<Self> {
        Self::new(median_bandwidth(features))
    }

    pub fn sigma(&self) -> f64 {
        self.sigma
    }
}

impl Kernel for GaussianKernel {
    fn kernel_type(&self) -> KernelType {
        KernelType::Gaussian
    }

    fn clone_kernel(&self) -> Box<dyn Kernel> {
        Box::new(*self)
    }

    fn compute(&self, x: &[f64], y: &[f64]) -> f64 {
        rbf(x, y, self.sigma)
    }

    fn bandwidth(&self) -> Option<f64> {
        Some(self.sigma)
    }
}

/// Linear kernel, see [`linear`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LinearKernel;

impl Kernel for LinearKernel {
    fn kernel_type(&self) -> KernelType {
        KernelType::Linear
    }

    fn clone_kernel(&self) -> Box<dyn Kernel> {
        Box::new(*self)
    }

    fn compute(&self, x: &[f64], y: &[f64]) -> f64 {
        linear(x, y)
    }
}

/// Polynomial kernel, see [`polynomial`].
///
/// Not characteristic: it cannot tell apart distributions that agree on the
/// first `degree` moments.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PolynomialKernel {
    pub degree: u32,
    pub gamma: f64,
    pub coef0: f64,
}

impl Kernel for PolynomialKernel {
    fn kernel_type(&self) -> KernelType {
        KernelType::Polynomial
    }

    fn clone_kernel(&self) -> Box<dyn Kernel> {
        Box::new(*self)
    }

    fn compute(&self, x: &[f64], y: &[f64]) -> f64 {
        polynomial(x, y, self.degree, self.gamma, self.coef0)
    }
}

/// Laplacian kernel with bandwidth σ, see [`laplacian`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LaplacianKernel {
    sigma: f64,
}

impl LaplacianKernel {
    pub fn new(sigma: f64) -> Result<Self> {
        Ok(Self {
            sigma: check_bandwidth(sigma)?,
        })
    }
}

impl Kernel for LaplacianKernel {
    fn kernel_type(&self) -> KernelType {
        KernelType::Laplacian
    }

    fn clone_kernel(&self) -> Box<dyn Kernel> {
        Box::new(*self)
    }

    fn compute(&self, x: &[f64], y: &[f64]) -> f64 {
        laplacian(x, y, self.sigma)
    }
}

/// Weighted sum of sub-kernels: k(x, y) = Σ wᵢ kᵢ(x, y).
///
/// The streaming engine expands a combined kernel and evaluates every
/// sub-kernel separately; the weights only matter when the combined kernel is
/// evaluated as a whole.
#[derive(Debug, Clone, Default)]
pub struct CombinedKernel {
    kernels: Vec<Box<dyn Kernel>>,
    weights: Vec<f64>,
}

impl CombinedKernel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a sub-kernel with weight 1.
    pub fn append_kernel(&mut self, kernel: Box<dyn Kernel>) {
        self.append_weighted_kernel(kernel, 1.0);
    }

    pub fn append_weighted_kernel(&mut self, kernel: Box<dyn Kernel>, weight: f64) {
        self.kernels.push(kernel);
        self.weights.push(weight);
    }

    pub fn num_subkernels(&self) -> usize {
        self.kernels.len()
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }
}

impl Kernel for CombinedKernel {
    fn kernel_type(&self) -> KernelType {
        KernelType::Combined
    }

    fn clone_kernel(&self) -> Box<dyn Kernel> {
        Box::new(self.clone())
    }

    fn compute(&self, x: &[f64], y: &[f64]) -> f64 {
        self.kernels
            .iter()
            .zip(&self.weights)
            .map(|(k, w)| w * k.compute(x, y))
            .sum()
    }

    fn subkernels(&self) -> &[Box<dyn Kernel>] {
        &self.kernels
    }

    fn check_operands(&self, lhs: &Features, rhs: &Features) -> Result<()> {
        self.kernels
            .iter()
            .try_for_each(|k| k.check_operands(lhs, rhs))
    }
}

// =============================================================================
// Binding
// =============================================================================

/// A kernel clone bound to a left and right operand.
///
/// # Example
///
/// ```rust
/// use streaming_mmd::{BoundKernel, Features, GaussianKernel};
///
/// let feats = Features::from_rows(&[vec![0.0], vec![1.0], vec![2.0]]).unwrap();
/// let kernel = GaussianKernel::new(1.0).unwrap();
///
/// let bound = BoundKernel::init(&kernel, &feats, &feats).unwrap();
/// let km = bound.kernel_matrix(None).unwrap();
/// bound.remove_lhs_and_rhs();
///
/// assert_eq!(km.shape(), &[3, 3]);
/// assert!((km[[1, 1]] - 1.0).abs() < 1e-12);
/// ```
#[derive(Debug)]
pub struct BoundKernel<'a> {
    kernel: Box<dyn Kernel>,
    lhs: &'a Features,
    rhs: &'a Features,
}

impl<'a> BoundKernel<'a> {
    /// Clone `kernel` and bind the clone to `lhs` and `rhs`.
    pub fn init(kernel: &dyn Kernel, lhs: &'a Features, rhs: &'a Features) -> Result<Self> {
        kernel.check_operands(lhs, rhs)?;
        Ok(Self {
            kernel: kernel.clone_kernel(),
            lhs,
            rhs,
        })
    }

    pub fn num_lhs(&self) -> usize {
        self.lhs.num_vectors()
    }

    pub fn num_rhs(&self) -> usize {
        self.rhs.num_vectors()
    }

    /// k(lhs[i], rhs[j])
    pub fn kernel(&self, i: usize, j: usize) -> f64 {
        self.kernel.compute(self.lhs.vector(i), self.rhs.vector(j))
    }

    /// Full kernel matrix K[i,j] = k(lhs[i], rhs[j]).
    ///
    /// Fails with [`Error::ResourceExhausted`] if the matrix has more than
    /// `max_elements` entries or cannot be allocated.
    pub fn kernel_matrix(&self, max_elements: Option<usize>) -> Result<Array2<f64>> {
        let (n, m) = (self.num_lhs(), self.num_rhs());
        let elements = n
            .checked_mul(m)
            .ok_or_else(|| Error::ResourceExhausted(format!("{n}x{m} kernel matrix overflows")))?;
        if let Some(limit) = max_elements {
            if elements > limit {
                return Err(Error::ResourceExhausted(format!(
                    "{n}x{m} kernel matrix exceeds the limit of {limit} elements"
                )));
            }
        }

        let mut values: Vec<f64> = Vec::new();
        values.try_reserve_exact(elements).map_err(|e| {
            Error::ResourceExhausted(format!("allocating {n}x{m} kernel matrix: {e}"))
        })?;
        values.resize(elements, 0.0);
        let mut k = Array2::from_shape_vec((n, m), values)
            .map_err(|e| Error::ResourceExhausted(e.to_string()))?;

        if std::ptr::eq(self.lhs, self.rhs) {
            for i in 0..n {
                for j in i..n {
                    let kij = self.kernel(i, j);
                    k[[i, j]] = kij;
                    k[[j, i]] = kij; // Symmetric
                }
            }
        } else {
            for i in 0..n {
                for j in 0..m {
                    k[[i, j]] = self.kernel(i, j);
                }
            }
        }

        Ok(k)
    }

    /// Release the operands, handing back the unbound clone.
    pub fn remove_lhs_and_rhs(self) -> Box<dyn Kernel> {
        self.kernel
    }
}

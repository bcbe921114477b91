//! The streaming MMD engine.
//!
//! One streaming pass:
//!
//! 1. Latch the configuration and build the statistic and variance jobs for
//!    the current blocksizes.
//! 2. Pull bursts from the [`DataManager`] until it yields an empty one.
//! 3. Merge each P/Q block pair (shuffled when simulating the null), then for
//!    every active kernel build the block kernel matrices in parallel and run
//!    the jobs on them.
//! 4. Fold the per-block results in block order and normalize for the test
//!    variant.
//!
//! A block whose kernel matrix cannot be built is logged and skipped; the
//! reported block count only includes folded blocks.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use crate::aggregator::{fold_mean, MultiKernelEstimate};
use crate::computation::{ComputationManager, ComputeBackend, CpuBackend, KernelBlock};
use crate::config::MmdConfig;
use crate::data::{Burst, DataManager, SampleSource};
use crate::estimator::{
    ComputeMmd, Job, NullApproximationMethod, StatisticType, VarianceEstimationMethod,
    WithinBlockPermutation,
};
use crate::features::Features;
use crate::kernel::{median_bandwidth, BoundKernel, Kernel, KernelType};
use crate::kernel_manager::KernelManager;
use crate::selection::{argmax, closest_bandwidth, power_ratio, KernelSelectionMethod};
use crate::variant::{MmdVariant, SampleDims};
use crate::{Error, Result};

/// Normalized statistic and variance of one kernel after a full pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatisticVariance {
    pub statistic: f64,
    pub variance: f64,
    /// Blocks that were folded into the estimate.
    pub num_blocks: usize,
}

/// Outcome of a permutation test.
#[derive(Debug, Clone, PartialEq)]
pub struct TestResult {
    pub statistic: f64,
    /// Fraction of null samples at least as large as the statistic.
    pub p_value: f64,
    /// The `1 - alpha` quantile of the null samples.
    pub threshold: f64,
    pub alpha: f64,
    pub reject_null: bool,
    pub num_null_samples: usize,
}

/// Per kernel, per block of a burst: the job outputs, or `None` if the block
/// failed.
type BurstResults = [Vec<Option<Vec<f64>>>];

/// Streaming two-sample test over a sample from P and a sample from Q.
#[derive(Debug)]
pub struct StreamingMmd {
    variant: MmdVariant,
    data: DataManager,
    kernels: KernelManager,
    config: MmdConfig,
    rng: StdRng,
    backend: Box<dyn ComputeBackend>,
    gpu_backend: Option<Box<dyn ComputeBackend>>,
}

impl StreamingMmd {
    pub fn new(
        variant: MmdVariant,
        p: Box<dyn SampleSource>,
        q: Box<dyn SampleSource>,
        config: MmdConfig,
    ) -> Result<Self> {
        config.validate()?;
        let mut data = DataManager::new(p, q)?;
        variant.configure_blocks(&mut data)?;
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Ok(Self {
            variant,
            data,
            kernels: KernelManager::new(),
            config,
            rng,
            backend: Box::new(CpuBackend),
            gpu_backend: None,
        })
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    pub fn variant(&self) -> MmdVariant {
        self.variant
    }

    pub fn config(&self) -> &MmdConfig {
        &self.config
    }

    pub fn data_manager(&self) -> &DataManager {
        &self.data
    }

    pub fn kernel_manager(&self) -> &KernelManager {
        &self.kernels
    }

    /// The kernel every pass evaluates. A combined kernel is evaluated per
    /// sub-kernel.
    pub fn set_kernel(&mut self, kernel: Box<dyn Kernel>) {
        self.kernels.clear();
        self.kernels.push_back(kernel);
    }

    /// Merged blocksize, split across P and Q by their sample ratio.
    ///
    /// Only the B-test lets callers choose it. The direct variance needs at
    /// least 4 samples per merged block and the unbiased statistics 2 per
    /// side; below that only the biased statistic can be computed.
    pub fn set_blocksize(&mut self, blocksize: usize) -> Result<()> {
        if !self.variant.allows_custom_blocksize() {
            return Err(Error::Unsupported {
                variant: self.variant.name(),
                method: "custom blocksize".to_string(),
            });
        }
        self.data.set_blocksize(blocksize)
    }

    pub fn set_num_blocks_per_burst(&mut self, num_blocks_per_burst: usize) -> Result<()> {
        self.data.set_num_blocks_per_burst(num_blocks_per_burst)
    }

    pub fn set_num_null_samples(&mut self, num_null_samples: usize) -> Result<()> {
        if num_null_samples == 0 {
            return Err(Error::InvalidConfig(
                "number of null samples has to be positive".to_string(),
            ));
        }
        self.config.num_null_samples = num_null_samples;
        Ok(())
    }

    pub fn num_null_samples(&self) -> usize {
        self.config.num_null_samples
    }

    pub fn set_statistic_type(&mut self, stype: StatisticType) {
        self.config.statistic_type = stype;
    }

    pub fn statistic_type(&self) -> StatisticType {
        self.config.statistic_type
    }

    pub fn set_variance_estimation_method(&mut self, method: VarianceEstimationMethod) {
        self.config.variance_estimation_method = method;
    }

    pub fn variance_estimation_method(&self) -> VarianceEstimationMethod {
        self.config.variance_estimation_method
    }

    pub fn set_null_approximation_method(&mut self, method: NullApproximationMethod) {
        self.config.null_approximation_method = method;
    }

    pub fn null_approximation_method(&self) -> NullApproximationMethod {
        self.config.null_approximation_method
    }

    pub fn set_kernel_selection_method(&mut self, method: KernelSelectionMethod) {
        self.config.kernel_selection_method = method;
    }

    pub fn kernel_selection_method(&self) -> KernelSelectionMethod {
        self.config.kernel_selection_method
    }

    pub fn set_simulate_null(&mut self, simulate_null: bool) {
        self.config.simulate_null = simulate_null;
    }

    pub fn simulate_null(&self) -> bool {
        self.config.simulate_null
    }

    /// Route jobs through the backend installed with
    /// [`StreamingMmd::set_gpu_backend`].
    pub fn set_use_gpu(&mut self, use_gpu: bool) {
        self.config.use_gpu = use_gpu;
    }

    pub fn uses_gpu(&self) -> bool {
        self.config.use_gpu
    }

    pub fn set_gpu_backend(&mut self, backend: Box<dyn ComputeBackend>) {
        self.gpu_backend = Some(backend);
    }

    /// Replace the default rayon backend.
    pub fn set_backend(&mut self, backend: Box<dyn ComputeBackend>) {
        self.backend = backend;
    }

    pub fn set_max_kernel_matrix_elements(&mut self, limit: Option<usize>) {
        self.config.max_kernel_matrix_elements = limit;
    }

    /// Reseed the permutation source.
    pub fn set_seed(&mut self, seed: u64) {
        self.config.seed = Some(seed);
        self.rng = StdRng::seed_from_u64(seed);
    }

    // =========================================================================
    // Statistic and variance
    // =========================================================================

    /// One streaming pass for a single active kernel.
    pub fn compute_statistic_variance(&mut self) -> Result<StatisticVariance> {
        self.single_kernel_pass(true)
    }

    /// Statistic only; the variance job is not run, so blocks below the
    /// direct variance minimum of 4 samples still work.
    pub fn compute_statistic(&mut self) -> Result<f64> {
        Ok(self.single_kernel_pass(false)?.statistic)
    }

    pub fn compute_variance(&mut self) -> Result<f64> {
        Ok(self.compute_statistic_variance()?.variance)
    }

    /// One streaming pass for every active kernel.
    ///
    /// With `multi_kernel` the kernel has to be combined, and one result per
    /// sub-kernel comes back in registration order.
    pub fn compute_statistic_variances(
        &mut self,
        multi_kernel: bool,
    ) -> Result<Vec<StatisticVariance>> {
        self.kernel_pass(multi_kernel, true)
    }

    pub fn compute_statistics(&mut self, multi_kernel: bool) -> Result<Vec<f64>> {
        Ok(self
            .kernel_pass(multi_kernel, false)?
            .iter()
            .map(|r| r.statistic)
            .collect())
    }

    pub fn compute_variances(&mut self, multi_kernel: bool) -> Result<Vec<f64>> {
        Ok(self
            .compute_statistic_variances(multi_kernel)?
            .iter()
            .map(|r| r.variance)
            .collect())
    }

    fn single_kernel_pass(&mut self, with_variance: bool) -> Result<StatisticVariance> {
        let kernels = self.cloned_active_kernels()?;
        if kernels.len() > 1 {
            return Err(Error::MultipleKernels(kernels.len()));
        }
        let mut results = self.run_statistic_variance(&kernels, with_variance)?;
        results.pop().ok_or(Error::KernelNotSet)
    }

    fn kernel_pass(
        &mut self,
        multi_kernel: bool,
        with_variance: bool,
    ) -> Result<Vec<StatisticVariance>> {
        if !multi_kernel {
            return Ok(vec![self.single_kernel_pass(with_variance)?]);
        }
        let kernel_type = self
            .kernels
            .kernel_at(0)
            .ok_or(Error::KernelNotSet)?
            .kernel_type();
        if kernel_type != KernelType::Combined {
            return Err(Error::NotCombined(kernel_type));
        }
        let kernels = self.cloned_active_kernels()?;
        self.run_statistic_variance(&kernels, with_variance)
    }

    /// Without `with_variance` only the statistic job runs and the reported
    /// variance is NaN.
    fn run_statistic_variance(
        &mut self,
        kernels: &[Box<dyn Kernel>],
        with_variance: bool,
    ) -> Result<Vec<StatisticVariance>> {
        let config = self.config.clone();
        let dims = SampleDims::from_data_manager(&self.data)?;
        self.variant.validate(&config, &dims)?;

        let (bx, by) = (dims.blocksize_p, dims.blocksize_q);
        let statistic_job: Job = Arc::new(ComputeMmd::new(bx, by, config.statistic_type)?);
        let mut jobs = vec![statistic_job];
        if with_variance {
            jobs.push(match config.variance_estimation_method {
                VarianceEstimationMethod::Direct => self.variant.direct_estimation_method(bx, by)?,
                VarianceEstimationMethod::Permutation => {
                    Arc::new(WithinBlockPermutation::new(bx, by, config.statistic_type)?)
                }
            });
        }

        let mut estimates =
            MultiKernelEstimate::new(kernels.len(), config.variance_estimation_method);
        self.stream(kernels, jobs, &config, |results| {
            for (k, blocks) in results.iter().enumerate() {
                for values in blocks.iter().flatten() {
                    estimates.fold(k, values[0], values.get(1).copied().unwrap_or(f64::NAN));
                }
            }
            Ok(())
        })?;

        let variant = self.variant;
        estimates
            .iter()
            .enumerate()
            .map(|(k, estimate)| {
                if estimate.count() == 0 {
                    return Err(Error::NoBlocksProcessed(k));
                }
                tracing::debug!(
                    kernel = k,
                    statistic = estimate.statistic(),
                    variance = estimate.variance(),
                    "un-normalized estimate"
                );
                let variance = match config.variance_estimation_method {
                    VarianceEstimationMethod::Direct => estimate.variance(),
                    VarianceEstimationMethod::Permutation => {
                        variant.normalize_variance(estimate.variance(), &dims)
                    }
                };
                Ok(StatisticVariance {
                    statistic: variant.normalize_statistic(estimate.statistic(), &dims),
                    variance,
                    num_blocks: estimate.count(),
                })
            })
            .collect()
    }

    // =========================================================================
    // Null distribution
    // =========================================================================

    /// `num_null_samples` statistics, each from a full pass with every merged
    /// block randomly relabelled.
    ///
    /// `simulate_null` is forced on for the duration of the call and restored
    /// afterwards, also when a pass fails.
    pub fn sample_null(&mut self) -> Result<Vec<f64>> {
        self.variant.validate_null_approximation(&self.config)?;
        let num_null_samples = self.config.num_null_samples;

        let mut guard = SimulateNullGuard::new(self);
        let mut null_samples = Vec::with_capacity(num_null_samples);
        for _ in 0..num_null_samples {
            null_samples.push(guard.compute_statistic()?);
        }
        drop(guard);

        tracing::info!(
            variant = self.variant.name(),
            num_null_samples,
            "sampled null distribution"
        );
        Ok(null_samples)
    }

    /// Same distribution as [`StreamingMmd::sample_null`] from a single pass:
    /// every block kernel matrix is reused for all `num_null_samples`
    /// within-block permutations.
    pub fn sample_null_single_pass(&mut self) -> Result<Vec<f64>> {
        self.variant.validate_null_approximation(&self.config)?;
        let config = self.config.clone();
        let kernels = self.cloned_active_kernels()?;
        if kernels.len() > 1 {
            return Err(Error::MultipleKernels(kernels.len()));
        }
        let dims = SampleDims::from_data_manager(&self.data)?;
        self.variant.validate(&config, &dims)?;

        let permutation: Job = Arc::new(WithinBlockPermutation::new(
            dims.blocksize_p,
            dims.blocksize_q,
            config.statistic_type,
        )?);
        let jobs = vec![permutation; config.num_null_samples];

        let mut null_samples = vec![0.0; config.num_null_samples];
        let mut count = 0;
        self.stream(&kernels, jobs, &config, |results| {
            for values in results[0].iter().flatten() {
                count += 1;
                for (sample, &v) in null_samples.iter_mut().zip(values) {
                    *sample = fold_mean(*sample, count, v);
                }
            }
            Ok(())
        })?;
        if count == 0 {
            return Err(Error::NoBlocksProcessed(0));
        }

        let variant = self.variant;
        Ok(null_samples
            .into_iter()
            .map(|v| variant.normalize_statistic(v, &dims))
            .collect())
    }

    /// Fraction of null samples at least as large as `statistic`.
    pub fn compute_p_value(&mut self, statistic: f64) -> Result<f64> {
        let null_samples = self.sample_null()?;
        Ok(p_value(&null_samples, statistic))
    }

    /// Empirical `1 - alpha` quantile of the null distribution.
    pub fn compute_threshold(&mut self, alpha: f64) -> Result<f64> {
        check_alpha(alpha)?;
        let mut null_samples = self.sample_null()?;
        Ok(threshold(&mut null_samples, alpha))
    }

    /// Statistic, p-value and threshold from one statistic pass and one null
    /// sample.
    pub fn perform_test(&mut self, alpha: f64) -> Result<TestResult> {
        check_alpha(alpha)?;
        let statistic = self.compute_statistic()?;
        let mut null_samples = self.sample_null()?;
        let p_value = p_value(&null_samples, statistic);
        let threshold = threshold(&mut null_samples, alpha);
        let result = TestResult {
            statistic,
            p_value,
            threshold,
            alpha,
            reject_null: p_value < alpha,
            num_null_samples: null_samples.len(),
        };
        tracing::info!(
            variant = self.variant.name(),
            statistic,
            p_value,
            threshold,
            reject_null = result.reject_null,
            "performed test"
        );
        Ok(result)
    }

    // =========================================================================
    // Kernel selection
    // =========================================================================

    /// Normalized statistic per candidate kernel and the Q matrix, the
    /// running mean of `(h_i[2k] - h_i[2k+1]) (h_j[2k] - h_j[2k+1])` over
    /// consecutive block pairs.
    ///
    /// Every burst has to hold an even number of blocks.
    pub fn compute_statistic_and_q(
        &mut self,
        candidates: &KernelManager,
    ) -> Result<(Vec<f64>, Array2<f64>)> {
        let kernels = candidate_kernels(candidates)?;
        let num_kernels = kernels.len();

        let config = self.config.clone();
        let dims = SampleDims::from_data_manager(&self.data)?;
        self.variant.validate(&config, &dims)?;
        let statistic_job: Job = Arc::new(ComputeMmd::new(
            dims.blocksize_p,
            dims.blocksize_q,
            config.statistic_type,
        )?);

        let mut statistics = vec![0.0; num_kernels];
        let mut counts = vec![0usize; num_kernels];
        let mut q = Array2::<f64>::zeros((num_kernels, num_kernels));
        let mut q_counts = Array2::<usize>::zeros((num_kernels, num_kernels));

        self.stream(&kernels, vec![statistic_job], &config, |results| {
            let num_blocks = results[0].len();
            if num_blocks % 2 != 0 {
                return Err(Error::InvalidConfig(format!(
                    "the number of blocks per burst ({num_blocks} this burst) has to be even"
                )));
            }
            let h: Vec<Vec<Option<f64>>> = results
                .iter()
                .map(|blocks| blocks.iter().map(|v| v.as_ref().map(|v| v[0])).collect())
                .collect();

            for (k, values) in h.iter().enumerate() {
                for &v in values.iter().flatten() {
                    counts[k] += 1;
                    statistics[k] = fold_mean(statistics[k], counts[k], v);
                }
            }
            for i in 0..num_kernels {
                for j in 0..=i {
                    for b in (0..num_blocks).step_by(2) {
                        let (Some(hi0), Some(hi1), Some(hj0), Some(hj1)) =
                            (h[i][b], h[i][b + 1], h[j][b], h[j][b + 1])
                        else {
                            continue;
                        };
                        let term = (hi0 - hi1) * (hj0 - hj1);
                        q_counts[[i, j]] += 1;
                        q[[i, j]] = fold_mean(q[[i, j]], q_counts[[i, j]], term);
                    }
                    q[[j, i]] = q[[i, j]];
                }
            }
            Ok(())
        })?;

        if let Some(k) = counts.iter().position(|&c| c == 0) {
            return Err(Error::NoBlocksProcessed(k));
        }
        let variant = self.variant;
        let statistics = statistics
            .into_iter()
            .map(|v| variant.normalize_statistic(v, &dims))
            .collect();
        Ok((statistics, q))
    }

    /// Score every kernel in `candidates` with the configured
    /// [`KernelSelectionMethod`], install the best one as the test kernel
    /// and return its index.
    ///
    /// Candidates are scored as given; a combined candidate counts as one
    /// kernel.
    pub fn select_kernel(&mut self, candidates: &KernelManager) -> Result<usize> {
        let mut kernels = candidate_kernels(candidates)?;
        let method = self.config.kernel_selection_method;
        let selected = match method {
            KernelSelectionMethod::MaximizeMmd => {
                let measures: Vec<f64> = self
                    .run_statistic_variance(&kernels, false)?
                    .iter()
                    .map(|r| r.statistic)
                    .collect();
                argmax(&measures)?
            }
            KernelSelectionMethod::MaximizePower => {
                let measures: Vec<f64> = self
                    .run_statistic_variance(&kernels, true)?
                    .iter()
                    .map(|r| power_ratio(r.statistic, r.variance))
                    .collect();
                argmax(&measures)?
            }
            KernelSelectionMethod::MedianHeuristic => {
                let sigma = median_bandwidth(&self.first_burst()?);
                let bandwidths: Vec<Option<f64>> =
                    kernels.iter().map(|k| k.bandwidth()).collect();
                tracing::debug!(sigma, "median heuristic bandwidth");
                closest_bandwidth(&bandwidths, sigma)?
            }
        };

        tracing::info!(
            method = ?method,
            selected,
            candidates = kernels.len(),
            "selected kernel"
        );
        self.set_kernel(kernels.swap_remove(selected));
        Ok(selected)
    }

    /// All samples of the first burst, P and Q blocks merged.
    fn first_burst(&mut self) -> Result<Features> {
        let burst = self.data.start().and_then(|()| self.data.next());
        self.data.end();

        let mut pairs = burst?.into_pairs().into_iter();
        let (p, q) = pairs.next().ok_or(Error::EmptyInput)?;
        let mut merged = p.create_merged_copy(&q)?;
        for (p, q) in pairs {
            merged = merged.create_merged_copy(&p)?.create_merged_copy(&q)?;
        }
        Ok(merged)
    }

    // =========================================================================
    // Streaming pass
    // =========================================================================

    fn cloned_active_kernels(&self) -> Result<Vec<Box<dyn Kernel>>> {
        Ok(self
            .kernels
            .active_kernels(0)?
            .into_iter()
            .map(|k| k.clone_kernel())
            .collect())
    }

    /// Run `jobs` for every kernel over one full pass, handing each burst's
    /// results to `fold`. Returns the number of blocks streamed.
    fn stream<F>(
        &mut self,
        kernels: &[Box<dyn Kernel>],
        jobs: Vec<Job>,
        config: &MmdConfig,
        mut fold: F,
    ) -> Result<usize>
    where
        F: FnMut(&BurstResults) -> Result<()>,
    {
        let backend: &dyn ComputeBackend = if config.use_gpu {
            self.gpu_backend
                .as_deref()
                .ok_or(Error::BackendUnavailable)?
        } else {
            &*self.backend
        };

        let mut cm = ComputationManager::new();
        for job in jobs {
            cm.enqueue_job(job);
        }

        let outcome = self.data.start().and_then(|()| {
            drive(
                &mut self.data,
                &mut self.rng,
                backend,
                &mut cm,
                kernels,
                config,
                &mut fold,
            )
        });
        self.data.end();
        cm.done();

        let num_blocks = outcome?;
        tracing::debug!(
            variant = self.variant.name(),
            backend = backend.name(),
            kernels = kernels.len(),
            num_blocks,
            simulate_null = config.simulate_null,
            "streaming pass finished"
        );
        Ok(num_blocks)
    }
}

fn drive<F>(
    data: &mut DataManager,
    rng: &mut StdRng,
    backend: &dyn ComputeBackend,
    cm: &mut ComputationManager,
    kernels: &[Box<dyn Kernel>],
    config: &MmdConfig,
    fold: &mut F,
) -> Result<usize>
where
    F: FnMut(&BurstResults) -> Result<()>,
{
    let mut blocks_seen = 0;
    loop {
        let burst = data.next()?;
        if burst.is_empty() {
            break;
        }
        let num_blocks = burst.num_blocks();

        // (permutation seed, job seed) per block, drawn before fanning out
        let seeds: Vec<(u64, u64)> = (0..num_blocks)
            .map(|_| (rng.random(), rng.random()))
            .collect();
        let merged = merge_blocks(burst, &seeds, config.simulate_null)?;

        let mut results = Vec::with_capacity(kernels.len());
        for (k, kernel) in kernels.iter().enumerate() {
            let built: Vec<Result<KernelBlock>> = merged
                .par_iter()
                .enumerate()
                .map(|(b, block)| {
                    kernel_block(
                        &**kernel,
                        block,
                        b,
                        seeds[b].1,
                        config.max_kernel_matrix_elements,
                    )
                })
                .collect();

            let mut values: Vec<Option<Vec<f64>>> = vec![None; num_blocks];
            for (b, block) in built.into_iter().enumerate() {
                match block {
                    Ok(block) => cm.push_data(block),
                    Err(e) => report_block_failure(k, blocks_seen + b, e),
                }
            }
            for result in cm.compute(backend) {
                match result.values {
                    Ok(v) => values[result.index] = Some(v),
                    Err(e) => report_block_failure(k, blocks_seen + result.index, e),
                }
            }
            results.push(values);
        }

        fold(&results)?;
        blocks_seen += num_blocks;
    }
    Ok(blocks_seen)
}

fn candidate_kernels(candidates: &KernelManager) -> Result<Vec<Box<dyn Kernel>>> {
    if candidates.is_empty() {
        return Err(Error::InvalidConfig(
            "no kernels specified for kernel selection".to_string(),
        ));
    }
    Ok((0..candidates.num_kernels())
        .filter_map(|k| candidates.kernel_at(k))
        .map(|k| k.clone_kernel())
        .collect())
}

fn merge_blocks(burst: Burst, seeds: &[(u64, u64)], simulate_null: bool) -> Result<Vec<Features>> {
    burst
        .into_pairs()
        .into_par_iter()
        .zip(seeds.par_iter())
        .map(|((p, q), &(perm_seed, _))| {
            let mut merged = p.create_merged_copy(&q)?;
            if simulate_null {
                let mut perm: Vec<usize> = (0..merged.num_vectors()).collect();
                perm.shuffle(&mut StdRng::seed_from_u64(perm_seed));
                merged.add_subset(&perm)?;
            }
            Ok(merged)
        })
        .collect()
}

/// Clone, bind, evaluate, release.
fn kernel_block(
    kernel: &dyn Kernel,
    block: &Features,
    index: usize,
    seed: u64,
    max_elements: Option<usize>,
) -> Result<KernelBlock> {
    let bound = BoundKernel::init(kernel, block, block)?;
    let kernel_matrix = bound.kernel_matrix(max_elements)?;
    bound.remove_lhs_and_rhs();
    Ok(KernelBlock {
        index,
        kernel_matrix,
        seed,
    })
}

fn report_block_failure(kernel: usize, block: usize, source: Error) {
    let err = Error::KernelMatrix {
        kernel,
        block,
        source: Box::new(source),
    };
    tracing::error!("{err}");
}

/// Restores `simulate_null` when dropped.
struct SimulateNullGuard<'a> {
    mmd: &'a mut StreamingMmd,
    previous: bool,
}

impl<'a> SimulateNullGuard<'a> {
    fn new(mmd: &'a mut StreamingMmd) -> Self {
        let previous = mmd.config.simulate_null;
        mmd.config.simulate_null = true;
        Self { mmd, previous }
    }
}

impl Deref for SimulateNullGuard<'_> {
    type Target = StreamingMmd;

    fn deref(&self) -> &StreamingMmd {
        self.mmd
    }
}

impl DerefMut for SimulateNullGuard<'_> {
    fn deref_mut(&mut self) -> &mut StreamingMmd {
        self.mmd
    }
}

impl Drop for SimulateNullGuard<'_> {
    fn drop(&mut self) {
        self.mmd.config.simulate_null = self.previous;
    }
}

fn check_alpha(alpha: f64) -> Result<()> {
    if !(alpha > 0.0 && alpha < 1.0) {
        return Err(Error::InvalidConfig(format!(
            "alpha has to be in (0, 1), given {alpha}"
        )));
    }
    Ok(())
}

fn p_value(null_samples: &[f64], statistic: f64) -> f64 {
    let larger = null_samples.iter().filter(|&&v| v >= statistic).count();
    larger as f64 / null_samples.len() as f64
}

fn threshold(null_samples: &mut [f64], alpha: f64) -> f64 {
    null_samples.sort_by(|a, b| a.total_cmp(b));
    let n = null_samples.len();
    let index = ((n as f64 * (1.0 - alpha)).floor() as usize).min(n - 1);
    null_samples[index]
}

//! Running estimator jobs over kernel matrices.
//!
//! A [`ComputationManager`] holds a fixed list of jobs and a queue of kernel
//! matrices. [`ComputationManager::compute`] applies every job to every queued
//! matrix on a [`ComputeBackend`] and hands back one result per matrix.

use std::fmt;

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;

use crate::estimator::Job;
use crate::Result;

/// Kernel matrix of one merged block, owned by whoever computes on it.
#[derive(Debug, Clone)]
pub struct KernelBlock {
    /// Position of the block within its burst.
    pub index: usize,
    pub kernel_matrix: Array2<f64>,
    /// Seeds the per-job generators for this block.
    pub seed: u64,
}

/// Outcome of all jobs on one block, in job order.
#[derive(Debug)]
pub struct BlockResult {
    pub index: usize,
    pub values: Result<Vec<f64>>,
}

/// Executes jobs over a batch of kernel blocks.
///
/// Implementations must return exactly one result per block, in input
/// order.
pub trait ComputeBackend: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn run(&self, jobs: &[Job], data: &[KernelBlock]) -> Vec<BlockResult>;
}

/// Apply `jobs` to one block. Job `j` draws from a generator seeded with
/// `block.seed + j`.
pub fn run_jobs(jobs: &[Job], block: &KernelBlock) -> BlockResult {
    let values = jobs
        .iter()
        .enumerate()
        .map(|(j, job)| {
            let mut rng = StdRng::seed_from_u64(block.seed.wrapping_add(j as u64));
            job.estimate(block.kernel_matrix.view(), &mut rng)
        })
        .collect();
    BlockResult {
        index: block.index,
        values,
    }
}

/// Data-parallel over blocks using the rayon thread pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuBackend;

impl ComputeBackend for CpuBackend {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn run(&self, jobs: &[Job], data: &[KernelBlock]) -> Vec<BlockResult> {
        data.par_iter().map(|block| run_jobs(jobs, block)).collect()
    }
}

/// One block after another on the calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct SequentialBackend;

impl ComputeBackend for SequentialBackend {
    fn name(&self) -> &'static str {
        "sequential"
    }

    fn run(&self, jobs: &[Job], data: &[KernelBlock]) -> Vec<BlockResult> {
        data.iter().map(|block| run_jobs(jobs, block)).collect()
    }
}

/// Jobs plus a queue of kernel blocks awaiting them.
#[derive(Debug, Default)]
pub struct ComputationManager {
    jobs: Vec<Job>,
    data: Vec<KernelBlock>,
}

impl ComputationManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue_job(&mut self, job: Job) {
        self.jobs.push(job);
    }

    pub fn num_jobs(&self) -> usize {
        self.jobs.len()
    }

    pub fn push_data(&mut self, block: KernelBlock) {
        self.data.push(block);
    }

    pub fn num_data(&self) -> usize {
        self.data.len()
    }

    /// Run every job on every queued block and drain the queue.
    pub fn compute(&mut self, backend: &dyn ComputeBackend) -> Vec<BlockResult> {
        let data = std::mem::take(&mut self.data);
        tracing::debug!(
            backend = backend.name(),
            jobs = self.jobs.len(),
            blocks = data.len(),
            "computing jobs"
        );
        backend.run(&self.jobs, &data)
    }

    /// Drop jobs and any queued data.
    pub fn done(&mut self) {
        self.jobs.clear();
        self.data.clear();
    }
}

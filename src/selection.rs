//! Kernel selection criteria.
//!
//! [`StreamingMmd::select_kernel`](crate::StreamingMmd::select_kernel) scores
//! every candidate kernel with one of these methods and installs the best
//! one. The helpers here turn per-candidate measurements into that choice.

use crate::{Error, Result};

/// Added to the variance before taking the power ratio, so that
/// near-degenerate candidates do not win on a vanishing variance.
pub const POWER_REGULARIZER: f64 = 1e-5;

/// How candidate kernels are ranked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum KernelSelectionMethod {
    /// Largest MMD statistic.
    #[default]
    MaximizeMmd,
    /// Largest ratio of statistic to its standard deviation, a proxy for
    /// test power (Gretton et al. 2012, "Optimal kernel choice").
    MaximizePower,
    /// Gaussian candidate whose bandwidth is closest to the median
    /// heuristic on the first burst of data.
    MedianHeuristic,
}

/// `statistic / sqrt(variance + λ)` with λ = [`POWER_REGULARIZER`].
pub fn power_ratio(statistic: f64, variance: f64) -> f64 {
    statistic / (variance + POWER_REGULARIZER).sqrt()
}

/// Index of the largest finite measure; ties go to the earlier candidate.
pub fn argmax(measures: &[f64]) -> Result<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, &m) in measures.iter().enumerate() {
        if !m.is_finite() {
            continue;
        }
        match best {
            Some((_, b)) if m <= b => {}
            _ => best = Some((i, m)),
        }
    }
    best.map(|(i, _)| i).ok_or_else(|| {
        Error::InvalidConfig("no candidate kernel produced a finite measure".to_string())
    })
}

/// Index of the candidate bandwidth closest to `target`; candidates without
/// a bandwidth are skipped.
pub fn closest_bandwidth(bandwidths: &[Option<f64>], target: f64) -> Result<usize> {
    let distances: Vec<f64> = bandwidths
        .iter()
        .map(|b| b.map_or(f64::NAN, |sigma| -(sigma - target).abs()))
        .collect();
    argmax(&distances).map_err(|_| {
        Error::InvalidConfig("median heuristic needs at least one Gaussian candidate".to_string())
    })
}

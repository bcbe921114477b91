//! Block and burst production from two sample sources.
//!
//! [`DataManager`] hides whether a sample lives in memory or is generated on
//! the fly. Each call to [`DataManager::next`] pulls `blocksize *
//! num_blocks_per_burst` samples from each source and cuts them into blocks.
//! Bursts from P and Q always carry the same number of blocks; an empty burst
//! signals that the stream is exhausted.

use std::fmt;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::features::Features;
use crate::{Error, Result};

/// A finite or streaming sample of feature vectors.
pub trait SampleSource: Send + fmt::Debug {
    /// Total number of samples one pass yields.
    fn num_samples(&self) -> usize;

    fn dim(&self) -> usize;

    /// Rewind to the first sample.
    fn start(&mut self) -> Result<()>;

    /// Up to `num` further samples, or `None` once exhausted.
    fn fetch(&mut self, num: usize) -> Result<Option<Features>>;

    /// Release per-pass resources.
    fn end(&mut self);
}

// =============================================================================
// Sources
// =============================================================================

/// In-memory sample.
#[derive(Debug, Clone)]
pub struct DenseSource {
    features: Features,
    cursor: usize,
}

impl DenseSource {
    pub fn new(features: Features) -> Self {
        Self {
            features,
            cursor: 0,
        }
    }

    pub fn features(&self) -> &Features {
        &self.features
    }
}

impl SampleSource for DenseSource {
    fn num_samples(&self) -> usize {
        self.features.num_vectors()
    }

    fn dim(&self) -> usize {
        self.features.dim()
    }

    fn start(&mut self) -> Result<()> {
        self.cursor = 0;
        Ok(())
    }

    fn fetch(&mut self, num: usize) -> Result<Option<Features>> {
        let remaining = self.num_samples() - self.cursor;
        let take = num.min(remaining);
        if take == 0 {
            return Ok(None);
        }
        let block = self.features.slice(self.cursor, take)?;
        self.cursor += take;
        Ok(Some(block))
    }

    fn end(&mut self) {
        self.cursor = self.num_samples();
    }
}

/// Streaming N(0, I) samples with `mean_shift` added to one dimension.
///
/// The stream is generated on demand and replayed identically on every
/// [`SampleSource::start`].
#[derive(Debug, Clone)]
pub struct MeanShiftSource {
    num_samples: usize,
    dim: usize,
    mean_shift: f64,
    shift_dimension: usize,
    seed: u64,
    rng: StdRng,
    produced: usize,
}

impl MeanShiftSource {
    /// `num_samples` vectors of dimension `dim`, shifted along dimension 0.
    pub fn new(num_samples: usize, dim: usize, mean_shift: f64) -> Result<Self> {
        if num_samples == 0 || dim == 0 {
            return Err(Error::EmptyInput);
        }
        if !mean_shift.is_finite() {
            return Err(Error::InvalidConfig(format!(
                "mean shift must be finite, got {mean_shift}"
            )));
        }
        let seed = rand::rng().random();
        Ok(Self {
            num_samples,
            dim,
            mean_shift,
            shift_dimension: 0,
            seed,
            rng: StdRng::seed_from_u64(seed),
            produced: 0,
        })
    }

    pub fn shift_dimension(mut self, dimension: usize) -> Result<Self> {
        if dimension >= self.dim {
            return Err(Error::IndexOutOfBounds {
                index: dimension,
                len: self.dim,
            });
        }
        self.shift_dimension = dimension;
        Ok(self)
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn mean_shift(&self) -> f64 {
        self.mean_shift
    }
}

impl SampleSource for MeanShiftSource {
    fn num_samples(&self) -> usize {
        self.num_samples
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn start(&mut self) -> Result<()> {
        self.rng = StdRng::seed_from_u64(self.seed);
        self.produced = 0;
        Ok(())
    }

    fn fetch(&mut self, num: usize) -> Result<Option<Features>> {
        let take = num.min(self.num_samples - self.produced);
        if take == 0 {
            return Ok(None);
        }
        let rows: Vec<Vec<f64>> = (0..take)
            .map(|_| {
                let mut row: Vec<f64> = (0..self.dim)
                    .map(|_| self.rng.sample(StandardNormal))
                    .collect();
                row[self.shift_dimension] += self.mean_shift;
                row
            })
            .collect();
        self.produced += take;
        Features::from_rows(&rows).map(Some)
    }

    fn end(&mut self) {
        self.produced = self.num_samples;
    }
}

// =============================================================================
// Bursts
// =============================================================================

/// Paired blocks from P and Q pulled in one step.
#[derive(Debug, Clone, Default)]
pub struct Burst {
    p: Vec<Features>,
    q: Vec<Features>,
}

impl Burst {
    /// Pair up blocks; both sides need the same number of blocks.
    pub fn new(p: Vec<Features>, q: Vec<Features>) -> Result<Self> {
        if p.len() != q.len() {
            return Err(Error::DimensionMismatch(p.len(), q.len()));
        }
        Ok(Self { p, q })
    }

    pub fn num_blocks(&self) -> usize {
        self.p.len()
    }

    /// An empty burst marks the end of the stream.
    pub fn is_empty(&self) -> bool {
        self.p.is_empty()
    }

    pub fn pairs(&self) -> impl Iterator<Item = (&Features, &Features)> {
        self.p.iter().zip(self.q.iter())
    }

    pub fn into_pairs(self) -> Vec<(Features, Features)> {
        self.p.into_iter().zip(self.q).collect()
    }
}

// =============================================================================
// DataManager
// =============================================================================

const NUM_SOURCES: usize = 2;

/// Pulls bursts of paired blocks from a sample from P and a sample from Q.
///
/// Defaults to full-data mode: one block per source spanning all of its
/// samples.
#[derive(Debug)]
pub struct DataManager {
    sources: Vec<Box<dyn SampleSource>>,
    blocksizes: Vec<usize>,
    num_blocks_per_burst: usize,
    running: bool,
}

impl DataManager {
    pub fn new(p: Box<dyn SampleSource>, q: Box<dyn SampleSource>) -> Result<Self> {
        if p.num_samples() == 0 || q.num_samples() == 0 {
            return Err(Error::EmptyInput);
        }
        if p.dim() != q.dim() {
            return Err(Error::DimensionMismatch(p.dim(), q.dim()));
        }
        let blocksizes = vec![p.num_samples(), q.num_samples()];
        Ok(Self {
            sources: vec![p, q],
            blocksizes,
            num_blocks_per_burst: 1,
            running: false,
        })
    }

    fn check_index(&self, i: usize) -> Result<()> {
        if i >= NUM_SOURCES {
            return Err(Error::IndexOutOfBounds {
                index: i,
                len: NUM_SOURCES,
            });
        }
        Ok(())
    }

    /// Total number of samples over both sources.
    pub fn num_samples(&self) -> usize {
        self.sources.iter().map(|s| s.num_samples()).sum()
    }

    pub fn num_samples_at(&self, i: usize) -> Result<usize> {
        self.check_index(i)?;
        Ok(self.sources[i].num_samples())
    }

    pub fn blocksize_at(&self, i: usize) -> Result<usize> {
        self.check_index(i)?;
        Ok(self.blocksizes[i])
    }

    pub fn dim(&self) -> usize {
        self.sources[0].dim()
    }

    pub fn num_blocks_per_burst(&self) -> usize {
        self.num_blocks_per_burst
    }

    /// Blocks one full pass yields.
    pub fn num_blocks(&self) -> usize {
        (0..NUM_SOURCES)
            .map(|i| self.sources[i].num_samples() / self.blocksizes[i])
            .min()
            .unwrap_or(0)
    }

    /// Smallest merged blocksize that splits both samples evenly.
    pub fn min_blocksize(&self) -> usize {
        let divisor = self
            .sources
            .iter()
            .fold(0, |acc, s| gcd(acc, s.num_samples()));
        self.num_samples() / divisor
    }

    /// One block per source spanning the whole sample.
    pub fn set_full_data(&mut self) {
        for i in 0..NUM_SOURCES {
            self.blocksizes[i] = self.sources[i].num_samples();
        }
        self.num_blocks_per_burst = 1;
    }

    /// Whether samples are served in blocks smaller than the full sample.
    pub fn is_blockwise(&self) -> bool {
        (0..NUM_SOURCES).any(|i| self.blocksizes[i] < self.sources[i].num_samples())
    }

    /// Split a merged blocksize across P and Q in proportion to their
    /// sample counts.
    ///
    /// Both the total and each share have to divide evenly.
    pub fn set_blocksize(&mut self, blocksize: usize) -> Result<()> {
        let n = self.num_samples();
        if blocksize == 0 || blocksize > n {
            return Err(Error::InvalidConfig(format!(
                "the blocksize has to be within [1, {n}], given {blocksize}"
            )));
        }
        if n % blocksize != 0 {
            return Err(Error::InvalidConfig(format!(
                "total number of samples ({n}) has to be divisible by the blocksize ({blocksize})"
            )));
        }
        let mut shares = Vec::with_capacity(NUM_SOURCES);
        for source in &self.sources {
            let m = source.num_samples();
            if (blocksize * m) % n != 0 {
                return Err(Error::InvalidConfig(format!(
                    "blocksize ({blocksize}) cannot be evenly distributed with a ratio of {m}/{n}"
                )));
            }
            shares.push(blocksize * m / n);
        }
        tracing::debug!(blocksize_p = shares[0], blocksize_q = shares[1], "set blocksizes");
        self.blocksizes = shares;
        Ok(())
    }

    /// Set per-source blocksizes directly.
    pub fn set_blocksizes(&mut self, blocksize_p: usize, blocksize_q: usize) -> Result<()> {
        for (i, &bs) in [blocksize_p, blocksize_q].iter().enumerate() {
            let m = self.sources[i].num_samples();
            if bs == 0 || bs > m {
                return Err(Error::InvalidConfig(format!(
                    "blocksize for source {i} has to be within [1, {m}], given {bs}"
                )));
            }
        }
        self.blocksizes = vec![blocksize_p, blocksize_q];
        Ok(())
    }

    /// Number of blocks per burst, clamped to what the samples allow.
    pub fn set_num_blocks_per_burst(&mut self, num_blocks_per_burst: usize) -> Result<()> {
        if num_blocks_per_burst == 0 {
            return Err(Error::InvalidConfig(
                "number of blocks per burst has to be greater than 0".to_string(),
            ));
        }
        let merged_blocksize: usize = self.blocksizes.iter().sum();
        let max = (self.num_samples() / merged_blocksize).max(1);
        if num_blocks_per_burst > max {
            tracing::warn!(
                requested = num_blocks_per_burst,
                max,
                merged_blocksize,
                "too many blocks per burst for the blocksize, clamping"
            );
            self.num_blocks_per_burst = max;
        } else {
            self.num_blocks_per_burst = num_blocks_per_burst;
        }
        Ok(())
    }

    /// Rewind every source.
    ///
    /// Sources started before a failing one stay started; call
    /// [`DataManager::end`] on error as well.
    pub fn start(&mut self) -> Result<()> {
        for (i, source) in self.sources.iter_mut().enumerate() {
            source.start().map_err(|e| stream_error(i, e))?;
        }
        self.running = true;
        Ok(())
    }

    /// The next burst; empty once any source is exhausted.
    pub fn next(&mut self) -> Result<Burst> {
        if !self.running {
            return Err(Error::InvalidConfig(
                "stream is not started, call start() first".to_string(),
            ));
        }

        let mut blocks: Vec<Vec<Features>> = Vec::with_capacity(NUM_SOURCES);
        for i in 0..NUM_SOURCES {
            let blocksize = self.blocksizes[i];
            let fetched = self.sources[i]
                .fetch(blocksize * self.num_blocks_per_burst)
                .map_err(|e| stream_error(i, e))?;
            let Some(feats) = fetched else {
                blocks.push(Vec::new());
                continue;
            };
            let n = feats.num_vectors();
            if n % blocksize != 0 {
                tracing::debug!(
                    source = i,
                    dropped = n % blocksize,
                    "dropping samples that do not fill a block"
                );
            }
            let source_blocks = (0..n / blocksize)
                .map(|b| feats.slice(b * blocksize, blocksize))
                .collect::<Result<Vec<_>>>()
                .map_err(|e| stream_error(i, e))?;
            blocks.push(source_blocks);
        }

        let mut q = blocks.pop().unwrap_or_default();
        let mut p = blocks.pop().unwrap_or_default();
        if p.len() != q.len() {
            tracing::warn!(
                blocks_p = p.len(),
                blocks_q = q.len(),
                "sources yielded unequal block counts, truncating to the shorter"
            );
            let n = p.len().min(q.len());
            p.truncate(n);
            q.truncate(n);
        }
        tracing::debug!(num_blocks = p.len(), "fetched burst");
        Ok(Burst { p, q })
    }

    /// Release the sources.
    pub fn end(&mut self) {
        for source in &mut self.sources {
            source.end();
        }
        self.running = false;
    }
}

fn stream_error(source_index: usize, error: Error) -> Error {
    match error {
        Error::Stream { .. } => error,
        other => Error::Stream {
            source_index,
            message: other.to_string(),
        },
    }
}

fn gcd(a: usize, b: usize) -> usize {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dense(n: usize, offset: f64) -> Box<dyn SampleSource> {
        let rows: Vec<Vec<f64>> = (0..n).map(|i| vec![offset + i as f64]).collect();
        Box::new(DenseSource::new(Features::from_rows(&rows).unwrap()))
    }

    fn drain(dm: &mut DataManager) -> Vec<usize> {
        dm.start().unwrap();
        let mut sizes = Vec::new();
        loop {
            let burst = dm.next().unwrap();
            if burst.is_empty() {
                break;
            }
            sizes.push(burst.num_blocks());
        }
        dm.end();
        sizes
    }

    #[test]
    fn test_full_data_default() {
        let mut dm = DataManager::new(dense(5, 0.0), dense(6, 100.0)).unwrap();
        assert!(!dm.is_blockwise());
        assert_eq!(dm.blocksize_at(0).unwrap(), 5);
        assert_eq!(dm.blocksize_at(1).unwrap(), 6);
        assert_eq!(drain(&mut dm), vec![1]);
    }

    #[test]
    fn test_blocksize_split_by_ratio() {
        let mut dm = DataManager::new(dense(20, 0.0), dense(30, 100.0)).unwrap();
        dm.set_blocksize(10).unwrap();
        assert_eq!(dm.blocksize_at(0).unwrap(), 4);
        assert_eq!(dm.blocksize_at(1).unwrap(), 6);
        assert_eq!(dm.num_blocks(), 5);
        assert!(dm.is_blockwise());
    }

    #[test]
    fn test_blocksize_must_divide() {
        let mut dm = DataManager::new(dense(20, 0.0), dense(30, 100.0)).unwrap();
        assert!(dm.set_blocksize(0).is_err());
        assert!(dm.set_blocksize(7).is_err());
        assert!(dm.set_blocksize(51).is_err());
        assert!(dm.set_blocksize(25).is_ok());
        // 2 divides 50 but 2*20/50 is not integral
        assert!(dm.set_blocksize(2).is_err());
        assert_eq!(dm.min_blocksize(), 5);
        assert!(dm.set_blocksize(5).is_ok());
        assert_eq!(dm.blocksize_at(0).unwrap(), 2);
        assert_eq!(dm.blocksize_at(1).unwrap(), 3);
    }

    #[test]
    fn test_blocks_per_burst_clamped() {
        let mut dm = DataManager::new(dense(8, 0.0), dense(8, 100.0)).unwrap();
        dm.set_blocksize(4).unwrap();
        dm.set_num_blocks_per_burst(10).unwrap();
        assert_eq!(dm.num_blocks_per_burst(), 4);
        assert!(dm.set_num_blocks_per_burst(0).is_err());
    }

    #[test]
    fn test_bursts_cover_stream() {
        let mut dm = DataManager::new(dense(10, 0.0), dense(10, 100.0)).unwrap();
        dm.set_blocksize(4).unwrap();
        dm.set_num_blocks_per_burst(2).unwrap();
        // 5 blocks of 2+2, 2 per burst
        assert_eq!(drain(&mut dm), vec![2, 2, 1]);
        // a second pass replays the stream
        assert_eq!(drain(&mut dm), vec![2, 2, 1]);
    }

    #[test]
    fn test_block_contents_in_order() {
        let mut dm = DataManager::new(dense(4, 0.0), dense(4, 100.0)).unwrap();
        dm.set_blocksize(4).unwrap();
        dm.set_num_blocks_per_burst(2).unwrap();
        dm.start().unwrap();
        let burst = dm.next().unwrap();
        let pairs: Vec<_> = burst.pairs().collect();
        assert_eq!(pairs[1].0.vector(0), &[2.0]);
        assert_eq!(pairs[1].1.vector(1), &[103.0]);
        dm.end();
    }

    #[test]
    fn test_next_requires_start() {
        let mut dm = DataManager::new(dense(4, 0.0), dense(4, 100.0)).unwrap();
        assert!(dm.next().is_err());
    }

    #[test]
    fn test_dimension_mismatch() {
        let p = dense(4, 0.0);
        let q = Box::new(DenseSource::new(
            Features::from_rows(&[vec![0.0, 1.0]]).unwrap(),
        ));
        assert!(matches!(
            DataManager::new(p, q),
            Err(Error::DimensionMismatch(1, 2))
        ));
    }

    #[test]
    fn test_mean_shift_replays() {
        let mut source = MeanShiftSource::new(6, 2, 3.0).unwrap().seed(11);
        source.start().unwrap();
        let first = source.fetch(4).unwrap().unwrap();
        let rest = source.fetch(4).unwrap().unwrap();
        assert_eq!(rest.num_vectors(), 2);
        assert!(source.fetch(4).unwrap().is_none());

        source.start().unwrap();
        let again = source.fetch(4).unwrap().unwrap();
        assert_eq!(first.to_array(), again.to_array());
    }

    #[test]
    fn test_mean_shift_moves_one_dimension() {
        let mut source = MeanShiftSource::new(2_000, 2, 5.0)
            .unwrap()
            .shift_dimension(1)
            .unwrap()
            .seed(3);
        source.start().unwrap();
        let feats = source.fetch(2_000).unwrap().unwrap();
        let means = feats.to_array().mean_axis(ndarray::Axis(0)).unwrap();
        assert!(means[0].abs() < 0.2, "unshifted mean {}", means[0]);
        assert!((means[1] - 5.0).abs() < 0.2, "shifted mean {}", means[1]);
        assert!(MeanShiftSource::new(10, 2, 1.0).unwrap().shift_dimension(2).is_err());
    }
}

//! Dense feature containers with index-view subsets.
//!
//! A [`Features`] value is a cheap handle: the vectors live in shared,
//! immutable storage and every handle carries its own active index view.
//! Slicing a block out of a sample and shuffling a merged block only rewrite
//! that index view, never the underlying storage.

use std::sync::Arc;

use ndarray::{Array2, ArrayView2};

use crate::{Error, Result};

/// Row-major dense feature vectors behind an index view.
#[derive(Debug, Clone)]
pub struct Features {
    storage: Arc<[f64]>,
    dim: usize,
    /// Active view into `storage` rows.
    index: Vec<usize>,
    /// Views replaced by [`Features::add_subset`], restored by `remove_subset`.
    subset_stack: Vec<Vec<usize>>,
}

impl Features {
    /// Build features from one `Vec` per vector.
    ///
    /// # Example
    ///
    /// ```rust
    /// use streaming_mmd::Features;
    ///
    /// let feats = Features::from_rows(&[vec![0.0, 1.0], vec![2.0, 3.0]]).unwrap();
    /// assert_eq!(feats.num_vectors(), 2);
    /// assert_eq!(feats.vector(1), &[2.0, 3.0]);
    /// ```
    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self> {
        let dim = rows.first().ok_or(Error::EmptyInput)?.len();
        if dim == 0 {
            return Err(Error::EmptyInput);
        }
        let mut storage = Vec::with_capacity(rows.len() * dim);
        for row in rows {
            if row.len() != dim {
                return Err(Error::DimensionMismatch(dim, row.len()));
            }
            storage.extend_from_slice(row);
        }
        Ok(Self::from_storage(storage, dim))
    }

    /// Build features from a matrix whose rows are the vectors.
    pub fn from_array(array: ArrayView2<'_, f64>) -> Result<Self> {
        let (n, dim) = array.dim();
        if n == 0 || dim == 0 {
            return Err(Error::EmptyInput);
        }
        Ok(Self::from_storage(array.iter().copied().collect(), dim))
    }

    fn from_storage(storage: Vec<f64>, dim: usize) -> Self {
        let n = storage.len() / dim;
        Self {
            storage: storage.into(),
            dim,
            index: (0..n).collect(),
            subset_stack: Vec::new(),
        }
    }

    /// Number of vectors visible through the active view.
    pub fn num_vectors(&self) -> usize {
        self.index.len()
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// The `i`-th vector of the active view.
    ///
    /// # Panics
    ///
    /// Panics if `i >= self.num_vectors()`.
    pub fn vector(&self, i: usize) -> &[f64] {
        let row = self.index[i];
        &self.storage[row * self.dim..(row + 1) * self.dim]
    }

    /// A handle onto `len` consecutive vectors of the active view, starting
    /// at `start`. Shares storage with `self`.
    pub fn slice(&self, start: usize, len: usize) -> Result<Self> {
        let end = start + len;
        if end > self.num_vectors() {
            return Err(Error::IndexOutOfBounds {
                index: end.saturating_sub(1),
                len: self.num_vectors(),
            });
        }
        Ok(Self {
            storage: Arc::clone(&self.storage),
            dim: self.dim,
            index: self.index[start..end].to_vec(),
            subset_stack: Vec::new(),
        })
    }

    /// Concatenate the active views of `self` and `other` into fresh storage.
    ///
    /// The first `self.num_vectors()` vectors of the result come from `self`.
    pub fn create_merged_copy(&self, other: &Features) -> Result<Self> {
        if self.dim != other.dim {
            return Err(Error::DimensionMismatch(self.dim, other.dim));
        }
        let total = self.num_vectors() + other.num_vectors();
        let mut storage = Vec::with_capacity(total * self.dim);
        for i in 0..self.num_vectors() {
            storage.extend_from_slice(self.vector(i));
        }
        for i in 0..other.num_vectors() {
            storage.extend_from_slice(other.vector(i));
        }
        Ok(Self::from_storage(storage, self.dim))
    }

    /// Restrict the active view to `indices`, given relative to the current
    /// view. Subsets nest; undo with [`Features::remove_subset`].
    pub fn add_subset(&mut self, indices: &[usize]) -> Result<()> {
        let len = self.num_vectors();
        let mut next = Vec::with_capacity(indices.len());
        for &i in indices {
            if i >= len {
                return Err(Error::IndexOutOfBounds { index: i, len });
            }
            next.push(self.index[i]);
        }
        let previous = std::mem::replace(&mut self.index, next);
        self.subset_stack.push(previous);
        Ok(())
    }

    /// Drop the most recently added subset. No-op without one.
    pub fn remove_subset(&mut self) {
        if let Some(previous) = self.subset_stack.pop() {
            self.index = previous;
        }
    }

    pub fn has_subset(&self) -> bool {
        !self.subset_stack.is_empty()
    }

    /// Copy the active view out as an `n × dim` matrix.
    pub fn to_array(&self) -> Array2<f64> {
        Array2::from_shape_fn((self.num_vectors(), self.dim), |(i, j)| self.vector(i)[j])
    }
}

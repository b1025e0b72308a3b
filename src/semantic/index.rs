//! Append-only similarity index over unit vectors.
//!
//! Search is an exact inner-product scan, so recall against the reference
//! semantics is 1.0. The scan is split across the rayon pool once the index
//! is large enough for that to pay off.

use std::cmp::Ordering;

use rayon::prelude::*;

use crate::semantic::normalize::UnitVector;

/// Below this many entries the scan stays on the calling thread.
const PARALLEL_SCAN_THRESHOLD: usize = 4096;

/// Position of a vector inside the index. Assigned sequentially from 0 and
/// never reused.
pub type Ordinal = usize;

/// One search hit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchHit {
    pub ordinal: Ordinal,
    /// Inner product with the query, in [-1, 1].
    pub score: f32,
}

/// Errors that can occur during index operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum IndexError {
    #[error("similarity index is empty")]
    Empty,

    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("top-k must be greater than zero")]
    ZeroK,
}

/// Flat inner-product index. Vectors are stored contiguously in ordinal order.
#[derive(Debug, Clone)]
pub struct SimilarityIndex {
    dimensions: usize,
    /// Row-major, `len * dimensions` values.
    data: Vec<f32>,
}

impl SimilarityIndex {
    /// Create a new empty index with specified dimensions.
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            data: Vec::new(),
        }
    }

    /// Create an index with pre-allocated capacity.
    pub fn with_capacity(dimensions: usize, capacity: usize) -> Self {
        Self {
            dimensions,
            data: Vec::with_capacity(dimensions * capacity),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn len(&self) -> usize {
        if self.dimensions == 0 {
            0
        } else {
            self.data.len() / self.dimensions
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Stored vector at `ordinal`.
    pub fn vector(&self, ordinal: Ordinal) -> Option<&[f32]> {
        let start = ordinal.checked_mul(self.dimensions)?;
        self.data.get(start..start + self.dimensions)
    }

    /// Iterate stored vectors in ordinal order.
    pub fn vectors(&self) -> impl Iterator<Item = &[f32]> {
        self.data.chunks_exact(self.dimensions.max(1))
    }

    /// Append vectors in input order.
    ///
    /// Returns the assigned ordinals, contiguous from the current size. The
    /// batch is rejected as a whole if any vector has the wrong dimension.
    pub fn add(&mut self, vectors: Vec<UnitVector>) -> Result<Vec<Ordinal>, IndexError> {
        if let Some(bad) = vectors.iter().find(|v| v.dimensions() != self.dimensions) {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: bad.dimensions(),
            });
        }

        let start = self.len();
        self.data.reserve(vectors.len() * self.dimensions);
        for v in &vectors {
            self.data.extend_from_slice(v.as_slice());
        }

        Ok((start..start + vectors.len()).collect())
    }

    /// Top-`k` entries by inner product with `query`.
    ///
    /// Sorted by descending score, ties broken by ascending ordinal. Returns
    /// every entry when the index holds fewer than `k`.
    pub fn search(&self, query: &UnitVector, k: usize) -> Result<Vec<SearchHit>, IndexError> {
        if k == 0 {
            return Err(IndexError::ZeroK);
        }

        if self.is_empty() {
            return Err(IndexError::Empty);
        }

        if query.dimensions() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: query.dimensions(),
            });
        }

        let query = query.as_slice();
        let score = |(ordinal, row): (usize, &[f32])| SearchHit {
            ordinal,
            score: crate::semantic::normalize::dot(query, row),
        };

        let mut hits: Vec<SearchHit> = if self.len() >= PARALLEL_SCAN_THRESHOLD {
            self.data
                .par_chunks_exact(self.dimensions)
                .enumerate()
                .map(score)
                .collect()
        } else {
            self.data
                .chunks_exact(self.dimensions)
                .enumerate()
                .map(score)
                .collect()
        };

        if hits.len() > k {
            hits.select_nth_unstable_by(k - 1, rank_order);
            hits.truncate(k);
        }
        hits.sort_unstable_by(rank_order);

        Ok(hits)
    }
}

/// Descending score, then ascending ordinal.
fn rank_order(a: &SearchHit, b: &SearchHit) -> Ordering {
    score_order(a.score, b.score).then_with(|| a.ordinal.cmp(&b.ordinal))
}

/// Orders higher scores first. `-0.0` and `0.0` compare equal so the
/// caller's tie-break decides between them.
pub(crate) fn score_order(a: f32, b: f32) -> Ordering {
    (b + 0.0).total_cmp(&(a + 0.0))
}

//! Unit-norm vectors.
//!
//! Every vector stored in or compared against the similarity index is a
//! [`UnitVector`]. The only ways to obtain one are [`normalize`] and
//! [`mean_direction`], so inner product on two of them is cosine similarity.

use serde::Serialize;

/// Allowed deviation of a stored vector's norm from 1.0.
pub const NORM_EPSILON: f32 = 1e-3;

/// The input had zero or non-finite norm and cannot be scaled to unit length.
///
/// Callers treat this as "no usable embedding for this input"; retrying with
/// the same input gives the same result.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("degenerate vector: norm {norm} cannot be normalized")]
pub struct DegenerateVectorError {
    pub norm: f32,
}

/// A vector with Euclidean norm 1 (within [`NORM_EPSILON`]).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct UnitVector(Vec<f32>);

impl UnitVector {
    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn dimensions(&self) -> usize {
        self.0.len()
    }

    pub fn into_inner(self) -> Vec<f32> {
        self.0
    }

    /// Inner product. Equals cosine similarity because both sides are unit-norm.
    pub fn dot(&self, other: &UnitVector) -> f32 {
        dot(&self.0, &other.0)
    }

    /// Accept a vector that is supposed to be unit-norm already, such as one
    /// read back from a persisted index. Does not rescale.
    pub(crate) fn from_stored(values: Vec<f32>) -> Option<Self> {
        let norm = l2_norm(&values);
        if norm.is_finite() && (norm - 1.0).abs() <= NORM_EPSILON {
            Some(Self(values))
        } else {
            None
        }
    }
}

/// Scale `v` to unit L2 norm.
pub fn normalize(v: &[f32]) -> Result<UnitVector, DegenerateVectorError> {
    let norm = l2_norm(v);
    if !norm.is_finite() || norm < f32::EPSILON {
        return Err(DegenerateVectorError { norm });
    }

    Ok(UnitVector(v.iter().map(|x| x / norm).collect()))
}

/// Normalized mean of already-normalized vectors.
///
/// Each input contributes equally regardless of its original magnitude, and
/// the result is itself unit-norm. Fails when `vectors` is empty, when the
/// dimensions disagree, or when the inputs cancel out.
pub fn mean_direction(vectors: &[UnitVector]) -> Result<UnitVector, DegenerateVectorError> {
    let Some(first) = vectors.first() else {
        return Err(DegenerateVectorError { norm: 0.0 });
    };

    let dimensions = first.dimensions();
    if vectors.iter().any(|v| v.dimensions() != dimensions) {
        return Err(DegenerateVectorError { norm: f32::NAN });
    }

    let mut sum = vec![0.0f32; dimensions];
    for v in vectors {
        for (acc, x) in sum.iter_mut().zip(v.as_slice()) {
            *acc += x;
        }
    }

    let count = vectors.len() as f32;
    for acc in sum.iter_mut() {
        *acc /= count;
    }

    normalize(&sum)
}

pub(crate) fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

pub(crate) fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

//! Joint cross-image distance under a (q, s) exponent pair.
//!
//! The per-image distance is the l_r norm of the flattened deviation, where r
//! is the primal order of `s`. Per-image distances are aggregated with the
//! normalized l_p norm (mean of p-th powers, then the 1/p-th root), where p is
//! the primal order of `q`; p = ∞ aggregates with the maximum.

use ndarray::{Array1, Array4, ArrayView4};
use wpgd_core::{Exponent, NormOrder, Result};
use wpgd_tensor::{ensure_same_shape, per_image_norms};

/// Norm pair selected by a (q, s) label pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormSpace {
    q: Exponent,
    s: Exponent,
    parallel: bool,
}

impl NormSpace {
    pub fn new(q: Exponent, s: Exponent) -> Self {
        Self {
            q,
            s,
            parallel: false,
        }
    }

    /// Enable rayon for per-image reductions on large batches.
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    #[inline]
    pub fn q(&self) -> Exponent {
        self.q
    }

    #[inline]
    pub fn s(&self) -> Exponent {
        self.s
    }

    /// Order of the cross-image aggregation (p).
    #[inline]
    pub fn aggregate_order(&self) -> NormOrder {
        self.q.primal_order()
    }

    /// Order of the per-image norm (r).
    #[inline]
    pub fn image_order(&self) -> NormOrder {
        self.s.primal_order()
    }

    /// Per-image l_r norms of a deviation tensor.
    pub fn image_norms(&self, deviation: ArrayView4<'_, f32>) -> Array1<f32> {
        per_image_norms(deviation, self.image_order(), self.parallel)
    }

    /// Joint norm of a deviation tensor, i.e. its distance from zero.
    pub fn joint_norm(&self, deviation: ArrayView4<'_, f32>) -> f32 {
        let norms = self.image_norms(deviation);
        self.aggregate_order().mean_norm(norms.iter().copied())
    }

    /// Joint distance between two batches of the same shape.
    pub fn joint_distance(&self, a: ArrayView4<'_, f32>, b: ArrayView4<'_, f32>) -> Result<f32> {
        ensure_same_shape(&a, &b)?;
        let deviation: Array4<f32> = &a - &b;
        Ok(self.joint_norm(deviation.view()))
    }
}

/// Joint distance between `a` and `b` under the (q, s) pair.
pub fn joint_distance(
    a: ArrayView4<'_, f32>,
    b: ArrayView4<'_, f32>,
    q: Exponent,
    s: Exponent,
) -> Result<f32> {
    NormSpace::new(q, s).joint_distance(a, b)
}

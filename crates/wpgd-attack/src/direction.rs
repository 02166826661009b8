//! Steepest-ascent direction under the dual norm pair.
//!
//! Given the per-sample gradient `g` and its per-image dual norm
//! `‖g‖_s`, the raw direction is
//!
//! ```text
//! sign(g) · |g|^(s-1) · (‖g‖_s + ε)^(q-s)
//! ```
//!
//! At s = 1 this is the pixel-wise sign, at s = 2 the raw gradient, each
//! rescaled per image. For q = 1 the raw direction is returned as is; for
//! q = 2 the whole tensor is normalized to unit joint norm so that one step
//! spends a batch-level budget.

use ndarray::Array4;
use tracing::trace;
use wpgd_core::{Exponent, Result, EPS};
use wpgd_tensor::{per_image_norms, scale_per_image};

use crate::norm_space::NormSpace;

#[inline]
fn sign(v: f32) -> f32 {
    if v > 0.0 {
        1.0
    } else if v < 0.0 {
        -1.0
    } else {
        0.0
    }
}

/// Computes unit ascent directions for a fixed (q, s) pair.
#[derive(Debug, Clone, Copy)]
pub struct DirectionOracle {
    space: NormSpace,
    parallel: bool,
}

impl DirectionOracle {
    pub fn new(q: Exponent, s: Exponent) -> Self {
        Self {
            space: NormSpace::new(q, s),
            parallel: false,
        }
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self.space = self.space.with_parallel(parallel);
        self
    }

    /// Ascent direction for a batch of input gradients.
    pub fn direction(&self, grad: &Array4<f32>) -> Result<Array4<f32>> {
        let (q, s) = (self.space.q(), self.space.s());
        let grad_norms = per_image_norms(grad.view(), s.dual_order(), self.parallel);
        if grad_norms.iter().any(|&n| n == 0.0) {
            trace!("Zero gradient norm on at least one image, relying on epsilon guard");
        }

        let mut direction = match s {
            Exponent::One => grad.mapv(sign),
            Exponent::Two => grad.clone(),
        };
        let exponent = q.value() - s.value();
        let factors = grad_norms.mapv(|n| (n + EPS).powi(exponent));
        scale_per_image(&mut direction, &factors)?;

        match q {
            Exponent::One => Ok(direction),
            Exponent::Two => {
                let joint = self.space.joint_norm(direction.view());
                direction /= joint + EPS;
                Ok(direction)
            }
        }
    }
}

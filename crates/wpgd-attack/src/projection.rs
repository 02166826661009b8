//! Projection onto the (W_p, l_r) ball around a reference batch.
//!
//! For q = 1 every image is constrained on its own. For q = 2 the whole batch
//! shares one budget: the joint distance is contracted by a single ratio
//! `ρ = min(1, δ / (dist + ε))`.
//!
//! The caller clamps the result to the valid pixel range.

use ndarray::{Array4, ArrayView4};
use tracing::trace;
use wpgd_core::{Exponent, NormOrder, Result, ThreatModel, EPS};
use wpgd_tensor::{clamp_per_image, ensure_same_shape, per_image_norms, scale_per_image};

use crate::norm_space::NormSpace;

/// Projects candidate batches onto the feasible ball.
#[derive(Debug, Clone, Copy)]
pub struct Projector {
    threat: ThreatModel,
    space: NormSpace,
    parallel: bool,
}

impl Projector {
    pub fn new(threat: ThreatModel) -> Self {
        Self {
            threat,
            space: NormSpace::new(threat.q(), threat.s()),
            parallel: false,
        }
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self.space = self.space.with_parallel(parallel);
        self
    }

    pub fn threat(&self) -> &ThreatModel {
        &self.threat
    }

    /// Project `x_cur` onto the δ-ball around `x_ref`.
    pub fn project(
        &self,
        x_cur: ArrayView4<'_, f32>,
        x_ref: ArrayView4<'_, f32>,
    ) -> Result<Array4<f32>> {
        ensure_same_shape(&x_cur, &x_ref)?;
        let delta = self.threat.delta();
        let mut deviation: Array4<f32> = &x_cur - &x_ref;

        match (self.threat.q(), self.threat.s()) {
            (Exponent::One, Exponent::One) => {
                deviation.mapv_inplace(|v| v.clamp(-delta, delta));
            }
            (Exponent::One, Exponent::Two) => {
                let norms = self.space.image_norms(deviation.view());
                let factors = norms.mapv(|n| if n > delta { delta / (n + EPS) } else { 1.0 });
                scale_per_image(&mut deviation, &factors)?;
            }
            (Exponent::Two, s) => {
                let dist = self.space.joint_norm(deviation.view());
                let ratio = (delta / (dist + EPS)).min(1.0);
                trace!("Joint distance {dist:.6e}, contraction ratio {ratio:.6}");
                match s {
                    Exponent::One => {
                        let img_dist = per_image_norms(
                            deviation.view(),
                            NormOrder::LInf,
                            self.parallel,
                        );
                        clamp_per_image(&mut deviation, &img_dist.mapv(|d| ratio * d))?;
                    }
                    Exponent::Two => deviation *= ratio,
                }
            }
        }

        Ok(&x_ref + &deviation)
    }
}

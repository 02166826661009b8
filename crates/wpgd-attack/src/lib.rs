//! Adversarial robustness under the (W_p, l_r) threat model.
//!
//! A batch of images may be perturbed as a whole: each image's deviation is
//! measured with the pixel-level norm l_s, and the per-image distances are
//! aggregated across the batch with the normalized norm l_q. With q = 1 the
//! budget δ bounds every image individually; with q = 2 it is shared.
//!
//! The crate provides
//!
//! - [`NormSpace`] and [`Projector`]: the joint distance and the projection
//!   onto its δ-ball.
//! - [`DirectionOracle`]: steepest-ascent directions under the dual norms.
//! - [`GradientProvider`] and [`Evaluator`]: mini-batched input gradients and
//!   loss/accuracy through any [`Network`].
//! - [`upsilon`]: an attack-free sensitivity score.
//! - [`Attacker`]: the W-FGSM / W-PGD loop.
//!
//! # Example
//!
//! ```no_run
//! use ndarray::{Array1, Array4};
//! use wpgd_attack::{AttackConfig, Attacker, LossKind, Mlp};
//! use wpgd_core::{Exponent, ThreatModel};
//! use wpgd_tensor::Batch;
//!
//! # fn main() -> wpgd_core::Result<()> {
//! let mut net = Mlp::seeded([3, 32, 32], &[256], 10, 0)?;
//! let batch = Batch::new(Array4::zeros((8, 3, 32, 32)), Array1::zeros(8))?;
//! let threat = ThreatModel::from_pixel_budget(Exponent::Two, Exponent::One, 8)?;
//!
//! let attacker = Attacker::new(AttackConfig::pgd(threat, LossKind::Dlr), batch)?;
//! let outcome = attacker.attack(&mut net, false)?;
//! println!("acc_min = {}", outcome.acc_min);
//! # Ok(())
//! # }
//! ```

pub mod attacker;
pub mod direction;
pub mod evaluate;
pub mod gradient;
pub mod loss;
pub mod network;
pub mod norm_space;
pub mod projection;
pub mod report;
pub mod types;
pub mod upsilon;

pub use attacker::{
    AttackConfig, AttackOutcome, Attacker, CancelToken, IterationRecord, RandomStart,
    PGD_ITERATIONS, PGD_RATIO,
};
pub use direction::DirectionOracle;
pub use evaluate::{evaluate, Evaluator};
pub use gradient::GradientProvider;
pub use loss::{CrossEntropy, Dlr, LossFunction, LossKind, ReDlr, DLR_EPS};
pub use network::{Dense, EvalGuard, Mlp, Network, Pullback, Tape};
pub use norm_space::{joint_distance, NormSpace};
pub use projection::Projector;
pub use report::{AttackReport, CleanReport};
pub use types::{AttackKind, ConditionalLoss, Evaluation, ExecConfig, DEFAULT_BATCH_SIZE};
pub use upsilon::{gradient_norms, upsilon};

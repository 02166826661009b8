//! Serializable summaries of attack and clean-evaluation runs.

use serde::{Deserialize, Serialize};
use tracing::info;
use wpgd_core::{Exponent, Result};
use wpgd_tensor::Batch;

use crate::attacker::{AttackConfig, AttackOutcome};
use crate::evaluate::Evaluator;
use crate::loss::LossFunction;
use crate::network::Network;
use crate::types::{AttackKind, ExecConfig};
use crate::upsilon::upsilon;

/// One row of an attack experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttackReport {
    pub model: String,
    /// e.g. `w_inf-l_2-CE`
    pub signature: String,
    pub q: Exponent,
    pub s: Exponent,
    pub delta: f32,
    pub attack: AttackKind,
    pub loss: String,
    pub iterations: usize,
    pub completed_iterations: usize,
    pub cancelled: bool,
    pub acc_min: f32,
    pub loss_max: f32,
}

impl AttackReport {
    pub fn from_outcome(
        model: impl Into<String>,
        config: &AttackConfig,
        loss_name: &str,
        outcome: &AttackOutcome,
    ) -> Self {
        let threat = &config.threat;
        Self {
            model: model.into(),
            signature: threat.signature(loss_name),
            q: threat.q(),
            s: threat.s(),
            delta: threat.delta(),
            attack: config.kind(),
            loss: loss_name.to_string(),
            iterations: config.iterations,
            completed_iterations: outcome.completed_iterations,
            cancelled: outcome.cancelled,
            acc_min: outcome.acc_min,
            loss_max: outcome.loss_max,
        }
    }
}

/// Clean metrics plus the Upsilon sensitivity score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanReport {
    pub model: String,
    pub loss_name: String,
    pub q: Exponent,
    pub s: Exponent,
    pub loss: f32,
    pub acc: f32,
    /// NaN when every sample is classified correctly.
    pub loss_cond: f32,
    pub upsilon: f32,
}

impl CleanReport {
    /// Evaluate `network` on `batch` and measure Upsilon for `(q, s)`.
    pub fn compute<N, L>(
        model: impl Into<String>,
        network: &mut N,
        batch: &Batch,
        loss: &L,
        q: Exponent,
        s: Exponent,
        exec: ExecConfig,
    ) -> Result<Self>
    where
        N: Network + ?Sized,
        L: LossFunction + ?Sized,
    {
        let model = model.into();
        let eval = Evaluator::new(exec).evaluate_batch(network, batch, loss, true)?;
        let loss_cond = eval.loss_cond.map_or(f32::NAN, |c| c.value());
        let upsilon = upsilon(network, batch, loss, q, s, exec)?;
        info!(
            "{}: clean acc {} loss {} cond {} upsilon {:.6e}",
            model, eval.acc, eval.loss, loss_cond, upsilon
        );
        Ok(Self {
            model,
            loss_name: loss.name().to_string(),
            q,
            s,
            loss: eval.loss,
            acc: eval.acc,
            loss_cond,
            upsilon,
        })
    }
}

//! Wasserstein PGD under the (W_p, l_r) threat model.
//!
//! Each iteration takes one dual-norm ascent step, projects back onto the
//! δ-ball around the reference batch, clamps to [0, 1], and scores the new
//! point. The run keeps the lowest accuracy seen along the trajectory (and
//! the images that achieved it) and, independently, the highest loss.
//!
//! ```text
//! x_{t+1} = clamp(proj(x_t + step_size · dir(∇loss(x_t))), 0, 1)
//! ```
//!
//! FGSM and PGD are the same loop with different parameters; see
//! [`AttackConfig::fgsm`] and [`AttackConfig::pgd`].

use ndarray::Array4;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use wpgd_core::{Result, ThreatModel, WpgdError};
use wpgd_tensor::{clamp_unit, Batch};

use crate::direction::DirectionOracle;
use crate::evaluate::Evaluator;
use crate::gradient::GradientProvider;
use crate::loss::{LossFunction, LossKind};
use crate::network::Network;
use crate::projection::Projector;
use crate::types::{AttackKind, Evaluation, ExecConfig};

/// Iterations of the PGD preset.
pub const PGD_ITERATIONS: usize = 50;
/// Step ratio of the PGD preset.
pub const PGD_RATIO: f32 = 1.875;

/// Seeded uniform initialization inside the ball.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RandomStart {
    pub seed: u64,
}

/// Configuration for a W-PGD run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttackConfig {
    pub threat: ThreatModel,
    /// Number of ascent steps.
    pub iterations: usize,
    /// Step size is `ratio · δ / iterations`.
    pub ratio: f32,
    #[serde(default)]
    pub loss: LossKind,
    #[serde(default)]
    pub exec: ExecConfig,
    /// Start from a random point in the ball instead of the reference batch.
    #[serde(default)]
    pub random_start: Option<RandomStart>,
}

impl AttackConfig {
    /// Single full-budget step.
    pub fn fgsm(threat: ThreatModel, loss: LossKind) -> Self {
        Self {
            threat,
            iterations: 1,
            ratio: 1.0,
            loss,
            exec: ExecConfig::default(),
            random_start: None,
        }
    }

    /// 50 steps of `1.875 · δ / 50`.
    pub fn pgd(threat: ThreatModel, loss: LossKind) -> Self {
        Self {
            threat,
            iterations: PGD_ITERATIONS,
            ratio: PGD_RATIO,
            loss,
            exec: ExecConfig::default(),
            random_start: None,
        }
    }

    pub fn with_exec(mut self, exec: ExecConfig) -> Self {
        self.exec = exec;
        self
    }

    pub fn with_random_start(mut self, seed: u64) -> Self {
        self.random_start = Some(RandomStart { seed });
        self
    }

    pub fn step_size(&self) -> f32 {
        self.ratio * self.threat.delta() / self.iterations as f32
    }

    /// FGSM for the single unit-ratio step, PGD otherwise.
    pub fn kind(&self) -> AttackKind {
        if self.iterations == 1 && self.ratio == 1.0 {
            AttackKind::Fgsm
        } else {
            AttackKind::Pgd
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.iterations == 0 {
            return Err(WpgdError::InvalidConfig(
                "iterations must be at least 1".into(),
            ));
        }
        if !self.ratio.is_finite() || self.ratio < 0.0 {
            return Err(WpgdError::InvalidConfig(format!(
                "ratio must be finite and non-negative, got {}",
                self.ratio
            )));
        }
        if self.exec.batch_size == 0 {
            return Err(WpgdError::InvalidConfig(
                "batch_size must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Cooperative cancellation flag, checked between iterations.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Scores of one iteration and the running extrema after it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration: usize,
    pub acc: f32,
    pub loss: f32,
    pub acc_min: f32,
    pub loss_max: f32,
}

/// Result of an attack run.
#[derive(Debug, Clone)]
pub struct AttackOutcome {
    /// Images that achieved `acc_min`; the starting point if no step lowered
    /// the accuracy.
    pub adversarial: Option<Array4<f32>>,
    pub acc_min: f32,
    pub loss_max: f32,
    pub history: Vec<IterationRecord>,
    pub completed_iterations: usize,
    pub cancelled: bool,
}

/// Running state of one run. Each step consumes it and yields the next.
struct AttackState {
    x_cur: Array4<f32>,
    x_adv: Array4<f32>,
    acc_min: f32,
    loss_max: f32,
    history: Vec<IterationRecord>,
}

impl AttackState {
    fn start(x_init: Array4<f32>) -> Self {
        Self {
            x_adv: x_init.clone(),
            x_cur: x_init,
            acc_min: 1.0,
            loss_max: -1.0,
            history: Vec::new(),
        }
    }

    fn absorb(mut self, x_next: Array4<f32>, eval: &Evaluation, iteration: usize) -> Self {
        if eval.acc < self.acc_min {
            self.x_adv.assign(&x_next);
            self.acc_min = eval.acc;
        }
        if eval.loss > self.loss_max {
            self.loss_max = eval.loss;
        }
        self.history.push(IterationRecord {
            iteration,
            acc: eval.acc,
            loss: eval.loss,
            acc_min: self.acc_min,
            loss_max: self.loss_max,
        });
        self.x_cur = x_next;
        self
    }

    fn finish(self, keep_adversarial: bool, cancelled: bool) -> AttackOutcome {
        AttackOutcome {
            adversarial: keep_adversarial.then_some(self.x_adv),
            acc_min: self.acc_min,
            loss_max: self.loss_max,
            completed_iterations: self.history.len(),
            history: self.history,
            cancelled,
        }
    }
}

/// W-FGSM / W-PGD attacker bound to a reference batch.
pub struct Attacker {
    config: AttackConfig,
    reference: Batch,
    loss: Box<dyn LossFunction>,
    projector: Projector,
    oracle: DirectionOracle,
    gradients: GradientProvider,
    evaluator: Evaluator,
    cancel: Option<CancelToken>,
}

impl Attacker {
    pub fn new(config: AttackConfig, reference: Batch) -> Result<Self> {
        config.validate()?;
        let exec = config.exec;
        let threat = config.threat;
        Ok(Self {
            loss: Box::new(config.loss),
            projector: Projector::new(threat).with_parallel(exec.parallel),
            oracle: DirectionOracle::new(threat.q(), threat.s()).with_parallel(exec.parallel),
            gradients: GradientProvider::new(exec),
            evaluator: Evaluator::new(exec),
            config,
            reference,
            cancel: None,
        })
    }

    /// W-FGSM attacker.
    pub fn fgsm(threat: ThreatModel, loss: LossKind, reference: Batch) -> Result<Self> {
        Self::new(AttackConfig::fgsm(threat, loss), reference)
    }

    /// W-PGD attacker.
    pub fn pgd(threat: ThreatModel, loss: LossKind, reference: Batch) -> Result<Self> {
        Self::new(AttackConfig::pgd(threat, loss), reference)
    }

    /// Replace the configured loss with a custom one.
    pub fn with_loss(mut self, loss: Box<dyn LossFunction>) -> Self {
        self.loss = loss;
        self
    }

    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn config(&self) -> &AttackConfig {
        &self.config
    }

    pub fn reference(&self) -> &Batch {
        &self.reference
    }

    pub fn loss_name(&self) -> &str {
        self.loss.name()
    }

    pub fn step_size(&self) -> f32 {
        self.config.step_size()
    }

    /// Run the attack.
    ///
    /// With `verbose` the per-iteration accuracy is logged at `info` and the
    /// adversarial images are returned; otherwise only the summary metrics
    /// are returned and progress is logged at `debug`.
    pub fn attack<N: Network + ?Sized>(
        &self,
        network: &mut N,
        verbose: bool,
    ) -> Result<AttackOutcome> {
        self.run(network, verbose, verbose)
    }

    /// Run the attack and always keep the adversarial images.
    pub fn attack_full<N: Network + ?Sized>(
        &self,
        network: &mut N,
        verbose: bool,
    ) -> Result<AttackOutcome> {
        self.run(network, verbose, true)
    }

    fn run<N: Network + ?Sized>(
        &self,
        network: &mut N,
        verbose: bool,
        keep_adversarial: bool,
    ) -> Result<AttackOutcome> {
        let threat = &self.config.threat;
        debug!(
            "{} attack {}: delta {}, {} iterations, step size {:.6e}, {} images",
            self.config.kind(),
            threat.signature(self.loss.name()),
            threat.delta(),
            self.config.iterations,
            self.step_size(),
            self.reference.len()
        );

        let x_init = self.initial_point()?;
        let mut state = AttackState::start(x_init);
        let mut cancelled = false;

        for iteration in 0..self.config.iterations {
            if self.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
                warn!(
                    "Attack cancelled after {} of {} iterations",
                    iteration, self.config.iterations
                );
                cancelled = true;
                break;
            }
            state = self.step(network, state, iteration)?;
            if let Some(record) = state.history.last() {
                if verbose {
                    info!("step_{}: acc {}", iteration, record.acc);
                } else {
                    debug!("step_{}: acc {} loss {}", iteration, record.acc, record.loss);
                }
            }
        }

        let outcome = state.finish(keep_adversarial, cancelled);
        if verbose {
            info!(
                "Attack done: acc_min {} loss_max {}",
                outcome.acc_min, outcome.loss_max
            );
        } else {
            debug!(
                "Attack done: acc_min {} loss_max {}",
                outcome.acc_min, outcome.loss_max
            );
        }
        Ok(outcome)
    }

    fn step<N: Network + ?Sized>(
        &self,
        network: &mut N,
        state: AttackState,
        iteration: usize,
    ) -> Result<AttackState> {
        let labels = self.reference.labels().view();
        let grad = self
            .gradients
            .gradient(network, state.x_cur.view(), labels, self.loss.as_ref())?;
        let direction = self.oracle.direction(&grad)?;

        let mut x_next = state.x_cur.clone();
        x_next.scaled_add(self.step_size(), &direction);
        let mut x_next = self
            .projector
            .project(x_next.view(), self.reference.images().view())?;
        clamp_unit(&mut x_next);

        let eval = self.evaluator.evaluate(
            network,
            x_next.view(),
            labels,
            self.loss.as_ref(),
            false,
        )?;
        Ok(state.absorb(x_next, &eval, iteration))
    }

    /// Reference images, or a seeded uniform point inside the ball.
    fn initial_point(&self) -> Result<Array4<f32>> {
        let x_ref = self.reference.images();
        let Some(RandomStart { seed }) = self.config.random_start else {
            return Ok(x_ref.clone());
        };

        let delta = self.config.threat.delta();
        if delta == 0.0 {
            return Ok(x_ref.clone());
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let radius: f32 = rng.random_range(0.0..=delta);
        let noise = Array4::from_shape_simple_fn(x_ref.dim(), || {
            if radius > 0.0 {
                rng.random_range(-radius..=radius)
            } else {
                0.0
            }
        });
        let mut x = self
            .projector
            .project((x_ref + &noise).view(), x_ref.view())?;
        clamp_unit(&mut x);
        Ok(x)
    }
}

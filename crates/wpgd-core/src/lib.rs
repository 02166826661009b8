//! Core types for adversarial robustness evaluation under the (W_p, l_r)
//! threat model.
//!
//! A perturbation of a batch of images is bounded twice: each image's
//! deviation is measured with an l_r norm, and the per-image distances are
//! aggregated across the batch with an l_p norm. The pair approximates a
//! p-Wasserstein ball of radius δ around the reference batch.
//!
//! Both exponents are selected through their conjugate labels `q` (for `p`)
//! and `s` (for `r`), restricted to the closed duality table {1, 2}.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Additive guard applied to every norm before it is used as a divisor or
/// raised to a negative power.
pub const EPS: f32 = 1e-8;

/// Errors raised by the attack engine.
#[derive(Error, Debug)]
pub enum WpgdError {
    /// Exponent label outside the duality table.
    #[error("Unsupported exponent {0}: only 1 and 2 are supported")]
    UnsupportedExponent(u32),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Empty batch")]
    EmptyBatch,

    /// Failure inside a network forward or backward pass.
    #[error("Network failure: {0}")]
    Network(String),

    #[error("Loss function failure: {0}")]
    Loss(String),
}

impl WpgdError {
    /// Create a ShapeMismatch error from any two shape slices.
    pub fn shape_mismatch(expected: &[usize], got: &[usize]) -> Self {
        debug_assert!(
            expected != got,
            "ShapeMismatch raised for identical shapes {expected:?}"
        );
        WpgdError::ShapeMismatch {
            expected: expected.to_vec(),
            got: got.to_vec(),
        }
    }
}

pub type Result<T> = std::result::Result<T, WpgdError>;

/// Concrete order of a vector norm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NormOrder {
    L1,
    L2,
    LInf,
}

impl NormOrder {
    /// The exponent as a float (`f32::INFINITY` for the sup norm).
    #[inline]
    pub fn as_f32(self) -> f32 {
        match self {
            NormOrder::L1 => 1.0,
            NormOrder::L2 => 2.0,
            NormOrder::LInf => f32::INFINITY,
        }
    }

    /// Norm of a sequence of values: `(Σ|x|^p)^(1/p)`, or `max|x|` for l∞.
    pub fn norm<I>(self, values: I) -> f32
    where
        I: IntoIterator<Item = f32>,
    {
        let values = values.into_iter();
        match self {
            NormOrder::L1 => values.map(f32::abs).sum(),
            NormOrder::L2 => values.map(|v| v * v).sum::<f32>().sqrt(),
            NormOrder::LInf => values.map(f32::abs).fold(0.0, f32::max),
        }
    }

    /// Normalized aggregate: `(mean |x|^p)^(1/p)`, or `max|x|` for l∞.
    ///
    /// This is the cross-image aggregation used by the joint distance. An
    /// empty sequence aggregates to zero.
    pub fn mean_norm<I>(self, values: I) -> f32
    where
        I: IntoIterator<Item = f32>,
    {
        let mut count = 0usize;
        let mut acc = 0.0f32;
        for v in values {
            count += 1;
            acc = match self {
                NormOrder::L1 => acc + v.abs(),
                NormOrder::L2 => acc + v * v,
                NormOrder::LInf => acc.max(v.abs()),
            };
        }
        if count == 0 {
            return 0.0;
        }
        match self {
            NormOrder::L1 => acc / count as f32,
            NormOrder::L2 => (acc / count as f32).sqrt(),
            NormOrder::LInf => acc,
        }
    }
}

impl fmt::Display for NormOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NormOrder::L1 => write!(f, "1"),
            NormOrder::L2 => write!(f, "2"),
            NormOrder::LInf => write!(f, "inf"),
        }
    }
}

/// Exponent label from the duality table.
///
/// A label names the conjugate of the norm it constrains: label 1 stands for
/// the sup norm (whose dual is l1), label 2 for l2 (self-dual).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum Exponent {
    One,
    Two,
}

impl Exponent {
    /// Order of the constrained (primal) norm: 1 → l∞, 2 → l2.
    #[inline]
    pub fn primal_order(self) -> NormOrder {
        match self {
            Exponent::One => NormOrder::LInf,
            Exponent::Two => NormOrder::L2,
        }
    }

    /// Order of the dual norm, used to measure gradients: 1 → l1, 2 → l2.
    #[inline]
    pub fn dual_order(self) -> NormOrder {
        match self {
            Exponent::One => NormOrder::L1,
            Exponent::Two => NormOrder::L2,
        }
    }

    #[inline]
    pub fn value(self) -> i32 {
        match self {
            Exponent::One => 1,
            Exponent::Two => 2,
        }
    }

    /// Display label of the primal norm ("inf" or "2").
    pub fn norm_label(self) -> &'static str {
        match self {
            Exponent::One => "inf",
            Exponent::Two => "2",
        }
    }
}

impl TryFrom<u32> for Exponent {
    type Error = WpgdError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            1 => Ok(Exponent::One),
            2 => Ok(Exponent::Two),
            other => Err(WpgdError::UnsupportedExponent(other)),
        }
    }
}

impl From<Exponent> for u32 {
    fn from(e: Exponent) -> u32 {
        e.value() as u32
    }
}

impl fmt::Display for Exponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value())
    }
}

/// The (q, s, δ) constraint family.
///
/// δ is measured in normalized pixel units (images live in [0, 1]).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawThreatModel")]
pub struct ThreatModel {
    q: Exponent,
    s: Exponent,
    delta: f32,
}

#[derive(Deserialize)]
struct RawThreatModel {
    q: Exponent,
    s: Exponent,
    delta: f32,
}

impl TryFrom<RawThreatModel> for ThreatModel {
    type Error = WpgdError;

    fn try_from(raw: RawThreatModel) -> Result<Self> {
        ThreatModel::new(raw.q, raw.s, raw.delta)
    }
}

impl ThreatModel {
    /// Create a threat model, rejecting negative or non-finite radii.
    pub fn new(q: Exponent, s: Exponent, delta: f32) -> Result<Self> {
        if !delta.is_finite() || delta < 0.0 {
            return Err(WpgdError::InvalidConfig(format!(
                "delta must be finite and non-negative, got {delta}"
            )));
        }
        Ok(Self { q, s, delta })
    }

    #[inline]
    pub fn q(&self) -> Exponent {
        self.q
    }

    #[inline]
    pub fn s(&self) -> Exponent {
        self.s
    }

    /// Ball radius, finite and non-negative.
    #[inline]
    pub fn delta(&self) -> f32 {
        self.delta
    }

    /// Create a threat model from raw integer labels.
    pub fn from_labels(q: u32, s: u32, delta: f32) -> Result<Self> {
        Self::new(Exponent::try_from(q)?, Exponent::try_from(s)?, delta)
    }

    /// Threat model from an integer pixel budget.
    ///
    /// For s = 1 the budget is in 1/255 pixel steps and δ is half of it
    /// (`budget / 510`); for s = 2 the budget is in 1/32 units.
    pub fn from_pixel_budget(q: Exponent, s: Exponent, budget: u32) -> Result<Self> {
        let delta = match s {
            Exponent::One => budget as f32 / 510.0,
            Exponent::Two => budget as f32 / 32.0,
        };
        Self::new(q, s, delta)
    }

    /// Experiment signature, e.g. `w_inf-l_2-CE`.
    pub fn signature(&self, loss_name: &str) -> String {
        format!(
            "w_{}-l_{}-{}",
            self.q.norm_label(),
            self.s.norm_label(),
            loss_name
        )
    }
}

/// Train/eval switch of a network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Mode {
    #[default]
    Train,
    Eval,
}

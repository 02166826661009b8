//! Execution settings and result types shared by the analysis paths.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Default mini-batch size for forward and backward passes.
pub const DEFAULT_BATCH_SIZE: usize = 128;

/// How the engine walks over a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecConfig {
    /// Images per forward/backward call.
    pub batch_size: usize,
    /// Use rayon for per-image reductions on large batches.
    pub parallel: bool,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            parallel: true,
        }
    }
}

impl ExecConfig {
    /// Serial execution with the given mini-batch size.
    pub fn serial(batch_size: usize) -> Self {
        Self {
            batch_size,
            parallel: false,
        }
    }
}

/// Mean loss restricted to misclassified samples.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ConditionalLoss {
    Defined(f32),
    /// Every sample was classified correctly, so the mean is undefined.
    NoMisclassified,
}

impl ConditionalLoss {
    /// The numeric value, NaN when undefined.
    pub fn value(&self) -> f32 {
        match self {
            ConditionalLoss::Defined(v) => *v,
            ConditionalLoss::NoMisclassified => f32::NAN,
        }
    }

    pub fn is_defined(&self) -> bool {
        matches!(self, ConditionalLoss::Defined(_))
    }
}

/// Loss and accuracy of a network on a batch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub loss: f32,
    pub acc: f32,
    /// Present only when requested.
    pub loss_cond: Option<ConditionalLoss>,
}

/// Named parameterizations of the attack loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttackKind {
    #[serde(rename = "FGSM")]
    Fgsm,
    #[serde(rename = "PGD")]
    Pgd,
}

impl fmt::Display for AttackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttackKind::Fgsm => write!(f, "FGSM"),
            AttackKind::Pgd => write!(f, "PGD"),
        }
    }
}

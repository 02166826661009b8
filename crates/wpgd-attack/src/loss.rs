//! Per-sample attack losses with their gradients.
//!
//! Every loss maps `(logits (N, K), labels (N,))` to a loss vector `(N,)` and
//! never reduces across the batch. `backward` takes the upstream gradient
//! ∂scalar/∂loss_i (all ones when the scalar is the batch sum) and returns
//! ∂scalar/∂logits.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use wpgd_core::{Result, WpgdError};

/// Denominator guard of the DLR family.
pub const DLR_EPS: f32 = 1e-12;

/// A differentiable per-sample loss.
pub trait LossFunction: Send + Sync {
    /// Stable display name, used only to label results.
    fn name(&self) -> &str;

    fn forward(&self, logits: ArrayView2<'_, f32>, labels: ArrayView1<'_, usize>)
        -> Result<Array1<f32>>;

    fn backward(
        &self,
        logits: ArrayView2<'_, f32>,
        labels: ArrayView1<'_, usize>,
        upstream: ArrayView1<'_, f32>,
    ) -> Result<Array2<f32>>;
}

fn check_inputs(
    logits: &ArrayView2<'_, f32>,
    labels: &ArrayView1<'_, usize>,
    min_classes: usize,
) -> Result<()> {
    let (n, k) = logits.dim();
    if labels.len() != n {
        return Err(WpgdError::shape_mismatch(&[n], labels.shape()));
    }
    if k < min_classes {
        return Err(WpgdError::Loss(format!(
            "needs at least {min_classes} classes, got {k}"
        )));
    }
    if let Some(&bad) = labels.iter().find(|&&y| y >= k) {
        return Err(WpgdError::InvalidInput(format!(
            "label {bad} out of range for {k} classes"
        )));
    }
    Ok(())
}

fn check_upstream(upstream: &ArrayView1<'_, f32>, n: usize) -> Result<()> {
    if upstream.len() != n {
        return Err(WpgdError::shape_mismatch(&[n], upstream.shape()));
    }
    Ok(())
}

/// Softmax cross-entropy, `logsumexp(z) - z_y`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CrossEntropy;

fn log_softmax_parts(row: ArrayView1<'_, f32>) -> (f32, f32) {
    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let sum: f32 = row.iter().map(|&z| (z - max).exp()).sum();
    (max, sum)
}

impl LossFunction for CrossEntropy {
    fn name(&self) -> &str {
        "CE"
    }

    fn forward(
        &self,
        logits: ArrayView2<'_, f32>,
        labels: ArrayView1<'_, usize>,
    ) -> Result<Array1<f32>> {
        check_inputs(&logits, &labels, 1)?;
        Ok(logits
            .outer_iter()
            .zip(labels.iter())
            .map(|(row, &y)| {
                let (max, sum) = log_softmax_parts(row);
                max + sum.ln() - row[y]
            })
            .collect())
    }

    fn backward(
        &self,
        logits: ArrayView2<'_, f32>,
        labels: ArrayView1<'_, usize>,
        upstream: ArrayView1<'_, f32>,
    ) -> Result<Array2<f32>> {
        check_inputs(&logits, &labels, 1)?;
        check_upstream(&upstream, labels.len())?;
        let mut grad = Array2::zeros(logits.dim());
        for (i, (row, &y)) in logits.outer_iter().zip(labels.iter()).enumerate() {
            let (max, sum) = log_softmax_parts(row);
            let u = upstream[i];
            for (j, &z) in row.iter().enumerate() {
                grad[[i, j]] = u * (z - max).exp() / sum;
            }
            grad[[i, y]] -= u;
        }
        Ok(grad)
    }
}

/// Indices of the three largest logits, ties going to the lower index.
fn top3(row: ArrayView1<'_, f32>) -> Option<[usize; 3]> {
    let mut best: [Option<usize>; 3] = [None; 3];
    for (j, &v) in row.iter().enumerate() {
        let mut pos = 3;
        for slot in (0..3).rev() {
            match best[slot] {
                Some(b) if v <= row[b] => break,
                _ => pos = slot,
            }
        }
        if pos < 3 {
            for k in (pos + 1..3).rev() {
                best[k] = best[k - 1];
            }
            best[pos] = Some(j);
        }
    }
    match best {
        [Some(a), Some(b), Some(c)] => Some([a, b, c]),
        _ => None,
    }
}

/// Shared terms of DLR and ReDLR for one sample.
struct DlrTerms {
    /// Whether the label is the arg-max.
    correct: bool,
    /// Index subtracted from `z_y` in the numerator.
    rival: usize,
    top: [usize; 3],
    numerator: f32,
    denominator: f32,
}

impl DlrTerms {
    fn new(row: ArrayView1<'_, f32>, y: usize) -> Result<Self> {
        let top = top3(row).ok_or_else(|| WpgdError::Loss("DLR needs 3 classes".into()))?;
        let correct = top[0] == y;
        let rival = if correct { top[1] } else { top[0] };
        Ok(Self {
            correct,
            rival,
            top,
            numerator: row[y] - row[rival],
            denominator: row[top[0]] - row[top[2]] + DLR_EPS,
        })
    }

    fn loss(&self) -> f32 {
        -self.numerator / self.denominator
    }

    /// Accumulate `u · ∂loss/∂z` into `grad`.
    fn accumulate(&self, y: usize, u: f32, mut grad: ndarray::ArrayViewMut1<'_, f32>) {
        let d = self.denominator;
        grad[y] -= u / d;
        grad[self.rival] += u / d;
        let outer = u * self.numerator / (d * d);
        grad[self.top[0]] += outer;
        grad[self.top[2]] -= outer;
    }
}

/// Difference of logits ratio.
#[derive(Debug, Clone, Copy, Default)]
pub struct Dlr;

impl LossFunction for Dlr {
    fn name(&self) -> &str {
        "DLR"
    }

    fn forward(
        &self,
        logits: ArrayView2<'_, f32>,
        labels: ArrayView1<'_, usize>,
    ) -> Result<Array1<f32>> {
        check_inputs(&logits, &labels, 3)?;
        logits
            .outer_iter()
            .zip(labels.iter())
            .map(|(row, &y)| DlrTerms::new(row, y).map(|t| t.loss()))
            .collect::<Result<Vec<_>>>()
            .map(Array1::from)
    }

    fn backward(
        &self,
        logits: ArrayView2<'_, f32>,
        labels: ArrayView1<'_, usize>,
        upstream: ArrayView1<'_, f32>,
    ) -> Result<Array2<f32>> {
        check_inputs(&logits, &labels, 3)?;
        check_upstream(&upstream, labels.len())?;
        let mut grad = Array2::zeros(logits.dim());
        for (i, (row, &y)) in logits.outer_iter().zip(labels.iter()).enumerate() {
            DlrTerms::new(row, y)?.accumulate(y, upstream[i], grad.row_mut(i));
        }
        Ok(grad)
    }
}

/// Rectified DLR: zero for samples that are already misclassified.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReDlr;

impl LossFunction for ReDlr {
    fn name(&self) -> &str {
        "ReDLR"
    }

    fn forward(
        &self,
        logits: ArrayView2<'_, f32>,
        labels: ArrayView1<'_, usize>,
    ) -> Result<Array1<f32>> {
        check_inputs(&logits, &labels, 3)?;
        logits
            .outer_iter()
            .zip(labels.iter())
            .map(|(row, &y)| {
                DlrTerms::new(row, y).map(|t| if t.correct { t.loss() } else { 0.0 })
            })
            .collect::<Result<Vec<_>>>()
            .map(Array1::from)
    }

    fn backward(
        &self,
        logits: ArrayView2<'_, f32>,
        labels: ArrayView1<'_, usize>,
        upstream: ArrayView1<'_, f32>,
    ) -> Result<Array2<f32>> {
        check_inputs(&logits, &labels, 3)?;
        check_upstream(&upstream, labels.len())?;
        let mut grad = Array2::zeros(logits.dim());
        for (i, (row, &y)) in logits.outer_iter().zip(labels.iter()).enumerate() {
            let terms = DlrTerms::new(row, y)?;
            if terms.correct {
                terms.accumulate(y, upstream[i], grad.row_mut(i));
            }
        }
        Ok(grad)
    }
}

/// Serializable selector over the built-in losses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LossKind {
    #[default]
    #[serde(rename = "CE")]
    CrossEntropy,
    #[serde(rename = "DLR")]
    Dlr,
    #[serde(rename = "ReDLR")]
    ReDlr,
}

impl LossKind {
    fn inner(&self) -> &dyn LossFunction {
        match self {
            LossKind::CrossEntropy => &CrossEntropy,
            LossKind::Dlr => &Dlr,
            LossKind::ReDlr => &ReDlr,
        }
    }
}

impl LossFunction for LossKind {
    fn name(&self) -> &str {
        self.inner().name()
    }

    fn forward(
        &self,
        logits: ArrayView2<'_, f32>,
        labels: ArrayView1<'_, usize>,
    ) -> Result<Array1<f32>> {
        self.inner().forward(logits, labels)
    }

    fn backward(
        &self,
        logits: ArrayView2<'_, f32>,
        labels: ArrayView1<'_, usize>,
        upstream: ArrayView1<'_, f32>,
    ) -> Result<Array2<f32>> {
        self.inner().backward(logits, labels, upstream)
    }
}

impl fmt::Display for LossKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for LossKind {
    type Err = WpgdError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "CE" => Ok(LossKind::CrossEntropy),
            "DLR" => Ok(LossKind::Dlr),
            "ReDLR" => Ok(LossKind::ReDlr),
            other => Err(WpgdError::InvalidConfig(format!("unknown loss {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2};

    fn logits() -> Array2<f32> {
        arr2(&[
            [2.0, 1.0, 0.5, -1.0], // correct for label 0
            [0.3, 1.5, 2.5, 0.0],  // label 1, predicted 2
            [1.0, -0.5, 0.2, 3.0], // correct for label 3
        ])
    }

    fn labels() -> Array1<usize> {
        arr1(&[0, 1, 3])
    }

    fn check_gradient(loss: &dyn LossFunction) {
        let z = logits();
        let y = labels();
        let upstream = Array1::ones(3);
        let grad = loss.backward(z.view(), y.view(), upstream.view()).unwrap();
        let h = 1e-2f32;
        for i in 0..3 {
            for j in 0..4 {
                let mut plus = z.clone();
                plus[[i, j]] += h;
                let mut minus = z.clone();
                minus[[i, j]] -= h;
                let fp = loss.forward(plus.view(), y.view()).unwrap().sum();
                let fm = loss.forward(minus.view(), y.view()).unwrap().sum();
                let fd = (fp - fm) / (2.0 * h);
                assert!(
                    (fd - grad[[i, j]]).abs() < 1e-2,
                    "{} [{i},{j}]: fd {fd} vs analytic {}",
                    loss.name(),
                    grad[[i, j]]
                );
            }
        }
    }

    #[test]
    fn test_cross_entropy_values() {
        let z = arr2(&[[0.0f32, 0.0]]);
        let l = CrossEntropy.forward(z.view(), arr1(&[1]).view()).unwrap();
        assert!((l[0] - 2.0f32.ln()).abs() < 1e-6);
    }

    #[test]
    fn test_cross_entropy_is_stable_for_large_logits() {
        let z = arr2(&[[1000.0f32, 0.0]]);
        let l = CrossEntropy.forward(z.view(), arr1(&[0]).view()).unwrap();
        assert!(l[0].is_finite() && l[0] >= 0.0 && l[0] < 1e-3);
    }

    #[test]
    fn test_gradients_match_finite_differences() {
        check_gradient(&CrossEntropy);
        check_gradient(&Dlr);
        check_gradient(&ReDlr);
    }

    #[test]
    fn test_dlr_values() {
        let l = Dlr.forward(logits().view(), labels().view()).unwrap();
        // Row 0: -(2 - 1) / (2 - 0.5)
        assert!((l[0] + 1.0 / 1.5).abs() < 1e-6);
        // Row 1: -(1.5 - 2.5) / (2.5 - 0.3)
        assert!((l[1] - 1.0 / 2.2).abs() < 1e-6);
    }

    #[test]
    fn test_redlr_zero_on_misclassified() {
        let l = ReDlr.forward(logits().view(), labels().view()).unwrap();
        assert_eq!(l[1], 0.0);
        assert!(l[0] < 0.0);
        let g = ReDlr
            .backward(logits().view(), labels().view(), Array1::ones(3).view())
            .unwrap();
        assert!(g.row(1).iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_dlr_needs_three_classes() {
        let z = arr2(&[[1.0f32, 0.0]]);
        assert!(matches!(
            Dlr.forward(z.view(), arr1(&[0]).view()),
            Err(WpgdError::Loss(_))
        ));
    }

    #[test]
    fn test_label_out_of_range() {
        let z = logits();
        assert!(matches!(
            CrossEntropy.forward(z.view(), arr1(&[0, 1, 4]).view()),
            Err(WpgdError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_top3_ties_prefer_lower_index() {
        let row = arr1(&[1.0f32, 3.0, 3.0, 2.0, 2.0]);
        assert_eq!(top3(row.view()), Some([1, 2, 3]));
    }

    #[test]
    fn test_loss_kind_names_round_trip() {
        for kind in [LossKind::CrossEntropy, LossKind::Dlr, LossKind::ReDlr] {
            assert_eq!(kind.name().parse::<LossKind>().unwrap(), kind);
        }
        assert!("MSE".parse::<LossKind>().is_err());
        let json = serde_json::to_string(&LossKind::ReDlr).unwrap();
        assert_eq!(json, "\"ReDLR\"");
    }
}

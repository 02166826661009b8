//! Loss and accuracy of a network on a labelled batch.

use ndarray::{ArrayView1, ArrayView2, ArrayView4, Axis};
use tracing::debug;
use wpgd_core::{Result, WpgdError};
use wpgd_tensor::{chunks, Batch};

use crate::loss::LossFunction;
use crate::network::{EvalGuard, Network};
use crate::types::{ConditionalLoss, Evaluation, ExecConfig};

/// Arg-max of each row; the first maximum wins ties.
fn predictions(logits: &ArrayView2<'_, f32>) -> Vec<usize> {
    logits
        .outer_iter()
        .map(|row| {
            let mut best = 0;
            for (j, &v) in row.iter().enumerate().skip(1) {
                if v > row[best] {
                    best = j;
                }
            }
            best
        })
        .collect()
}

/// Streams a batch through a network in evaluation mode.
#[derive(Debug, Clone, Copy, Default)]
pub struct Evaluator {
    exec: ExecConfig,
}

impl Evaluator {
    pub fn new(exec: ExecConfig) -> Self {
        Self { exec }
    }

    /// Mean loss, top-1 accuracy and, if `conditional`, the mean loss over
    /// misclassified samples.
    pub fn evaluate<N, L>(
        &self,
        network: &mut N,
        images: ArrayView4<'_, f32>,
        labels: ArrayView1<'_, usize>,
        loss: &L,
        conditional: bool,
    ) -> Result<Evaluation>
    where
        N: Network + ?Sized,
        L: LossFunction + ?Sized,
    {
        let n = images.len_of(Axis(0));
        if n == 0 {
            return Err(WpgdError::EmptyBatch);
        }
        if labels.len() != n {
            return Err(WpgdError::shape_mismatch(&[n], labels.shape()));
        }

        let network = EvalGuard::new(network);
        let mut loss_sum = 0.0f64;
        let mut correct = 0usize;
        let mut wrong_loss_sum = 0.0f64;
        let mut wrong = 0usize;

        for (x_b, y_b) in chunks(images.reborrow(), labels.reborrow(), self.exec.batch_size) {
            let logits = network.forward(x_b)?;
            if logits.nrows() != y_b.len() {
                return Err(WpgdError::Network(format!(
                    "forward returned {} rows for {} images",
                    logits.nrows(),
                    y_b.len()
                )));
            }
            let per_sample = loss.forward(logits.view(), y_b)?;
            if per_sample.len() != y_b.len() {
                return Err(WpgdError::Loss(format!(
                    "{} returned {} values for {} samples",
                    loss.name(),
                    per_sample.len(),
                    y_b.len()
                )));
            }
            for ((pred, &y), &l) in predictions(&logits.view())
                .into_iter()
                .zip(y_b.iter())
                .zip(per_sample.iter())
            {
                loss_sum += l as f64;
                if pred == y {
                    correct += 1;
                } else {
                    wrong += 1;
                    wrong_loss_sum += l as f64;
                }
            }
        }

        let loss_cond = conditional.then(|| {
            if wrong == 0 {
                debug!("Conditional loss undefined: no misclassified samples");
                ConditionalLoss::NoMisclassified
            } else {
                ConditionalLoss::Defined((wrong_loss_sum / wrong as f64) as f32)
            }
        });

        Ok(Evaluation {
            loss: (loss_sum / n as f64) as f32,
            acc: correct as f32 / n as f32,
            loss_cond,
        })
    }

    /// Evaluate on a whole [`Batch`].
    pub fn evaluate_batch<N, L>(
        &self,
        network: &mut N,
        batch: &Batch,
        loss: &L,
        conditional: bool,
    ) -> Result<Evaluation>
    where
        N: Network + ?Sized,
        L: LossFunction + ?Sized,
    {
        self.evaluate(
            network,
            batch.images().view(),
            batch.labels().view(),
            loss,
            conditional,
        )
    }
}

/// Evaluate with the default execution settings.
pub fn evaluate<N, L>(network: &mut N, batch: &Batch, loss: &L, conditional: bool) -> Result<Evaluation>
where
    N: Network + ?Sized,
    L: LossFunction + ?Sized,
{
    Evaluator::default().evaluate_batch(network, batch, loss, conditional)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loss::CrossEntropy;
    use crate::network::{Dense, Mlp};
    use ndarray::{arr1, arr2, Array1, Array2, Array4};

    /// Two pixels in, two classes out: class = brighter pixel.
    fn comparator() -> Mlp {
        let layer = Dense::new(arr2(&[[1.0, -1.0], [-1.0, 1.0]]), arr1(&[0.0, 0.0])).unwrap();
        Mlp::new([1, 1, 2], vec![layer]).unwrap()
    }

    fn batch(pixels: &[[f32; 2]], labels: &[usize]) -> Batch {
        let images = Array4::from_shape_fn((pixels.len(), 1, 1, 2), |(i, _, _, w)| pixels[i][w]);
        Batch::new(images, arr1(labels)).unwrap()
    }

    /// Collapses the batch into a single mean value.
    struct MeanOnly;

    impl LossFunction for MeanOnly {
        fn name(&self) -> &str {
            "mean-only"
        }

        fn forward(
            &self,
            logits: ArrayView2<'_, f32>,
            labels: ArrayView1<'_, usize>,
        ) -> Result<Array1<f32>> {
            let per_sample = CrossEntropy.forward(logits, labels)?;
            Ok(arr1(&[per_sample.mean().unwrap_or(0.0)]))
        }

        fn backward(
            &self,
            logits: ArrayView2<'_, f32>,
            _labels: ArrayView1<'_, usize>,
            _upstream: ArrayView1<'_, f32>,
        ) -> Result<Array2<f32>> {
            Ok(Array2::zeros(logits.raw_dim()))
        }
    }

    #[test]
    fn test_predictions_first_max_wins() {
        let logits = arr2(&[[1.0f32, 3.0, 3.0], [2.0, 2.0, 0.0]]);
        assert_eq!(predictions(&logits.view()), vec![1, 0]);
    }

    #[test]
    fn test_accuracy_and_conditional_loss() {
        let mut net = comparator();
        let b = batch(&[[0.9, 0.1], [0.2, 0.8], [0.7, 0.3], [0.6, 0.4]], &[0, 1, 1, 1]);
        let eval = Evaluator::new(ExecConfig::serial(3))
            .evaluate_batch(&mut net, &b, &CrossEntropy, true)
            .unwrap();
        assert_eq!(eval.acc, 0.5);

        let logits = net.forward(b.images().view()).unwrap();
        let losses = CrossEntropy.forward(logits.view(), b.labels().view()).unwrap();
        assert!((eval.loss - losses.mean().unwrap()).abs() < 1e-6);
        let expected_cond = (losses[2] + losses[3]) / 2.0;
        match eval.loss_cond {
            Some(ConditionalLoss::Defined(v)) => assert!((v - expected_cond).abs() < 1e-6),
            other => panic!("unexpected conditional loss {other:?}"),
        }
    }

    #[test]
    fn test_conditional_loss_undefined_when_all_correct() {
        let mut net = comparator();
        let b = batch(&[[0.9, 0.1], [0.2, 0.8]], &[0, 1]);
        let eval = evaluate(&mut net, &b, &CrossEntropy, true).unwrap();
        assert_eq!(eval.acc, 1.0);
        let cond = eval.loss_cond.unwrap();
        assert_eq!(cond, ConditionalLoss::NoMisclassified);
        assert!(cond.value().is_nan());
    }

    #[test]
    fn test_conditional_loss_omitted_unless_requested() {
        let mut net = comparator();
        let b = batch(&[[0.9, 0.1]], &[1]);
        let eval = evaluate(&mut net, &b, &CrossEntropy, false).unwrap();
        assert_eq!(eval.acc, 0.0);
        assert!(eval.loss_cond.is_none());
    }

    #[test]
    fn test_loss_with_wrong_length_is_rejected() {
        let mut net = comparator();
        let b = batch(&[[0.9, 0.1], [0.2, 0.8], [0.7, 0.3]], &[0, 1, 1]);
        let result = evaluate(&mut net, &b, &MeanOnly, false);
        assert!(matches!(result, Err(WpgdError::Loss(_))));
    }
}

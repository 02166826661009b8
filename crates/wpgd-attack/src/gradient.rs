//! Per-sample input gradients of a loss.
//!
//! Each mini-batch is pushed through [`Network::forward_tracked`], the
//! per-sample losses are summed, and the sum is differentiated once with
//! respect to the mini-batch input. Samples are independent, so the cross
//! terms vanish and the result holds one unscaled gradient per image.

use ndarray::{Array1, Array4, ArrayView1, ArrayView4, Axis};
use tracing::trace;
use wpgd_core::{Result, WpgdError};
use wpgd_tensor::{chunks, concat_batches};

use crate::loss::LossFunction;
use crate::network::{EvalGuard, Network};
use crate::types::ExecConfig;

/// Computes batched input gradients in fixed-size mini-batches.
#[derive(Debug, Clone, Copy, Default)]
pub struct GradientProvider {
    exec: ExecConfig,
}

impl GradientProvider {
    pub fn new(exec: ExecConfig) -> Self {
        Self { exec }
    }

    /// Gradient of `loss(network(images), labels)` with respect to `images`.
    ///
    /// The network is held in evaluation mode for the duration of the call.
    pub fn gradient<N, L>(
        &self,
        network: &mut N,
        images: ArrayView4<'_, f32>,
        labels: ArrayView1<'_, usize>,
        loss: &L,
    ) -> Result<Array4<f32>>
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
        let parts = chunks(images.reborrow(), labels.reborrow(), self.exec.batch_size)
            .enumerate()
            .map(|(idx, (x_b, y_b))| minibatch_gradient(&*network, x_b, y_b, loss, idx))
            .collect::<Result<Vec<_>>>()?;
        concat_batches(&parts)
    }
}

fn minibatch_gradient<N, L>(
    network: &N,
    images: ArrayView4<'_, f32>,
    labels: ArrayView1<'_, usize>,
    loss: &L,
    index: usize,
) -> Result<Array4<f32>>
where
    N: Network + ?Sized,
    L: LossFunction + ?Sized,
{
    let tape = network.forward_tracked(images.reborrow())?;
    let per_sample = loss.forward(tape.logits(), labels)?;
    if per_sample.len() != labels.len() {
        return Err(WpgdError::Loss(format!(
            "{} returned {} values for {} samples",
            loss.name(),
            per_sample.len(),
            labels.len()
        )));
    }
    trace!(
        "Mini-batch {}: {} samples, summed {} = {:.6}",
        index,
        labels.len(),
        loss.name(),
        per_sample.sum()
    );

    let upstream = Array1::ones(labels.len());
    let grad_logits = loss.backward(tape.logits(), labels, upstream.view())?;
    let grad = tape.backward(grad_logits.view())?;
    if grad.shape() != images.shape() {
        return Err(WpgdError::shape_mismatch(images.shape(), grad.shape()));
    }
    Ok(grad)
}

//! Upsilon: an attack-free sensitivity score.
//!
//! Each sample's input gradient is measured with the dual norm l_s, and the
//! per-sample norms are aggregated across the batch with the normalized norm
//! selected by `q` (the maximum for q = 1, the root mean square for q = 2).

use ndarray::Array1;
use tracing::debug;
use wpgd_core::{Exponent, Result};
use wpgd_tensor::{per_image_norms, Batch};

use crate::gradient::GradientProvider;
use crate::loss::LossFunction;
use crate::network::Network;
use crate::types::ExecConfig;

/// Dual-norm magnitude of every sample's input gradient.
pub fn gradient_norms<N, L>(
    network: &mut N,
    batch: &Batch,
    loss: &L,
    s: Exponent,
    exec: ExecConfig,
) -> Result<Array1<f32>>
where
    N: Network + ?Sized,
    L: LossFunction + ?Sized,
{
    let grad = GradientProvider::new(exec).gradient(
        network,
        batch.images().view(),
        batch.labels().view(),
        loss,
    )?;
    Ok(per_image_norms(grad.view(), s.dual_order(), exec.parallel))
}

/// Upsilon of `network` on `batch` for the (q, s) pair.
pub fn upsilon<N, L>(
    network: &mut N,
    batch: &Batch,
    loss: &L,
    q: Exponent,
    s: Exponent,
    exec: ExecConfig,
) -> Result<f32>
where
    N: Network + ?Sized,
    L: LossFunction + ?Sized,
{
    let norms = gradient_norms(network, batch, loss, s, exec)?;
    let value = q.primal_order().mean_norm(norms.iter().copied());
    debug!(
        "Upsilon(q={}, s={}, {}) over {} samples = {:.6e}",
        q,
        s,
        loss.name(),
        norms.len(),
        value
    );
    Ok(value)
}

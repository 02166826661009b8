//! The differentiable network seam.
//!
//! A [`Network`] maps a batch of images to logits. Input gradients come from
//! [`Network::forward_tracked`], which returns a [`Tape`] holding the logits
//! and a one-shot pullback to the input. The tape owns every piece of
//! autodiff state for that call; dropping it, on any path, ends tracking.

use ndarray::{Array1, Array2, Array4, ArrayView2, ArrayView4, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::ops::Deref;
use wpgd_core::{Mode, Result, WpgdError};

/// Vector-Jacobian product from logits back to the input images.
pub type Pullback<'a> = Box<dyn FnOnce(ArrayView2<'_, f32>) -> Result<Array4<f32>> + 'a>;

/// Logits recorded with a pullback to the input.
pub struct Tape<'a> {
    logits: Array2<f32>,
    pullback: Pullback<'a>,
}

impl<'a> Tape<'a> {
    pub fn new(logits: Array2<f32>, pullback: Pullback<'a>) -> Self {
        Self { logits, pullback }
    }

    #[inline]
    pub fn logits(&self) -> ArrayView2<'_, f32> {
        self.logits.view()
    }

    /// Back-propagate `grad_logits` (∂scalar/∂logits) to the input.
    pub fn backward(self, grad_logits: ArrayView2<'_, f32>) -> Result<Array4<f32>> {
        if grad_logits.shape() != self.logits.shape() {
            return Err(WpgdError::shape_mismatch(
                self.logits.shape(),
                grad_logits.shape(),
            ));
        }
        (self.pullback)(grad_logits)
    }
}

impl std::fmt::Debug for Tape<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tape")
            .field("logits_shape", &self.logits.shape())
            .finish_non_exhaustive()
    }
}

/// A differentiable image classifier.
///
/// Implementations must not mutate their weights in any of these calls;
/// only the mode flag is writable.
pub trait Network {
    fn mode(&self) -> Mode;

    fn set_mode(&mut self, mode: Mode);

    /// Logits of shape `(N, num_classes)`.
    fn forward(&self, images: ArrayView4<'_, f32>) -> Result<Array2<f32>>;

    /// Forward pass that records what is needed to differentiate the logits
    /// with respect to `images`.
    fn forward_tracked<'a>(&'a self, images: ArrayView4<'a, f32>) -> Result<Tape<'a>>;
}

/// Holds a network in evaluation mode and restores the previous mode on drop.
pub struct EvalGuard<'n, N: Network + ?Sized> {
    network: &'n mut N,
    previous: Mode,
}

impl<'n, N: Network + ?Sized> EvalGuard<'n, N> {
    pub fn new(network: &'n mut N) -> Self {
        let previous = network.mode();
        network.set_mode(Mode::Eval);
        Self { network, previous }
    }
}

impl<N: Network + ?Sized> Deref for EvalGuard<'_, N> {
    type Target = N;

    fn deref(&self) -> &N {
        self.network
    }
}

impl<N: Network + ?Sized> Drop for EvalGuard<'_, N> {
    fn drop(&mut self) {
        self.network.set_mode(self.previous);
    }
}

/// Fully connected layer `y = x Wᵀ + b`.
#[derive(Debug, Clone)]
pub struct Dense {
    weight: Array2<f32>,
    bias: Array1<f32>,
}

impl Dense {
    pub fn new(weight: Array2<f32>, bias: Array1<f32>) -> Result<Self> {
        if bias.len() != weight.nrows() {
            return Err(WpgdError::shape_mismatch(&[weight.nrows()], bias.shape()));
        }
        Ok(Self { weight, bias })
    }

    /// Shape `(out_features, in_features)`.
    pub fn weight(&self) -> &Array2<f32> {
        &self.weight
    }

    pub fn bias(&self) -> &Array1<f32> {
        &self.bias
    }

    #[inline]
    pub fn in_features(&self) -> usize {
        self.weight.ncols()
    }

    #[inline]
    pub fn out_features(&self) -> usize {
        self.weight.nrows()
    }

    fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        x.dot(&self.weight.t()) + &self.bias
    }
}

/// ReLU multilayer perceptron over flattened images.
///
/// Has no train-time behaviour; the mode flag is only recorded.
#[derive(Debug, Clone)]
pub struct Mlp {
    input_shape: [usize; 3],
    layers: Vec<Dense>,
    mode: Mode,
}

impl Mlp {
    /// Build from `(C, H, W)` and a non-empty layer stack.
    pub fn new(input_shape: [usize; 3], layers: Vec<Dense>) -> Result<Self> {
        let Some(first) = layers.first() else {
            return Err(WpgdError::InvalidConfig("network has no layers".into()));
        };
        let features: usize = input_shape.iter().product();
        if first.in_features() != features {
            return Err(WpgdError::shape_mismatch(&[features], &[first.in_features()]));
        }
        for layer in &layers {
            if layer.in_features() == 0 || layer.out_features() == 0 {
                return Err(WpgdError::InvalidConfig(format!(
                    "layer {}x{} has a zero dimension",
                    layer.out_features(),
                    layer.in_features()
                )));
            }
            if layer.bias.len() != layer.out_features() {
                return Err(WpgdError::shape_mismatch(&[layer.out_features()], layer.bias.shape()));
            }
        }
        for pair in layers.windows(2) {
            if pair[0].out_features() != pair[1].in_features() {
                return Err(WpgdError::shape_mismatch(
                    &[pair[0].out_features()],
                    &[pair[1].in_features()],
                ));
            }
        }
        Ok(Self {
            input_shape,
            layers,
            mode: Mode::Train,
        })
    }

    /// Random network with uniform ±1/√fan_in weights, for experiments.
    pub fn seeded(
        input_shape: [usize; 3],
        hidden: &[usize],
        num_classes: usize,
        seed: u64,
    ) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut widths = vec![input_shape.iter().product::<usize>()];
        widths.extend_from_slice(hidden);
        widths.push(num_classes);
        if widths.contains(&0) {
            return Err(WpgdError::InvalidConfig(format!(
                "layer widths {widths:?} must be positive"
            )));
        }

        let layers = widths
            .windows(2)
            .map(|w| {
                let bound = 1.0 / (w[0] as f32).sqrt();
                let weight =
                    Array2::from_shape_simple_fn((w[1], w[0]), || rng.random_range(-bound..=bound));
                let bias = Array1::from_shape_simple_fn(w[1], || rng.random_range(-bound..=bound));
                Dense::new(weight, bias)
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(input_shape, layers)
    }

    pub fn num_classes(&self) -> usize {
        self.layers.last().map_or(0, Dense::out_features)
    }

    pub fn layers(&self) -> &[Dense] {
        &self.layers
    }

    fn flatten(&self, images: ArrayView4<'_, f32>) -> Result<Array2<f32>> {
        let (n, c, h, w) = images.dim();
        if [c, h, w] != self.input_shape {
            let [ec, eh, ew] = self.input_shape;
            return Err(WpgdError::shape_mismatch(&[n, ec, eh, ew], &[n, c, h, w]));
        }
        images
            .to_shape((n, c * h * w))
            .map(|flat| flat.into_owned())
            .map_err(|e| WpgdError::Network(e.to_string()))
    }
}

impl Network for Mlp {
    fn mode(&self) -> Mode {
        self.mode
    }

    fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    fn forward(&self, images: ArrayView4<'_, f32>) -> Result<Array2<f32>> {
        let mut h = self.flatten(images)?;
        let last = self.layers.len() - 1;
        for (i, layer) in self.layers.iter().enumerate() {
            h = layer.forward(&h);
            if i < last {
                h.mapv_inplace(|v| v.max(0.0));
            }
        }
        Ok(h)
    }

    fn forward_tracked<'a>(&'a self, images: ArrayView4<'a, f32>) -> Result<Tape<'a>> {
        let dim = images.dim();
        let mut h = self.flatten(images)?;
        let last = self.layers.len() - 1;
        let mut masks = Vec::with_capacity(last);
        for (i, layer) in self.layers.iter().enumerate() {
            h = layer.forward(&h);
            if i < last {
                masks.push(h.mapv(|v| if v > 0.0 { 1.0 } else { 0.0 }));
                h.mapv_inplace(|v| v.max(0.0));
            }
        }

        let pullback: Pullback<'a> = Box::new(move |grad_logits: ArrayView2<'_, f32>| {
            let mut g = grad_logits.to_owned();
            for (i, layer) in self.layers.iter().enumerate().rev() {
                if i < last {
                    g *= &masks[i];
                }
                g = g.dot(layer.weight());
            }
            unflatten(g, dim)
        });
        Ok(Tape::new(h, pullback))
    }
}

/// Reshape a flat `(N, D)` input gradient back to `(N, C, H, W)`.
pub fn unflatten(grad: Array2<f32>, dim: (usize, usize, usize, usize)) -> Result<Array4<f32>> {
    if grad.len_of(Axis(0)) != dim.0 {
        return Err(WpgdError::shape_mismatch(&[dim.0], &[grad.len_of(Axis(0))]));
    }
    grad.into_shape_with_order(dim)
        .map_err(|e| WpgdError::Network(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2, Array};

    fn tiny() -> Mlp {
        // 4 inputs -> 3 hidden (ReLU) -> 2 classes
        let l1 = Dense::new(
            arr2(&[
                [1.0, -1.0, 0.5, 0.0],
                [0.0, 2.0, -1.0, 1.0],
                [-1.0, 0.0, 0.0, 1.0],
            ]),
            arr1(&[0.1, -0.2, 0.0]),
        )
        .unwrap();
        let l2 = Dense::new(arr2(&[[1.0, -1.0, 2.0], [0.5, 1.0, -1.0]]), arr1(&[0.0, 0.3])).unwrap();
        Mlp::new([1, 2, 2], vec![l1, l2]).unwrap()
    }

    fn images() -> Array4<f32> {
        Array::from_shape_fn((3, 1, 2, 2), |(i, _, h, w)| {
            0.1 + 0.2 * i as f32 + 0.15 * (h * 2 + w) as f32
        })
    }

    #[test]
    fn test_mlp_rejects_inconsistent_layers() {
        let l1 = Dense::new(Array2::zeros((3, 4)), Array1::zeros(3)).unwrap();
        let l2 = Dense::new(Array2::zeros((2, 5)), Array1::zeros(2)).unwrap();
        assert!(Mlp::new([1, 2, 2], vec![l1.clone(), l2]).is_err());
        assert!(Mlp::new([1, 3, 3], vec![l1]).is_err());
        assert!(Mlp::new([1, 2, 2], vec![]).is_err());
    }

    #[test]
    fn test_tracked_forward_matches_forward() {
        let net = tiny();
        let x = images();
        let plain = net.forward(x.view()).unwrap();
        let tape = net.forward_tracked(x.view()).unwrap();
        assert_eq!(plain, tape.logits().to_owned());
    }

    #[test]
    fn test_pullback_matches_finite_differences() {
        let net = tiny();
        let x = images();
        let tape = net.forward_tracked(x.view()).unwrap();
        // Differentiate sum of logit 0 over the batch.
        let mut seed = Array2::<f32>::zeros((3, 2));
        seed.column_mut(0).fill(1.0);
        let grad = tape.backward(seed.view()).unwrap();
        assert_eq!(grad.dim(), x.dim());

        let h = 1e-3f32;
        for idx in [(0, 0, 0, 0), (1, 0, 1, 0), (2, 0, 1, 1)] {
            let mut plus = x.clone();
            plus[idx] += h;
            let mut minus = x.clone();
            minus[idx] -= h;
            let fp = net.forward(plus.view()).unwrap().column(0).sum();
            let fm = net.forward(minus.view()).unwrap().column(0).sum();
            let fd = (fp - fm) / (2.0 * h);
            assert!((fd - grad[idx]).abs() < 1e-2, "{idx:?}: fd {fd} vs {}", grad[idx]);
        }
    }

    #[test]
    fn test_backward_rejects_wrong_seed_shape() {
        let net = tiny();
        let x = images();
        let tape = net.forward_tracked(x.view()).unwrap();
        let seed = Array2::<f32>::zeros((2, 2));
        assert!(matches!(
            tape.backward(seed.view()),
            Err(WpgdError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_eval_guard_restores_mode() {
        let mut net = tiny();
        assert_eq!(net.mode(), Mode::Train);
        {
            let guard = EvalGuard::new(&mut net);
            assert_eq!(guard.mode(), Mode::Eval);
        }
        assert_eq!(net.mode(), Mode::Train);
    }

    #[test]
    fn test_seeded_is_reproducible() {
        let a = Mlp::seeded([1, 2, 2], &[5], 3, 7).unwrap();
        let b = Mlp::seeded([1, 2, 2], &[5], 3, 7).unwrap();
        let x = images();
        assert_eq!(a.forward(x.view()).unwrap(), b.forward(x.view()).unwrap());
        assert_eq!(a.num_classes(), 3);
    }

    #[test]
    fn test_zero_sized_layers_rejected() {
        assert!(matches!(
            Mlp::seeded([0, 2, 2], &[4], 3, 1),
            Err(WpgdError::InvalidConfig(_))
        ));
        assert!(matches!(
            Mlp::seeded([1, 2, 2], &[0], 3, 1),
            Err(WpgdError::InvalidConfig(_))
        ));
        assert!(Mlp::seeded([1, 2, 2], &[4], 0, 1).is_err());

        let empty = Dense::new(Array2::zeros((2, 0)), Array1::zeros(2)).unwrap();
        assert!(matches!(
            Mlp::new([0, 1, 1], vec![empty]),
            Err(WpgdError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_dense_exposes_validated_parameters() {
        let layer = Dense::new(Array2::ones((2, 3)), Array1::zeros(2)).unwrap();
        assert_eq!(layer.weight().dim(), (2, 3));
        assert_eq!(layer.bias().len(), layer.out_features());
        assert!(Dense::new(Array2::ones((2, 3)), Array1::zeros(3)).is_err());
    }
}

//! Image batches and per-image norm kernels.
//!
//! Images are stored as `(N, C, H, W)` tensors with pixel values in [0, 1].
//! Every kernel here treats axis 0 as the batch axis and flattens the
//! remaining axes when measuring an image.

use ndarray::{Array1, Array4, ArrayView1, ArrayView4, Axis, Slice};
use rayon::prelude::*;
use wpgd_core::{NormOrder, Result, WpgdError};

/// Below this many images the per-image kernels run serially.
pub const MIN_IMAGES_FOR_PARALLEL: usize = 16;

/// A labelled batch of images.
///
/// Invariants: at least one image, one label per image, every pixel finite
/// and inside [0, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    images: Array4<f32>,
    labels: Array1<usize>,
}

impl Batch {
    pub fn new(images: Array4<f32>, labels: Array1<usize>) -> Result<Self> {
        let n = images.len_of(Axis(0));
        if n == 0 {
            return Err(WpgdError::EmptyBatch);
        }
        if labels.len() != n {
            return Err(WpgdError::shape_mismatch(&[n], labels.shape()));
        }
        if let Some(bad) = images
            .iter()
            .find(|v| !v.is_finite() || **v < 0.0 || **v > 1.0)
        {
            return Err(WpgdError::InvalidInput(format!(
                "pixel value {bad} outside [0, 1]"
            )));
        }
        Ok(Self { images, labels })
    }

    #[inline]
    pub fn images(&self) -> &Array4<f32> {
        &self.images
    }

    #[inline]
    pub fn labels(&self) -> &Array1<usize> {
        &self.labels
    }

    /// Number of images.
    #[inline]
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Always false for a constructed batch; provided for API symmetry.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Shape of the image tensor as `[N, C, H, W]`.
    pub fn image_shape(&self) -> [usize; 4] {
        let (n, c, h, w) = self.images.dim();
        [n, c, h, w]
    }

    /// Split into images and labels.
    pub fn into_parts(self) -> (Array4<f32>, Array1<usize>) {
        (self.images, self.labels)
    }

    /// Mini-batches of at most `batch_size` images, in input order.
    pub fn chunks(
        &self,
        batch_size: usize,
    ) -> impl Iterator<Item = (ArrayView4<'_, f32>, ArrayView1<'_, usize>)> {
        chunks(self.images.view(), self.labels.view(), batch_size)
    }
}

/// Mini-batches of images paired with their labels, in input order.
///
/// A `batch_size` of zero is treated as one.
pub fn chunks<'a>(
    images: ArrayView4<'a, f32>,
    labels: ArrayView1<'a, usize>,
    batch_size: usize,
) -> impl Iterator<Item = (ArrayView4<'a, f32>, ArrayView1<'a, usize>)> {
    let size = batch_size.max(1);
    let n = images.len_of(Axis(0)).min(labels.len());
    (0..n).step_by(size).map(move |start| {
        let rows = Slice::from(start..(start + size).min(n));
        (
            images.slice_axis_move(Axis(0), rows),
            labels.slice_axis_move(Axis(0), rows),
        )
    })
}

/// Fail unless `a` and `b` have identical shapes.
pub fn ensure_same_shape(a: &ArrayView4<'_, f32>, b: &ArrayView4<'_, f32>) -> Result<()> {
    if a.shape() != b.shape() {
        return Err(WpgdError::shape_mismatch(b.shape(), a.shape()));
    }
    Ok(())
}

/// Norm of every image, flattened over the non-batch axes.
pub fn per_image_norms(x: ArrayView4<'_, f32>, order: NormOrder, parallel: bool) -> Array1<f32> {
    let n = x.len_of(Axis(0));
    if parallel && n >= MIN_IMAGES_FOR_PARALLEL {
        let norms: Vec<f32> = x
            .axis_iter(Axis(0))
            .into_par_iter()
            .map(|img| order.norm(img.iter().copied()))
            .collect();
        Array1::from(norms)
    } else {
        x.axis_iter(Axis(0))
            .map(|img| order.norm(img.iter().copied()))
            .collect()
    }
}

/// Multiply every image by its own factor.
pub fn scale_per_image(x: &mut Array4<f32>, factors: &Array1<f32>) -> Result<()> {
    let n = x.len_of(Axis(0));
    if factors.len() != n {
        return Err(WpgdError::shape_mismatch(&[n], factors.shape()));
    }
    let column = factors
        .view()
        .into_shape_with_order((n, 1, 1, 1))
        .map_err(|e| WpgdError::InvalidInput(e.to_string()))?;
    *x *= &column;
    Ok(())
}

/// Clamp every element of image `i` into `[-bounds[i], bounds[i]]`.
pub fn clamp_per_image(x: &mut Array4<f32>, bounds: &Array1<f32>) -> Result<()> {
    let n = x.len_of(Axis(0));
    if bounds.len() != n {
        return Err(WpgdError::shape_mismatch(&[n], bounds.shape()));
    }
    if let Some(bad) = bounds.iter().find(|b| !b.is_finite() || **b < 0.0) {
        return Err(WpgdError::InvalidInput(format!("invalid clamp bound {bad}")));
    }
    for (mut img, &b) in x.axis_iter_mut(Axis(0)).zip(bounds.iter()) {
        img.mapv_inplace(|v| v.clamp(-b, b));
    }
    Ok(())
}

/// Clamp pixels to the valid range [0, 1].
pub fn clamp_unit(x: &mut Array4<f32>) {
    x.mapv_inplace(|v| v.clamp(0.0, 1.0));
}

/// Stack mini-batch results back along the batch axis.
pub fn concat_batches(parts: &[Array4<f32>]) -> Result<Array4<f32>> {
    if parts.is_empty() {
        return Err(WpgdError::EmptyBatch);
    }
    let views: Vec<_> = parts.iter().map(|p| p.view()).collect();
    ndarray::concatenate(Axis(0), &views)
        .map_err(|e| WpgdError::InvalidInput(format!("cannot concatenate mini-batches: {e}")))
}

// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! Training objectives: softmax cross-entropy and center loss.

use ndarray::{Array2, ArrayD, Axis, IxDyn};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::error::{OpenSetError, Result};
use crate::nn::{Module, Param};

const DIST_MIN: f32 = 1e-12;
const DIST_MAX: f32 = 1e12;

fn check_labels(labels: &[usize], rows: usize, num_classes: usize) -> Result<()> {
    if labels.len() != rows {
        return Err(OpenSetError::ModelError(format!(
            "{} labels for a batch of {rows}",
            labels.len()
        )));
    }
    if let Some(bad) = labels.iter().find(|&&l| l >= num_classes) {
        return Err(OpenSetError::ModelError(format!(
            "label {bad} out of range for {num_classes} classes"
        )));
    }
    Ok(())
}

/// Row-wise softmax computed with the max subtracted for stability.
#[must_use]
pub fn softmax(logits: &Array2<f32>) -> Array2<f32> {
    let mut probs = logits.clone();
    for mut row in probs.rows_mut() {
        let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|v| v / sum);
    }
    probs
}

/// Mean softmax cross-entropy and its gradient with respect to the logits.
///
/// # Errors
///
/// Returns an error if the labels do not match the batch or the class count.
#[allow(clippy::cast_precision_loss)]
pub fn cross_entropy(logits: &Array2<f32>, labels: &[usize]) -> Result<(f32, Array2<f32>)> {
    let (n, k) = logits.dim();
    check_labels(labels, n, k)?;
    if n == 0 {
        return Ok((0.0, Array2::zeros((0, k))));
    }
    let mut grad = softmax(logits);
    let mut loss = 0.0;
    for (i, &y) in labels.iter().enumerate() {
        loss -= grad[[i, y]].max(f32::MIN_POSITIVE).ln();
        grad[[i, y]] -= 1.0;
    }
    let scale = 1.0 / n as f32;
    grad.mapv_inplace(|g| g * scale);
    Ok((loss * scale, grad))
}

/// Output of [`CenterLoss::forward`].
#[derive(Debug, Clone)]
pub struct CenterLossOutput {
    /// Mean squared distance to the assigned centers.
    pub loss: f32,
    /// Gradient with respect to the features.
    pub grad_features: Array2<f32>,
}

/// Center loss: pulls each feature toward a learned center of its class.
///
/// `forward` also accumulates the center gradient into [`CenterLoss::centers`].
#[derive(Debug, Clone)]
pub struct CenterLoss {
    /// Class centers as `(num_classes, feat_dim)`.
    pub centers: Param,
}

impl CenterLoss {
    /// Create centers drawn from a standard normal.
    pub fn new<R: Rng + ?Sized>(num_classes: usize, feat_dim: usize, rng: &mut R) -> Self {
        let value = ArrayD::from_shape_simple_fn(IxDyn(&[num_classes, feat_dim]), || {
            StandardNormal.sample(rng)
        });
        Self {
            centers: Param::new(value),
        }
    }

    /// Number of centers.
    #[must_use]
    pub fn num_classes(&self) -> usize {
        self.centers.value.shape()[0]
    }

    /// Centers as a 2-D array.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored centers are not two-dimensional.
    pub fn centers(&self) -> Result<Array2<f32>> {
        self.centers
            .value
            .clone()
            .into_dimensionality()
            .map_err(|e| OpenSetError::ModelError(e.to_string()))
    }

    /// Compute `sum_i clamp(|x_i - c_{y_i}|^2) / N`.
    ///
    /// # Errors
    ///
    /// Returns an error on label or dimension mismatch.
    #[allow(clippy::cast_precision_loss)]
    pub fn forward(&mut self, features: &Array2<f32>, labels: &[usize]) -> Result<CenterLossOutput> {
        let (n, d) = features.dim();
        check_labels(labels, n, self.num_classes())?;
        let centers = self.centers()?;
        if centers.ncols() != d {
            return Err(OpenSetError::ModelError(format!(
                "features have {d} dims, centers have {}",
                centers.ncols()
            )));
        }
        let mut grad_features = Array2::zeros((n, d));
        if n == 0 {
            return Ok(CenterLossOutput {
                loss: 0.0,
                grad_features,
            });
        }
        let scale = 1.0 / n as f32;
        let mut loss = 0.0;
        for (i, &y) in labels.iter().enumerate() {
            let diff = &features.row(i) - &centers.row(y);
            loss += diff.dot(&diff).clamp(DIST_MIN, DIST_MAX);
            let g = diff * (2.0 * scale);
            grad_features.row_mut(i).assign(&g);
            let mut cg = self.centers.grad.index_axis_mut(Axis(0), y);
            cg -= &g;
        }
        Ok(CenterLossOutput {
            loss: loss * scale,
            grad_features,
        })
    }
}

impl Module for CenterLoss {
    fn named_params(&self) -> Vec<(String, &Param)> {
        vec![("centers".to_string(), &self.centers)]
    }

    fn params_mut(&mut self) -> Vec<&mut Param> {
        vec![&mut self.centers]
    }
}

// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! Convolutional classifier with a 2-D embedding layer.
//!
//! The network is a stack of conv/PReLU/max-pool stages followed by `fc1`, which
//! projects to a two-dimensional feature space, and `fc2`, which maps those
//! features to class logits. The 2-D features are what center loss clusters and
//! what [`crate::visualizer`] draws.

use std::collections::BTreeMap;

use clap::ValueEnum;
use ndarray::{Array2, Array4, ArrayD};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{OpenSetError, Result};
use crate::nn::{Conv2d, Linear, MaxPool2d, Module, PRelu, Param};

/// Input side length expected by the network.
pub const INPUT_SIZE: usize = 28;

/// Dimension of the embedding produced by `fc1`.
pub const FEATURE_DIM: usize = 2;

const KERNEL: usize = 5;
const PADDING: usize = 2;

/// Available network architectures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelKind {
    /// Three stages of two convolutions each (32, 64, 128 channels).
    Cnn,
    /// Three stages of one convolution each (8, 16, 32 channels).
    CnnMini,
}

impl ModelKind {
    /// Output channels of each stage.
    #[must_use]
    pub const fn widths(self) -> [usize; 3] {
        match self {
            Self::Cnn => [32, 64, 128],
            Self::CnnMini => [8, 16, 32],
        }
    }

    /// Convolutions per stage.
    #[must_use]
    pub const fn convs_per_stage(self) -> usize {
        match self {
            Self::Cnn => 2,
            Self::CnnMini => 1,
        }
    }

    /// Name as accepted on the command line.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Cnn => "cnn",
            Self::CnnMini => "cnn-mini",
        }
    }
}

#[derive(Debug, Clone)]
struct Stage {
    convs: Vec<(Conv2d, PRelu)>,
    pool: MaxPool2d,
}

impl Stage {
    fn forward(&mut self, mut x: Array4<f32>) -> Result<Array4<f32>> {
        for (conv, act) in &mut self.convs {
            let y = conv.forward(&x)?;
            x = to_4d(act.forward(y.into_dyn()))?;
        }
        Ok(self.pool.forward(&x))
    }

    fn backward(&mut self, grad: &Array4<f32>) -> Result<Array4<f32>> {
        let mut g = self.pool.backward(grad)?;
        for (conv, act) in self.convs.iter_mut().rev() {
            let ga = to_4d(act.backward(&g.into_dyn())?)?;
            g = conv.backward(&ga)?;
        }
        Ok(g)
    }
}

fn to_4d(x: ArrayD<f32>) -> Result<Array4<f32>> {
    x.into_dimensionality()
        .map_err(|e| OpenSetError::ModelError(e.to_string()))
}

fn to_2d(x: ArrayD<f32>) -> Result<Array2<f32>> {
    x.into_dimensionality()
        .map_err(|e| OpenSetError::ModelError(e.to_string()))
}

/// Convolutional network returning `(features, logits)`.
#[derive(Debug, Clone)]
pub struct ConvNet {
    kind: ModelKind,
    num_classes: usize,
    stages: Vec<Stage>,
    fc1: Linear,
    prelu_fc1: PRelu,
    fc2: Linear,
    flat_shape: Option<(usize, usize, usize, usize)>,
}

impl ConvNet {
    /// Build a freshly initialised network.
    ///
    /// # Errors
    ///
    /// Returns an error if `num_classes` is zero.
    pub fn new<R: Rng + ?Sized>(kind: ModelKind, num_classes: usize, rng: &mut R) -> Result<Self> {
        if num_classes == 0 {
            return Err(OpenSetError::ModelError(
                "num_classes must be at least 1".to_string(),
            ));
        }
        let mut stages = Vec::with_capacity(3);
        let mut in_channels = 1;
        let mut side = INPUT_SIZE;
        for width in kind.widths() {
            let convs = (0..kind.convs_per_stage())
                .map(|i| {
                    let c_in = if i == 0 { in_channels } else { width };
                    (Conv2d::new(c_in, width, KERNEL, PADDING, rng), PRelu::new())
                })
                .collect();
            stages.push(Stage {
                convs,
                pool: MaxPool2d::new(),
            });
            in_channels = width;
            side /= 2;
        }
        let flat = in_channels * side * side;
        Ok(Self {
            kind,
            num_classes,
            stages,
            fc1: Linear::new(flat, FEATURE_DIM, rng),
            prelu_fc1: PRelu::new(),
            fc2: Linear::new(FEATURE_DIM, num_classes, rng),
            flat_shape: None,
        })
    }

    /// Architecture of this network.
    #[must_use]
    pub const fn kind(&self) -> ModelKind {
        self.kind
    }

    /// Number of output classes.
    #[must_use]
    pub const fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Forward pass on `(N, 1, 28, 28)`; returns `(features (N, 2), logits (N, K))`.
    ///
    /// # Errors
    ///
    /// Returns an error if the input has the wrong shape.
    pub fn forward(&mut self, x: &Array4<f32>) -> Result<(Array2<f32>, Array2<f32>)> {
        let (_, c, h, w) = x.dim();
        if c != 1 || h != INPUT_SIZE || w != INPUT_SIZE {
            return Err(OpenSetError::ModelError(format!(
                "expected input (N, 1, {INPUT_SIZE}, {INPUT_SIZE}), got {:?}",
                x.dim()
            )));
        }
        let mut out = x.clone();
        for stage in &mut self.stages {
            out = stage.forward(out)?;
        }
        let (n, c, hh, ww) = out.dim();
        self.flat_shape = Some((n, c, hh, ww));
        let flat = Array2::from_shape_fn((n, c * hh * ww), |(i, j)| {
            out[[i, j / (hh * ww), (j / ww) % hh, j % ww]]
        });
        let features = to_2d(self.prelu_fc1.forward(self.fc1.forward(flat)?.into_dyn()))?;
        let logits = self.fc2.forward(features.clone())?;
        Ok((features, logits))
    }

    /// Backpropagate gradients of the loss with respect to the logits and,
    /// optionally, directly with respect to the features.
    ///
    /// # Errors
    ///
    /// Returns an error if called before `forward` or with mismatched shapes.
    pub fn backward(
        &mut self,
        grad_logits: &Array2<f32>,
        grad_features: Option<&Array2<f32>>,
    ) -> Result<()> {
        let mut g_feat = self.fc2.backward(grad_logits)?;
        if let Some(extra) = grad_features {
            if extra.dim() != g_feat.dim() {
                return Err(OpenSetError::ModelError(format!(
                    "feature gradient shape {:?} does not match {:?}",
                    extra.dim(),
                    g_feat.dim()
                )));
            }
            g_feat += extra;
        }
        let g_fc1 = to_2d(self.prelu_fc1.backward(&g_feat.into_dyn())?)?;
        let g_flat = self.fc1.backward(&g_fc1)?;
        let (n, c, hh, ww) = self
            .flat_shape
            .ok_or_else(|| OpenSetError::ModelError("backward before forward".into()))?;
        let mut g = Array4::from_shape_fn((n, c, hh, ww), |(i, ch, y, x)| {
            g_flat[[i, (ch * hh + y) * ww + x]]
        });
        for stage in self.stages.iter_mut().rev() {
            g = stage.backward(&g)?;
        }
        Ok(())
    }

    /// Parameter values keyed by name.
    #[must_use]
    pub fn state_dict(&self) -> BTreeMap<String, ArrayD<f32>> {
        self.named_params()
            .into_iter()
            .map(|(name, p)| (name, p.value.clone()))
            .collect()
    }

    /// Overwrite parameters from a state dict.
    ///
    /// Every parameter must be present with a matching shape; extra keys are rejected.
    ///
    /// # Errors
    ///
    /// Returns an error for missing, unexpected, or mis-shaped entries.
    pub fn load_state_dict(&mut self, state: &BTreeMap<String, ArrayD<f32>>) -> Result<()> {
        let names: Vec<String> = self.named_params().into_iter().map(|(n, _)| n).collect();
        if let Some(extra) = state.keys().find(|k| !names.contains(k)) {
            return Err(OpenSetError::CheckpointError(format!(
                "unexpected parameter {extra}"
            )));
        }
        for (name, param) in names.iter().zip(self.params_mut()) {
            let value = state
                .get(name)
                .ok_or_else(|| OpenSetError::CheckpointError(format!("missing parameter {name}")))?;
            param
                .assign(value.clone())
                .map_err(|e| OpenSetError::CheckpointError(format!("{name}: {e}")))?;
        }
        Ok(())
    }
}

impl Module for ConvNet {
    fn named_params(&self) -> Vec<(String, &Param)> {
        let mut out = Vec::new();
        for (s, stage) in self.stages.iter().enumerate() {
            for (i, (conv, act)) in stage.convs.iter().enumerate() {
                let prefix = format!("conv{}_{}", s + 1, i + 1);
                out.push((format!("{prefix}.weight"), &conv.weight));
                out.push((format!("{prefix}.bias"), &conv.bias));
                out.push((format!("prelu{}_{}.weight", s + 1, i + 1), &act.weight));
            }
        }
        out.push(("fc1.weight".to_string(), &self.fc1.weight));
        out.push(("fc1.bias".to_string(), &self.fc1.bias));
        out.push(("prelu_fc1.weight".to_string(), &self.prelu_fc1.weight));
        out.push(("fc2.weight".to_string(), &self.fc2.weight));
        out.push(("fc2.bias".to_string(), &self.fc2.bias));
        out
    }

    fn params_mut(&mut self) -> Vec<&mut Param> {
        let mut out = Vec::new();
        for stage in &mut self.stages {
            for (conv, act) in &mut stage.convs {
                out.push(&mut conv.weight);
                out.push(&mut conv.bias);
                out.push(&mut act.weight);
            }
        }
        out.push(&mut self.fc1.weight);
        out.push(&mut self.fc1.bias);
        out.push(&mut self.prelu_fc1.weight);
        out.push(&mut self.fc2.weight);
        out.push(&mut self.fc2.bias);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn mini(num_classes: usize) -> ConvNet {
        let mut rng = StdRng::seed_from_u64(7);
        ConvNet::new(ModelKind::CnnMini, num_classes, &mut rng).unwrap()
    }

    #[test]
    fn test_forward_shapes() {
        let mut net = mini(7);
        let x = Array4::from_shape_fn((3, 1, 28, 28), |(n, _, y, x)| ((n + y * x) as f32).sin());
        let (features, logits) = net.forward(&x).unwrap();
        assert_eq!(features.dim(), (3, FEATURE_DIM));
        assert_eq!(logits.dim(), (3, 7));
        assert!(logits.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_forward_rejects_bad_input() {
        let mut net = mini(7);
        assert!(net.forward(&Array4::zeros((1, 1, 14, 14))).is_err());
        assert!(net.forward(&Array4::zeros((1, 3, 28, 28))).is_err());
    }

    #[test]
    fn test_backward_fills_every_gradient_shape() {
        let mut net = mini(4);
        let x = Array4::from_shape_fn((2, 1, 28, 28), |(n, _, y, x)| {
            ((n * 13 + y * 3 + x) as f32 * 0.1).cos()
        });
        let (features, logits) = net.forward(&x).unwrap();
        let g_logits = Array2::from_elem(logits.dim(), 0.5);
        let g_features = Array2::from_elem(features.dim(), 0.1);
        net.backward(&g_logits, Some(&g_features)).unwrap();
        for (name, p) in net.named_params() {
            assert_eq!(p.grad.shape(), p.value.shape(), "{name}");
        }
        assert!(net.fc2.bias.grad.iter().all(|&g| (g - 1.0).abs() < 1e-6));
        assert!(net.backward(&Array2::zeros((2, 3)), None).is_err());
    }

    #[test]
    fn test_state_dict_roundtrip_and_validation() {
        let src = mini(7);
        let mut dst = {
            let mut rng = StdRng::seed_from_u64(99);
            ConvNet::new(ModelKind::CnnMini, 7, &mut rng).unwrap()
        };
        let state = src.state_dict();
        assert!(state.contains_key("conv3_1.weight"));
        assert!(state.contains_key("prelu_fc1.weight"));
        dst.load_state_dict(&state).unwrap();
        assert_eq!(dst.state_dict(), state);

        let mut missing = state.clone();
        missing.remove("fc2.bias");
        assert!(dst.load_state_dict(&missing).is_err());

        let mut wrong = state.clone();
        wrong.insert("fc2.bias".to_string(), ArrayD::zeros(IxDyn(&[3])));
        assert!(dst.load_state_dict(&wrong).is_err());

        let mut extra = state;
        extra.insert("bogus".to_string(), ArrayD::zeros(IxDyn(&[1])));
        assert!(dst.load_state_dict(&extra).is_err());
    }

    #[test]
    fn test_full_cnn_layout() {
        let mut rng = StdRng::seed_from_u64(0);
        let net = ConvNet::new(ModelKind::Cnn, 10, &mut rng).unwrap();
        let state = net.state_dict();
        assert_eq!(state["conv1_2.weight"].shape(), &[32, 32, 5, 5]);
        assert_eq!(state["fc1.weight"].shape(), &[2, 128 * 3 * 3]);
        assert_eq!(state["fc2.weight"].shape(), &[10, 2]);
        assert!(ConvNet::new(ModelKind::Cnn, 0, &mut rng).is_err());
    }
}

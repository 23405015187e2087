// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! Stochastic gradient descent and step learning-rate decay.

use ndarray::ArrayD;

use crate::nn::Param;

/// SGD with optional heavy-ball momentum and L2 weight decay.
///
/// The update is `d = g + wd * p`, `buf = m * buf + d` (`buf = d` on the first
/// step), `p -= lr * buf`.
#[derive(Debug, Clone)]
pub struct Sgd {
    /// Current learning rate.
    pub lr: f32,
    momentum: f32,
    weight_decay: f32,
    buffers: Vec<Option<ArrayD<f32>>>,
}

impl Sgd {
    /// Plain SGD.
    #[must_use]
    pub const fn new(lr: f32) -> Self {
        Self {
            lr,
            momentum: 0.0,
            weight_decay: 0.0,
            buffers: Vec::new(),
        }
    }

    /// Set the momentum factor.
    #[must_use]
    pub fn with_momentum(mut self, momentum: f32) -> Self {
        self.momentum = momentum;
        self
    }

    /// Set the L2 weight decay.
    #[must_use]
    pub fn with_weight_decay(mut self, weight_decay: f32) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    /// Apply one update to `params`.
    ///
    /// The parameter list must be passed in the same order on every call, since
    /// momentum buffers are matched by position.
    pub fn step(&mut self, params: Vec<&mut Param>) {
        if self.buffers.len() < params.len() {
            self.buffers.resize(params.len(), None);
        }
        let (lr, momentum, weight_decay) = (self.lr, self.momentum, self.weight_decay);
        for (param, buffer) in params.into_iter().zip(self.buffers.iter_mut()) {
            let mut d = param.grad.clone();
            if weight_decay != 0.0 {
                d.scaled_add(weight_decay, &param.value);
            }
            if momentum != 0.0 {
                if let Some(buf) = buffer.as_mut() {
                    buf.mapv_inplace(|b| b * momentum);
                    *buf += &d;
                    d.assign(&*buf);
                } else {
                    *buffer = Some(d.clone());
                }
            }
            param.value.scaled_add(-lr, &d);
        }
    }
}

/// Multiply the learning rate by `gamma` every `step_size` epochs.
#[derive(Debug, Clone)]
pub struct StepLr {
    base_lr: f32,
    step_size: usize,
    gamma: f32,
    epoch: usize,
}

impl StepLr {
    /// Create a scheduler starting from `optimizer`'s current rate.
    #[must_use]
    pub const fn new(optimizer: &Sgd, step_size: usize, gamma: f32) -> Self {
        Self {
            base_lr: optimizer.lr,
            step_size,
            gamma,
            epoch: 0,
        }
    }

    /// Advance one epoch and update the optimizer's learning rate.
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    pub fn step(&mut self, optimizer: &mut Sgd) {
        self.epoch += 1;
        if self.step_size == 0 {
            return;
        }
        let decays = (self.epoch / self.step_size) as i32;
        optimizer.lr = self.base_lr * self.gamma.powi(decays);
    }
}

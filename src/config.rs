// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! Training configuration.
//!
//! This module defines the [`TrainConfig`] struct, which carries the optimisation
//! hyper-parameters, the logging cadence, and the output locations of a run.

use std::path::PathBuf;

use crate::dataset::{DatasetKind, NUM_CLASSES, NUM_KNOWN_CLASSES};
use crate::error::{OpenSetError, Result};
use crate::model::ModelKind;

/// Configuration for a training run.
///
/// Uses a builder pattern for convenient construction.
///
/// # Example
///
/// ```rust
/// use openset_center::{ModelKind, TrainConfig};
///
/// let config = TrainConfig::new()
///     .with_model(ModelKind::CnnMini)
///     .with_max_epoch(5)
///     .with_lr_model(0.01);
/// assert_eq!(config.num_classes(), 7);
/// ```
#[derive(Debug, Clone)]
pub struct TrainConfig {
    /// Dataset to train on.
    pub dataset: DatasetKind,
    /// Network architecture.
    pub model: ModelKind,
    /// Samples per batch.
    pub batch_size: usize,
    /// Learning rate of the network parameters.
    pub lr_model: f32,
    /// Learning rate of the class centers.
    pub lr_cent: f32,
    /// Weight of the center loss in the total loss.
    pub weight_cent: f32,
    /// Momentum of the network optimizer.
    pub momentum: f32,
    /// L2 weight decay of the network optimizer.
    pub weight_decay: f32,
    /// Number of epochs.
    pub max_epoch: usize,
    /// Epochs between learning-rate decays; `0` disables decay.
    pub stepsize: usize,
    /// Learning-rate decay factor.
    pub gamma: f32,
    /// Evaluate every N epochs; `0` disables evaluation.
    pub eval_freq: usize,
    /// Log every N batches; `0` disables batch logging.
    pub print_freq: usize,
    /// Seed for initialisation and shuffling.
    pub seed: u64,
    /// Plot 2-D features each epoch.
    pub plot: bool,
    /// Train on known classes only.
    pub is_filter: bool,
    /// Directory for plots and the log file.
    pub save_dir: PathBuf,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            dataset: DatasetKind::Mnist,
            model: ModelKind::Cnn,
            batch_size: 128,
            lr_model: 0.001,
            lr_cent: 0.5,
            weight_cent: 1.0,
            momentum: 0.9,
            weight_decay: 5e-4,
            max_epoch: 100,
            stepsize: 20,
            gamma: 0.5,
            eval_freq: 10,
            print_freq: 50,
            seed: 1,
            plot: false,
            is_filter: true,
            save_dir: PathBuf::from("log"),
        }
    }
}

impl TrainConfig {
    /// Create a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of output classes implied by the class filter.
    #[must_use]
    pub const fn num_classes(&self) -> usize {
        if self.is_filter {
            NUM_KNOWN_CLASSES
        } else {
            NUM_CLASSES
        }
    }

    /// Set the network architecture.
    #[must_use]
    pub fn with_model(mut self, model: ModelKind) -> Self {
        self.model = model;
        self
    }

    /// Set the batch size.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the network learning rate.
    #[must_use]
    pub fn with_lr_model(mut self, lr: f32) -> Self {
        self.lr_model = lr;
        self
    }

    /// Set the center learning rate.
    #[must_use]
    pub fn with_lr_cent(mut self, lr: f32) -> Self {
        self.lr_cent = lr;
        self
    }

    /// Set the center loss weight.
    #[must_use]
    pub fn with_weight_cent(mut self, weight: f32) -> Self {
        self.weight_cent = weight;
        self
    }

    /// Set the number of epochs.
    #[must_use]
    pub fn with_max_epoch(mut self, epochs: usize) -> Self {
        self.max_epoch = epochs;
        self
    }

    /// Set the step decay schedule.
    #[must_use]
    pub fn with_schedule(mut self, stepsize: usize, gamma: f32) -> Self {
        self.stepsize = stepsize;
        self.gamma = gamma;
        self
    }

    /// Set evaluation and logging cadence.
    #[must_use]
    pub fn with_frequencies(mut self, eval_freq: usize, print_freq: usize) -> Self {
        self.eval_freq = eval_freq;
        self.print_freq = print_freq;
        self
    }

    /// Set the random seed.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Enable or disable per-epoch feature plots.
    #[must_use]
    pub fn with_plot(mut self, plot: bool) -> Self {
        self.plot = plot;
        self
    }

    /// Train on known classes only (`true`) or on all ten digits.
    #[must_use]
    pub fn with_filter(mut self, is_filter: bool) -> Self {
        self.is_filter = is_filter;
        self
    }

    /// Set the output directory.
    #[must_use]
    pub fn with_save_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.save_dir = dir.into();
        self
    }

    /// Check that the values make sense before a run starts.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(OpenSetError::ConfigError("batch_size must be > 0".into()));
        }
        if self.max_epoch == 0 {
            return Err(OpenSetError::ConfigError("max_epoch must be > 0".into()));
        }
        for (name, value) in [
            ("lr_model", self.lr_model),
            ("lr_cent", self.lr_cent),
            ("weight_cent", self.weight_cent),
            ("gamma", self.gamma),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(OpenSetError::ConfigError(format!(
                    "{name} must be a non-negative number, got {value}"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TrainConfig::default();
        assert_eq!(config.batch_size, 128);
        assert_eq!(config.num_classes(), 7);
        assert!((config.weight_decay - 5e-4).abs() < f32::EPSILON);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = TrainConfig::new()
            .with_filter(false)
            .with_schedule(0, 0.1)
            .with_save_dir("runs/x");
        assert_eq!(config.num_classes(), 10);
        assert_eq!(config.stepsize, 0);
        assert_eq!(config.save_dir, PathBuf::from("runs/x"));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(TrainConfig::new().with_batch_size(0).validate().is_err());
        assert!(TrainConfig::new().with_max_epoch(0).validate().is_err());
        assert!(TrainConfig::new().with_lr_model(f32::NAN).validate().is_err());
        assert!(TrainConfig::new().with_weight_cent(-1.0).validate().is_err());
    }
}

// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! Joint cross-entropy and center-loss training.

use std::time::Instant;

use ndarray::Array2;
use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::config::TrainConfig;
use crate::dataset::DataLoader;
use crate::error::{OpenSetError, Result};
use crate::loss::{CenterLoss, cross_entropy};
use crate::model::{ConvNet, FEATURE_DIM};
use crate::nn::Module;
use crate::optim::{Sgd, StepLr};
use crate::utils::format_hms;
use crate::visualizer::plot_features;
use crate::{info, section, verbose, warn};

/// Running value and weighted average.
#[derive(Debug, Clone, Copy, Default)]
pub struct AverageMeter {
    /// Most recent value.
    pub val: f32,
    /// Weighted average of all values.
    pub avg: f32,
    /// Weighted sum of all values.
    pub sum: f32,
    /// Total weight.
    pub count: usize,
}

impl AverageMeter {
    /// Record `val` observed over `n` samples.
    #[allow(clippy::cast_precision_loss)]
    pub fn update(&mut self, val: f32, n: usize) {
        self.val = val;
        self.sum += val * n as f32;
        self.count += n;
        if self.count > 0 {
            self.avg = self.sum / self.count as f32;
        }
    }
}

/// Loss averages over one epoch.
#[derive(Debug, Clone, Copy, Default)]
pub struct EpochLosses {
    /// Total loss.
    pub loss: AverageMeter,
    /// Cross-entropy term.
    pub xent: AverageMeter,
    /// Weighted center-loss term.
    pub cent: AverageMeter,
}

/// Classification accuracy over a loader.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    /// Percentage of correct predictions.
    pub accuracy: f32,
    /// `100 - accuracy`.
    pub error: f32,
    /// Number of evaluated samples.
    pub total: usize,
}

/// Features and labels gathered during a pass, used for plotting.
#[derive(Debug, Default)]
struct FeatureLog {
    rows: Vec<[f32; FEATURE_DIM]>,
    labels: Vec<usize>,
}

impl FeatureLog {
    fn extend(&mut self, features: &Array2<f32>, labels: &[usize]) {
        for row in features.rows() {
            self.rows.push([row[0], row[1]]);
        }
        self.labels.extend_from_slice(labels);
    }

    fn to_array(&self) -> Array2<f32> {
        Array2::from_shape_fn((self.rows.len(), FEATURE_DIM), |(i, j)| self.rows[i][j])
    }
}

/// Owns the network, the center-loss criterion, and both optimizers.
#[derive(Debug)]
pub struct Trainer {
    config: TrainConfig,
    model: ConvNet,
    center_loss: CenterLoss,
    optimizer_model: Sgd,
    optimizer_centloss: Sgd,
    scheduler: Option<StepLr>,
}

impl Trainer {
    /// Build a fresh model and criterion from `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: TrainConfig) -> Result<Self> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(config.seed);
        let model = ConvNet::new(config.model, config.num_classes(), &mut rng)?;
        let center_loss = CenterLoss::new(config.num_classes(), FEATURE_DIM, &mut rng);
        Ok(Self::with_parts(config, model, center_loss))
    }

    /// Resume from an existing model and criterion.
    #[must_use]
    pub fn with_parts(config: TrainConfig, model: ConvNet, center_loss: CenterLoss) -> Self {
        let optimizer_model = Sgd::new(config.lr_model)
            .with_momentum(config.momentum)
            .with_weight_decay(config.weight_decay);
        let optimizer_centloss = Sgd::new(config.lr_cent);
        let scheduler =
            (config.stepsize > 0).then(|| StepLr::new(&optimizer_model, config.stepsize, config.gamma));
        Self {
            config,
            model,
            center_loss,
            optimizer_model,
            optimizer_centloss,
            scheduler,
        }
    }

    /// Network being trained.
    #[must_use]
    pub const fn model(&self) -> &ConvNet {
        &self.model
    }

    /// Center-loss criterion holding the learned centers.
    #[must_use]
    pub const fn center_loss(&self) -> &CenterLoss {
        &self.center_loss
    }

    /// Current learning rate of the network optimizer.
    #[must_use]
    pub const fn lr(&self) -> f32 {
        self.optimizer_model.lr
    }

    /// Consume the trainer, returning the network and criterion.
    #[must_use]
    pub fn into_parts(self) -> (ConvNet, CenterLoss) {
        (self.model, self.center_loss)
    }

    /// Run one epoch of training. `epoch` is zero-based.
    ///
    /// # Errors
    ///
    /// Returns an error if a forward or backward pass fails.
    pub fn train_epoch(&mut self, loader: &mut DataLoader<'_>, epoch: usize) -> Result<EpochLosses> {
        let mut losses = EpochLosses::default();
        let mut log = self.config.plot.then(FeatureLog::default);
        let num_batches = loader.num_batches();
        let weight = self.config.weight_cent;

        for (batch_idx, batch) in loader.epoch().enumerate() {
            if batch.is_empty() {
                continue;
            }
            let (features, logits) = self.model.forward(&batch.images)?;
            let (loss_xent, grad_logits) = cross_entropy(&logits, &batch.labels)?;

            self.model.zero_grad();
            self.center_loss.zero_grad();
            let cent = self.center_loss.forward(&features, &batch.labels)?;
            let loss_cent = cent.loss * weight;
            // Only the feature path is weighted; center updates use the raw gradient
            let grad_features = cent.grad_features * weight;
            let loss = loss_xent + loss_cent;
            if !loss.is_finite() {
                return Err(OpenSetError::ModelError(format!(
                    "loss diverged at epoch {} batch {}",
                    epoch + 1,
                    batch_idx + 1
                )));
            }

            self.model.backward(&grad_logits, Some(&grad_features))?;
            self.optimizer_model.step(self.model.params_mut());
            self.optimizer_centloss.step(self.center_loss.params_mut());

            let n = batch.len();
            losses.loss.update(loss, n);
            losses.xent.update(loss_xent, n);
            losses.cent.update(loss_cent, n);

            if let Some(log) = log.as_mut() {
                log.extend(&features, &batch.labels);
            }

            if self.config.print_freq > 0 && (batch_idx + 1) % self.config.print_freq == 0 {
                info!(
                    "Batch {}/{}\t Loss {:.6} ({:.6}) XentLoss {:.6} ({:.6}) CenterLoss {:.6} ({:.6})",
                    batch_idx + 1,
                    num_batches,
                    losses.loss.val,
                    losses.loss.avg,
                    losses.xent.val,
                    losses.xent.avg,
                    losses.cent.val,
                    losses.cent.avg
                );
            }
        }

        if let Some(log) = log {
            self.save_plot(&log, epoch, "train");
        }
        Ok(losses)
    }

    /// Measure accuracy over `loader`. `epoch` is used for plot file names.
    ///
    /// # Errors
    ///
    /// Returns an error if a forward pass fails.
    #[allow(clippy::cast_precision_loss)]
    pub fn evaluate(&mut self, loader: &mut DataLoader<'_>, epoch: usize) -> Result<Evaluation> {
        let mut log = self.config.plot.then(FeatureLog::default);
        let mut correct = 0usize;
        let mut total = 0usize;
        for batch in loader.epoch() {
            let (features, logits) = self.model.forward(&batch.images)?;
            for (row, &label) in logits.rows().into_iter().zip(&batch.labels) {
                let values: Vec<f32> = row.iter().copied().collect();
                if crate::utils::argmax(&values).is_some_and(|(pred, _)| pred == label) {
                    correct += 1;
                }
            }
            total += batch.len();
            if let Some(log) = log.as_mut() {
                log.extend(&features, &batch.labels);
            }
        }
        if let Some(log) = log {
            self.save_plot(&log, epoch, "test");
        }
        let accuracy = if total == 0 {
            0.0
        } else {
            correct as f32 * 100.0 / total as f32
        };
        Ok(Evaluation {
            accuracy,
            error: 100.0 - accuracy,
            total,
        })
    }

    fn save_plot(&self, log: &FeatureLog, epoch: usize, prefix: &str) {
        let features = log.to_array();
        match plot_features(
            &features,
            &log.labels,
            self.config.num_classes(),
            epoch,
            prefix,
            &self.config.save_dir,
        ) {
            Ok(path) => verbose!("Saved {} plot to {}", prefix, path.display()),
            Err(e) => warn!("Failed to plot {prefix} features: {e}"),
        }
    }

    /// Train for `max_epoch` epochs, evaluating on `test` every `eval_freq`
    /// epochs and after the last one.
    ///
    /// Returns the last evaluation, if any was run.
    ///
    /// # Errors
    ///
    /// Returns an error if training or evaluation fails.
    pub fn fit(
        &mut self,
        train: &mut DataLoader<'_>,
        test: &mut DataLoader<'_>,
    ) -> Result<Option<Evaluation>> {
        let start = Instant::now();
        let max_epoch = self.config.max_epoch;
        let eval_freq = self.config.eval_freq;
        let mut last_eval = None;

        for epoch in 0..max_epoch {
            section!("==> Epoch {}/{}", epoch + 1, max_epoch);
            let losses = self.train_epoch(train, epoch)?;
            verbose!(
                "Epoch {} done: Loss {:.6} XentLoss {:.6} CenterLoss {:.6} lr {:.6}",
                epoch + 1,
                losses.loss.avg,
                losses.xent.avg,
                losses.cent.avg,
                self.optimizer_model.lr
            );
            if let Some(scheduler) = self.scheduler.as_mut() {
                scheduler.step(&mut self.optimizer_model);
            }

            if eval_freq > 0 && ((epoch + 1) % eval_freq == 0 || epoch + 1 == max_epoch) {
                info!("==> Test");
                let eval = self.evaluate(test, epoch)?;
                info!("Accuracy (%): {:.2}\t Error rate (%): {:.2}", eval.accuracy, eval.error);
                last_eval = Some(eval);
            }
        }

        info!(
            "Finished. Total elapsed time (h:m:s): {}",
            format_hms(start.elapsed().as_secs())
        );
        Ok(last_eval)
    }
}

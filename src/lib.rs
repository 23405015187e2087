// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

#![allow(clippy::multiple_crate_versions)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # Open-Set Center Loss
//!
//! Train a small convolutional MNIST classifier with a joint cross-entropy and
//! center-loss objective, then measure how its logits behave on digits it was
//! never trained on.
//!
//! Digits `0..=6` are the *known* classes and `7..=9` are *unknown*. After
//! training on known digits, the analysis pass records, for every sample, the
//! maximum logit (`S`) and the mean logit (`M`) under the predicted class.
//!
//! ## CLI Usage
//!
//! ```bash
//! # Train on known digits and save a checkpoint
//! openset-center train --model cnn-mini --max-epoch 10 --plot
//!
//! # Collect statistics for known and unknown digits
//! openset-center analyze --output pkl/center_result_mini.json
//! ```
//!
//! ## Library Usage
//!
//! ```no_run
//! use openset_center::{DataLoader, MnistSet, ModelKind, TrainConfig, Trainer};
//!
//! fn main() -> openset_center::Result<()> {
//!     let train = MnistSet::load("./data/mnist", true)?;
//!     let test = MnistSet::load("./data/mnist", false)?;
//!     let mut train_loader = DataLoader::full(&train, 128, true, 1)?;
//!     let mut test_loader = DataLoader::full(&test, 128, false, 1)?;
//!
//!     let config = TrainConfig::new()
//!         .with_model(ModelKind::CnnMini)
//!         .with_filter(false)
//!         .with_max_epoch(5);
//!     let mut trainer = Trainer::new(config)?;
//!     trainer.fit(&mut train_loader, &mut test_loader)?;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Overview
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`dataset`] | IDX parsing, the known/unknown split, and [`DataLoader`] |
//! | [`nn`] | Layers with explicit forward and backward passes |
//! | [`model`] | The [`ConvNet`] classifier with a 2-D embedding |
//! | [`loss`] | Cross-entropy and [`CenterLoss`] |
//! | [`optim`] | SGD with momentum and a step learning-rate schedule |
//! | [`train`] | The [`Trainer`] loop |
//! | [`analysis`] | Open-set logit statistics ([`AnalysisResult`]) |
//! | [`checkpoint`] | JSON model checkpoints |
//! | [`visualizer`] | Feature scatter plots |

// Modules
pub mod analysis;
pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod dataset;
pub mod device;
pub mod download;
pub mod error;
pub mod loss;
pub mod model;
pub mod nn;
pub mod optim;
pub mod train;
pub mod utils;
pub mod visualizer;

// Re-export main types for convenience
pub use analysis::{AnalysisResult, ClassBuckets, SubsetStatistics, analyze};
pub use checkpoint::Checkpoint;
pub use config::TrainConfig;
pub use dataset::{Batch, DataLoader, DatasetKind, MnistSet, split_known_unknown};
pub use device::Device;
pub use error::{OpenSetError, Result};
pub use loss::{CenterLoss, cross_entropy};
pub use model::{ConvNet, ModelKind};
pub use train::{AverageMeter, Evaluation, Trainer};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name.
pub const NAME: &str = env!("CARGO_PKG_NAME");

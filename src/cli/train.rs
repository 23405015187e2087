// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

use std::path::PathBuf;

use crate::checkpoint::Checkpoint;
use crate::cli::args::{CommonArgs, TrainArgs};
use crate::cli::logging;
use crate::config::TrainConfig;
use crate::dataset::{DataLoader, MnistSet, NUM_KNOWN_CLASSES, split_known_unknown};
use crate::device::Device;
use crate::error::{OpenSetError, Result};
use crate::train::Trainer;
use crate::{info, section, success, verbose, warn};

/// Apply the options every command shares: verbosity, log file, and device.
///
/// # Errors
///
/// Returns an error if the log file cannot be created or the device string is invalid.
pub fn setup(common: &CommonArgs) -> Result<Device> {
    logging::set_verbose(common.verbose);
    let log_path = common
        .save_dir
        .join(format!("log_{}.txt", common.dataset.name()));
    logging::init_log_file(&log_path).map_err(|e| {
        OpenSetError::IoError(format!("Failed to create {}: {e}", log_path.display()))
    })?;

    let requested = common
        .device
        .as_deref()
        .map(str::parse::<Device>)
        .transpose()
        .map_err(OpenSetError::ConfigError)?;
    let (device, fell_back) = Device::resolve(requested, common.use_cpu);
    if fell_back {
        warn!("CUDA is not available in this build, falling back to CPU");
    }
    info!("Currently using {}", device.to_string().to_uppercase());
    verbose!("Logging to {}", log_path.display());
    Ok(device)
}

/// Build a [`TrainConfig`] from command-line arguments.
#[must_use]
pub fn config_from_args(args: &TrainArgs) -> TrainConfig {
    let mut config = TrainConfig::new()
        .with_model(args.model)
        .with_batch_size(args.common.batch_size)
        .with_lr_model(args.lr_model)
        .with_lr_cent(args.lr_cent)
        .with_weight_cent(args.weight_cent)
        .with_max_epoch(args.max_epoch)
        .with_schedule(args.stepsize, args.gamma)
        .with_frequencies(args.eval_freq, args.print_freq)
        .with_seed(args.common.seed)
        .with_plot(args.plot)
        .with_filter(args.is_filter)
        .with_save_dir(args.common.save_dir.clone());
    config.dataset = args.common.dataset;
    config
}

/// Indices used for training or evaluation: known digits only when filtering.
fn select(set: &MnistSet, is_filter: bool) -> Vec<usize> {
    if is_filter {
        split_known_unknown(set.labels(), NUM_KNOWN_CLASSES).0
    } else {
        (0..set.len()).collect()
    }
}

/// Train the classifier and write its checkpoint.
///
/// # Errors
///
/// Returns an error if the dataset cannot be prepared, training fails, or the
/// checkpoint cannot be written.
pub fn run_training(args: &TrainArgs) -> Result<PathBuf> {
    setup(&args.common)?;
    let config = config_from_args(args);
    config.validate()?;

    section!("Creating dataset: {}", config.dataset.name());
    let train_set = MnistSet::load(&args.common.data_dir, true)?;
    let test_set = MnistSet::load(&args.common.data_dir, false)?;
    let train_indices = select(&train_set, config.is_filter);
    let test_indices = select(&test_set, config.is_filter);
    info!(
        "Train on {} samples, test on {} samples",
        train_indices.len(),
        test_indices.len()
    );
    let mut train_loader = DataLoader::new(
        &train_set,
        train_indices,
        config.batch_size,
        true,
        config.seed,
    )?;
    let mut test_loader =
        DataLoader::new(&test_set, test_indices, config.batch_size, false, config.seed)?;

    section!("Creating model: {}", config.model.name());
    let mut trainer = Trainer::new(config)?;
    if let Some(eval) = trainer.fit(&mut train_loader, &mut test_loader)? {
        info!(
            "Final accuracy (%): {:.2}\t Error rate (%): {:.2}",
            eval.accuracy, eval.error
        );
    }

    let (model, center_loss) = trainer.into_parts();
    let checkpoint = Checkpoint::from_model(&model, Some(center_loss.centers()?));
    checkpoint.save(&args.common.checkpoint)?;
    success!("Saved checkpoint to {}", args.common.checkpoint.display());
    Ok(args.common.checkpoint.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::args::{Cli, Commands};
    use crate::model::ModelKind;
    use clap::Parser;

    #[test]
    fn test_config_from_args() {
        let cli = Cli::parse_from([
            "app",
            "train",
            "--model",
            "cnn-mini",
            "--batch-size",
            "32",
            "--stepsize",
            "0",
            "--is-filter",
            "false",
            "--save-dir",
            "runs/a",
        ]);
        let Commands::Train(args) = cli.command else {
            panic!("expected train");
        };
        let config = config_from_args(&args);
        assert_eq!(config.model, ModelKind::CnnMini);
        assert_eq!(config.batch_size, 32);
        assert_eq!(config.stepsize, 0);
        assert_eq!(config.num_classes(), 10);
        assert_eq!(config.save_dir, PathBuf::from("runs/a"));
    }

    #[test]
    fn test_select_filters_known_digits() {
        let images = vec![0u8; 10 * 4];
        let labels: Vec<u8> = (0..10).collect();
        let set = MnistSet::from_raw(images, labels, 2, 2).unwrap();
        assert_eq!(select(&set, true), (0..7).collect::<Vec<_>>());
        assert_eq!(select(&set, false).len(), 10);
    }
}

// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::dataset::DatasetKind;
use crate::model::ModelKind;

/// Default checkpoint written by `train` and read by `analyze`.
pub const DEFAULT_CHECKPOINT: &str = "save_model/center_mnist7_baseline_mini.json";

/// Default analysis artifact.
pub const DEFAULT_OUTPUT: &str = "pkl/center_result_mini.json";

/// CLI arguments parser.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[command(after_help = r#"Examples:
    openset-center train --model cnn-mini --max-epoch 10 --plot
    openset-center train --is-filter false --lr-model 0.01 --stepsize 0
    openset-center analyze --checkpoint save_model/center_mnist7_baseline_mini.json
    openset-center analyze --output results/openset.json --batch-size 256"#)]
pub struct Cli {
    #[command(subcommand)]
    /// Subcommand to execute.
    pub command: Commands,
}

/// Commands for the CLI.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Train the classifier with cross-entropy plus center loss
    Train(TrainArgs),
    /// Collect per-class max/mean logit statistics on known and unknown digits
    Analyze(AnalyzeArgs),
}

/// Arguments shared by every command.
#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    /// Dataset to use
    #[arg(short, long, value_enum, default_value_t = DatasetKind::Mnist)]
    pub dataset: DatasetKind,

    /// Directory holding (or receiving) the dataset files
    #[arg(long, default_value = "./data/mnist")]
    pub data_dir: PathBuf,

    /// Batch size
    #[arg(long, default_value_t = 128)]
    pub batch_size: usize,

    /// Device to use (cpu, cuda:0)
    #[arg(long)]
    pub device: Option<String>,

    /// Force CPU execution
    #[arg(long, default_value_t = false)]
    pub use_cpu: bool,

    /// Random seed for initialisation and shuffling
    #[arg(long, default_value_t = 1)]
    pub seed: u64,

    /// Directory for the log file and plots
    #[arg(long, default_value = "log")]
    pub save_dir: PathBuf,

    /// Model checkpoint path
    #[arg(long, default_value = DEFAULT_CHECKPOINT)]
    pub checkpoint: PathBuf,

    /// Show verbose output
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub verbose: bool,
}

/// Arguments for the train command.
#[derive(Args, Debug)]
pub struct TrainArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Learning rate for the model
    #[arg(long, default_value_t = 0.001)]
    pub lr_model: f32,

    /// Learning rate for the class centers
    #[arg(long, default_value_t = 0.5)]
    pub lr_cent: f32,

    /// Weight of the center loss term
    #[arg(long, default_value_t = 1.0)]
    pub weight_cent: f32,

    /// Number of training epochs
    #[arg(long, default_value_t = 100)]
    pub max_epoch: usize,

    /// Epochs between learning-rate decays (0 disables decay)
    #[arg(long, default_value_t = 20)]
    pub stepsize: usize,

    /// Learning rate decay factor
    #[arg(long, default_value_t = 0.5)]
    pub gamma: f32,

    /// Network architecture
    #[arg(long, value_enum, default_value_t = ModelKind::Cnn)]
    pub model: ModelKind,

    /// Evaluate every N epochs (0 disables evaluation)
    #[arg(long, default_value_t = 10)]
    pub eval_freq: usize,

    /// Log every N batches
    #[arg(long, default_value_t = 50)]
    pub print_freq: usize,

    /// Plot 2-D features for every epoch
    #[arg(long, default_value_t = false)]
    pub plot: bool,

    /// Train on known digits only (0-6) instead of all ten
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub is_filter: bool,
}

/// Arguments for the analyze command.
#[derive(Args, Debug)]
pub struct AnalyzeArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Where to write the statistics file
    #[arg(short, long, default_value = DEFAULT_OUTPUT)]
    pub output: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_train_args_defaults() {
        let args = Cli::parse_from(["app", "train"]);
        match args.command {
            Commands::Train(train_args) => {
                assert_eq!(train_args.common.batch_size, 128);
                assert_eq!(train_args.common.seed, 1);
                assert_eq!(train_args.common.dataset, DatasetKind::Mnist);
                assert!((train_args.lr_model - 0.001).abs() < f32::EPSILON);
                assert!((train_args.lr_cent - 0.5).abs() < f32::EPSILON);
                assert!((train_args.weight_cent - 1.0).abs() < f32::EPSILON);
                assert_eq!(train_args.max_epoch, 100);
                assert_eq!(train_args.stepsize, 20);
                assert_eq!(train_args.model, ModelKind::Cnn);
                assert!(train_args.is_filter);
                assert!(!train_args.plot);
                assert!(train_args.common.verbose);
            }
            Commands::Analyze(_) => panic!("expected train"),
        }
    }

    #[test]
    fn test_train_args_custom() {
        let args = Cli::parse_from([
            "app",
            "train",
            "--model",
            "cnn-mini",
            "--is-filter",
            "false",
            "--max-epoch",
            "3",
            "--use-cpu",
            "--plot",
        ]);
        match args.command {
            Commands::Train(train_args) => {
                assert_eq!(train_args.model, ModelKind::CnnMini);
                assert!(!train_args.is_filter);
                assert_eq!(train_args.max_epoch, 3);
                assert!(train_args.common.use_cpu);
                assert!(train_args.plot);
            }
            Commands::Analyze(_) => panic!("expected train"),
        }
    }

    #[test]
    fn test_analyze_args() {
        let args = Cli::parse_from(["app", "analyze", "-o", "out.json", "--batch-size", "64"]);
        match args.command {
            Commands::Analyze(analyze_args) => {
                assert_eq!(analyze_args.output, PathBuf::from("out.json"));
                assert_eq!(analyze_args.common.batch_size, 64);
                assert_eq!(
                    analyze_args.common.checkpoint,
                    PathBuf::from(DEFAULT_CHECKPOINT)
                );
            }
            Commands::Train(_) => panic!("expected analyze"),
        }
    }
}

// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

use std::process;

use clap::Parser;

use openset_center::cli::analyze::run_analysis;
use openset_center::cli::args::{Cli, Commands};
use openset_center::cli::train::run_training;
use openset_center::error;

fn main() {
    let cli = Cli::parse();

    let outcome = match &cli.command {
        Commands::Train(args) => run_training(args),
        Commands::Analyze(args) => run_analysis(args),
    };

    if let Err(e) = outcome {
        error!("{e}");
        process::exit(1);
    }
}

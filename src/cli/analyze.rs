// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

use std::path::PathBuf;
use std::time::Instant;

use crate::analysis::analyze;
use crate::checkpoint::Checkpoint;
use crate::cli::args::AnalyzeArgs;
use crate::cli::train::setup;
use crate::dataset::{DataLoader, MnistSet, NUM_KNOWN_CLASSES, split_known_unknown};
use crate::error::Result;
use crate::utils::format_hms;
use crate::{info, section, success, verbose};

/// Collect max/mean logit statistics on known and unknown training digits.
///
/// # Errors
///
/// Returns an error if the checkpoint or dataset cannot be loaded or the
/// result cannot be written.
pub fn run_analysis(args: &AnalyzeArgs) -> Result<PathBuf> {
    let start = Instant::now();
    setup(&args.common)?;

    section!("Loading checkpoint {}", args.common.checkpoint.display());
    let checkpoint = Checkpoint::load(&args.common.checkpoint)?;
    let mut model = checkpoint.to_model()?;
    verbose!(
        "Model: {} ({} classes)",
        model.kind().name(),
        model.num_classes()
    );

    section!("Creating dataset: {}", args.common.dataset.name());
    let train_set = MnistSet::load(&args.common.data_dir, true)?;
    let (known, unknown) = split_known_unknown(train_set.labels(), NUM_KNOWN_CLASSES);
    info!(
        "Known samples: {}\t Unknown samples: {}",
        known.len(),
        unknown.len()
    );
    let batch_size = args.common.batch_size;
    let seed = args.common.seed;
    let mut known_loader = DataLoader::new(&train_set, known, batch_size, true, seed)?;
    let mut unknown_loader =
        DataLoader::new(&train_set, unknown, batch_size, true, seed.wrapping_add(1))?;

    section!(" === Epoch: [1/1] === ");
    let result = analyze(&mut model, &mut known_loader, &mut unknown_loader)?;
    for line in result.summary() {
        info!("{line}");
    }

    result.save(&args.output)?;
    success!("Saved analysis to {}", args.output.display());
    info!(
        "Finished. Total elapsed time (h:m:s): {}",
        format_hms(start.elapsed().as_secs())
    );
    Ok(args.output.clone())
}

// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! CLI module for training and analysis.
//!
//! This module contains the command-line interface logic, including argument parsing
//! and the `train` and `analyze` command implementations.

// Modules
/// Analysis command.
pub mod analyze;

/// CLI arguments.
pub mod args;

/// Console and log-file output.
pub mod logging;

/// Training command.
pub mod train;

// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! Console logging with an optional plain-text copy written to a log file.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};

/// Global verbosity flag.
static VERBOSE: AtomicBool = AtomicBool::new(true);

/// Log file mirror, set once per process.
static LOG_FILE: OnceLock<Mutex<File>> = OnceLock::new();

/// Set the global verbosity flag.
pub fn set_verbose(verbose: bool) {
    VERBOSE.store(verbose, Ordering::Relaxed);
}

/// Check if verbose output is enabled.
pub fn is_verbose() -> bool {
    VERBOSE.load(Ordering::Relaxed)
}

/// Mirror all subsequent log lines into `path`, creating parent directories.
///
/// The file is truncated. Calling this a second time in the same process is a no-op.
///
/// # Errors
///
/// Returns an error if the directory or file cannot be created.
pub fn init_log_file<P: AsRef<Path>>(path: P) -> std::io::Result<()> {
    let path = path.as_ref();
    if LOG_FILE.get().is_some() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    let _ = LOG_FILE.set(Mutex::new(file));
    Ok(())
}

/// Append an uncolored line to the log file, if one is configured.
pub fn write_to_file(line: &str) {
    if let Some(file) = LOG_FILE.get() {
        if let Ok(mut file) = file.lock() {
            let _ = writeln!(file, "{line}");
        }
    }
}

/// Macro for standard info messages.
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {{
        let line = format!($($arg)*);
        println!("{line}");
        $crate::cli::logging::write_to_file(&line);
    }}
}

/// Macro for warning messages.
#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {{
        use colored::Colorize;
        let line = format!($($arg)*);
        eprintln!("{} {}", "WARNING ⚠️".yellow().bold(), line);
        $crate::cli::logging::write_to_file(&format!("WARNING {line}"));
    }}
}

/// Macro for error messages.
#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {{
        use colored::Colorize;
        let line = format!($($arg)*);
        eprintln!("{} {}", "Error:".red().bold(), line);
        $crate::cli::logging::write_to_file(&format!("Error: {line}"));
    }}
}

/// Macro for success messages.
#[macro_export]
macro_rules! success {
    ($($arg:tt)*) => {{
        use colored::Colorize;
        let line = format!($($arg)*);
        println!("{} {}", "✅".green(), line);
        $crate::cli::logging::write_to_file(&line);
    }}
}

/// Macro for verbose messages.
#[macro_export]
macro_rules! verbose {
    ($($arg:tt)*) => {{
        if $crate::cli::logging::is_verbose() {
            let line = format!($($arg)*);
            println!("{line}");
            $crate::cli::logging::write_to_file(&line);
        }
    }}
}

/// Macro for section headers.
#[macro_export]
macro_rules! section {
    ($($arg:tt)*) => {{
        use colored::Colorize;
        if $crate::cli::logging::is_verbose() {
            let line = format!($($arg)*);
            println!();
            println!("{}", line.cyan().bold());
            $crate::cli::logging::write_to_file(&line);
        }
    }}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbose_toggle() {
        set_verbose(false);
        assert!(!is_verbose());
        set_verbose(true);
        assert!(is_verbose());
    }
}

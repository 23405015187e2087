// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! Error types for the open-set center-loss library.

use std::fmt;

/// Result type alias for library operations.
pub type Result<T> = std::result::Result<T, OpenSetError>;

/// Main error type for the library.
#[derive(Debug)]
pub enum OpenSetError {
    /// Malformed or inconsistent dataset files.
    DatasetError(String),
    /// Failure fetching dataset archives.
    DownloadError(String),
    /// Shape mismatch or invalid model construction.
    ModelError(String),
    /// Checkpoint could not be read, written, or applied.
    CheckpointError(String),
    /// Invalid configuration provided.
    ConfigError(String),
    /// IO error with context (file not found, permission denied, etc.).
    IoError(String),
    /// Wrapped `std::io::Error`
    Io(std::io::Error),
    /// Error rendering or writing plots.
    ImageError(String),
    /// JSON encoding or decoding failure.
    SerializationError(String),
}

impl fmt::Display for OpenSetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DatasetError(msg) => write!(f, "Dataset error: {msg}"),
            Self::DownloadError(msg) => write!(f, "Download error: {msg}"),
            Self::ModelError(msg) => write!(f, "Model error: {msg}"),
            Self::CheckpointError(msg) => write!(f, "Checkpoint error: {msg}"),
            Self::ConfigError(msg) => write!(f, "Config error: {msg}"),
            Self::IoError(msg) => write!(f, "IO error: {msg}"),
            Self::Io(err) => write!(f, "IO error: {err}"),
            Self::ImageError(msg) => write!(f, "Image error: {msg}"),
            Self::SerializationError(msg) => write!(f, "Serialization error: {msg}"),
        }
    }
}

impl std::error::Error for OpenSetError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for OpenSetError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<image::ImageError> for OpenSetError {
    fn from(err: image::ImageError) -> Self {
        Self::ImageError(err.to_string())
    }
}

impl From<serde_json::Error> for OpenSetError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

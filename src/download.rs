// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! Dataset downloading utilities.
//!
//! This module fetches the gzip-compressed MNIST IDX files from public mirrors
//! when they are not found locally and unpacks them next to the archives.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use flate2::read::GzDecoder;

use crate::error::{OpenSetError, Result};
use crate::utils::{format_bytes, format_time, generate_bar};
use crate::{verbose, warn};

/// Mirrors tried in order for every MNIST file.
pub const MNIST_MIRRORS: &[&str] = &[
    "https://ossci-datasets.s3.amazonaws.com/mnist/",
    "http://yann.lecun.com/exdb/mnist/",
];

/// Training images file name (uncompressed).
pub const TRAIN_IMAGES: &str = "train-images-idx3-ubyte";
/// Training labels file name (uncompressed).
pub const TRAIN_LABELS: &str = "train-labels-idx1-ubyte";
/// Test images file name (uncompressed).
pub const TEST_IMAGES: &str = "t10k-images-idx3-ubyte";
/// Test labels file name (uncompressed).
pub const TEST_LABELS: &str = "t10k-labels-idx1-ubyte";

/// All MNIST resources.
pub const MNIST_FILES: [&str; 4] = [TRAIN_IMAGES, TRAIN_LABELS, TEST_IMAGES, TEST_LABELS];

/// Connection timeout in seconds.
const CONNECT_TIMEOUT: u64 = 30;

/// Read timeout in seconds.
const READ_TIMEOUT: u64 = 300;

/// Download a file from URL to the specified path with progress bar.
///
/// Uses streaming download to a temporary file, then atomic rename to prevent
/// corrupted files from partial downloads.
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn download_file(url: &str, dest: &Path) -> Result<()> {
    let config = ureq::Agent::config_builder()
        .timeout_connect(Some(Duration::from_secs(CONNECT_TIMEOUT)))
        .timeout_recv_body(Some(Duration::from_secs(READ_TIMEOUT)))
        .build();
    let agent = ureq::Agent::new_with_config(config);

    let response = agent.get(url).call().map_err(|e| {
        let msg = match &e {
            ureq::Error::Timeout(_) => format!("Connection timed out while downloading {url}"),
            ureq::Error::Io(io_err) => {
                format!("Network error downloading {url}: {io_err}")
            }
            _ => format!("Failed to download {url}: {e}"),
        };
        OpenSetError::DownloadError(msg)
    })?;

    let total_size: u64 = response
        .headers()
        .get("content-length")
        .and_then(|v| v.to_str().ok())
        .and_then(|s: &str| s.parse().ok())
        .unwrap_or(0);

    // Same directory as the destination so the rename stays atomic
    let temp_path = dest.with_extension("part");
    let _ = fs::remove_file(&temp_path);

    let temp_file = File::create(&temp_path).map_err(|e| {
        OpenSetError::DownloadError(format!(
            "Failed to create temp file {}: {e}",
            temp_path.display()
        ))
    })?;
    let mut writer = BufWriter::new(temp_file);

    let mut reader = response.into_body().into_reader();
    let mut downloaded: u64 = 0;
    let mut buffer = [0u8; 65536];
    let start_time = Instant::now();
    let mut last_update = Instant::now();

    const BAR_WIDTH: usize = 12;
    const MIN_UPDATE_INTERVAL: f64 = 0.1;

    let desc = format!("Downloading {} to '{}'", url, dest.display());

    let download_result: std::result::Result<(), OpenSetError> = (|| {
        loop {
            let bytes_read = reader.read(&mut buffer).map_err(|e| {
                OpenSetError::DownloadError(format!("Failed to read from network: {e}"))
            })?;
            if bytes_read == 0 {
                break;
            }
            writer.write_all(&buffer[..bytes_read]).map_err(|e| {
                OpenSetError::DownloadError(format!("Failed to write temp file: {e}"))
            })?;
            downloaded += bytes_read as u64;

            let now = Instant::now();
            if now.duration_since(last_update).as_secs_f64() < MIN_UPDATE_INTERVAL {
                continue;
            }
            last_update = now;

            let elapsed = start_time.elapsed().as_secs_f64();
            let rate = if elapsed > 0.0 {
                downloaded as f64 / elapsed
            } else {
                0.0
            };
            if total_size > 0 {
                let progress = (downloaded as f64 / total_size as f64).min(1.0);
                eprint!(
                    "\r\x1b[K{}: {}% {} {}/{} {}/s {}",
                    desc,
                    (progress * 100.0) as u8,
                    generate_bar(progress, BAR_WIDTH),
                    format_bytes(downloaded as f64),
                    format_bytes(total_size as f64),
                    format_bytes(rate),
                    format_time(elapsed)
                );
            } else {
                eprint!(
                    "\r\x1b[K{}: {} {}/s {}",
                    desc,
                    format_bytes(downloaded as f64),
                    format_bytes(rate),
                    format_time(elapsed)
                );
            }
            io::stderr().flush().ok();
        }

        writer
            .flush()
            .map_err(|e| OpenSetError::DownloadError(format!("Failed to flush temp file: {e}")))?;
        Ok(())
    })();

    if let Err(e) = download_result {
        let _ = fs::remove_file(&temp_path);
        return Err(e);
    }

    let elapsed = start_time.elapsed().as_secs_f64();
    let rate = if elapsed > 0.0 {
        downloaded as f64 / elapsed
    } else {
        0.0
    };
    eprintln!(
        "\r\x1b[K{}: 100% {} {} {}/s {}",
        desc,
        generate_bar(1.0, BAR_WIDTH),
        format_bytes(downloaded as f64),
        format_bytes(rate),
        format_time(elapsed)
    );

    fs::rename(&temp_path, dest).map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        OpenSetError::DownloadError(format!(
            "Failed to move downloaded file to {}: {e}",
            dest.display()
        ))
    })?;

    Ok(())
}

/// Decompress a `.gz` archive into `dest`.
///
/// # Errors
///
/// Returns an error if the archive cannot be opened or is not valid gzip.
pub fn gunzip(archive: &Path, dest: &Path) -> Result<()> {
    let input = File::open(archive).map_err(|e| {
        OpenSetError::IoError(format!("Failed to open {}: {e}", archive.display()))
    })?;
    let mut decoder = GzDecoder::new(BufReader::new(input));
    let temp_path = dest.with_extension("part");
    let mut output = BufWriter::new(File::create(&temp_path)?);
    if let Err(e) = io::copy(&mut decoder, &mut output).and_then(|_| output.flush()) {
        let _ = fs::remove_file(&temp_path);
        return Err(OpenSetError::DatasetError(format!(
            "Failed to decompress {}: {e}",
            archive.display()
        )));
    }
    drop(output);
    fs::rename(&temp_path, dest)?;
    Ok(())
}

/// Make sure the four uncompressed MNIST files exist under `root`.
///
/// Files already present are left untouched. Missing archives are fetched from
/// [`MNIST_MIRRORS`] in order until one succeeds.
///
/// # Errors
///
/// Returns an error if a file is missing and no mirror could provide it.
pub fn ensure_mnist<P: AsRef<Path>>(root: P) -> Result<PathBuf> {
    let root = root.as_ref();
    fs::create_dir_all(root).map_err(|e| {
        OpenSetError::IoError(format!("Failed to create {}: {e}", root.display()))
    })?;

    for name in MNIST_FILES {
        let raw = root.join(name);
        if raw.exists() {
            continue;
        }
        let archive = root.join(format!("{name}.gz"));
        if !archive.exists() {
            fetch_from_mirrors(name, &archive)?;
        }
        verbose!("Extracting {}", archive.display());
        gunzip(&archive, &raw)?;
    }
    Ok(root.to_path_buf())
}

fn fetch_from_mirrors(name: &str, archive: &Path) -> Result<()> {
    let mut last_err = None;
    for mirror in MNIST_MIRRORS {
        let url = format!("{mirror}{name}.gz");
        match download_file(&url, archive) {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!("{e}");
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| {
        OpenSetError::DownloadError(format!("No mirror available for {name}"))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;

    #[test]
    fn test_gunzip_roundtrip_file() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("labels.gz");
        let mut encoder = GzEncoder::new(File::create(&archive).unwrap(), Compression::default());
        encoder.write_all(&[0, 0, 8, 1, 0, 0, 0, 2, 7, 3]).unwrap();
        encoder.finish().unwrap();

        let raw = dir.path().join("labels");
        gunzip(&archive, &raw).unwrap();
        assert_eq!(fs::read(&raw).unwrap(), vec![0, 0, 8, 1, 0, 0, 0, 2, 7, 3]);
        assert!(!dir.path().join("labels.part").exists());
    }

    #[test]
    fn test_gunzip_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("bad.gz");
        fs::write(&archive, b"definitely not gzip").unwrap();
        let err = gunzip(&archive, &dir.path().join("bad")).unwrap_err();
        assert!(err.to_string().contains("Failed to decompress"));
    }

    #[test]
    fn test_ensure_mnist_skips_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        for name in MNIST_FILES {
            fs::write(dir.path().join(name), b"present").unwrap();
        }
        let root = ensure_mnist(dir.path()).unwrap();
        assert_eq!(root, dir.path());
        assert_eq!(fs::read(dir.path().join(TRAIN_IMAGES)).unwrap(), b"present");
    }
}

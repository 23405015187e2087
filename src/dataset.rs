// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! MNIST loading, the known/unknown class split, and mini-batch iteration.
//!
//! Images are kept as raw bytes and normalized per batch with the usual MNIST
//! statistics, so a full 60k training set stays at ~47MB in memory.

use std::fs;
use std::path::Path;

use clap::ValueEnum;
use ndarray::Array4;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::download::{self, TEST_IMAGES, TEST_LABELS, TRAIN_IMAGES, TRAIN_LABELS};
use crate::error::{OpenSetError, Result};

/// Per-pixel mean used for normalization.
pub const MNIST_MEAN: f32 = 0.1307;
/// Per-pixel standard deviation used for normalization.
pub const MNIST_STD: f32 = 0.3081;
/// Digits below this value form the known (in-distribution) set.
pub const NUM_KNOWN_CLASSES: usize = 7;
/// Total number of digit classes.
pub const NUM_CLASSES: usize = 10;

const IMAGE_MAGIC: u32 = 2051;
const LABEL_MAGIC: u32 = 2049;

/// Supported datasets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DatasetKind {
    /// Handwritten digits, 28x28 grayscale.
    Mnist,
}

impl DatasetKind {
    /// Lowercase name used in file names (e.g. `log_mnist.txt`).
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Mnist => "mnist",
        }
    }
}

/// An in-memory MNIST split.
#[derive(Debug, Clone)]
pub struct MnistSet {
    images: Vec<u8>,
    labels: Vec<u8>,
    rows: usize,
    cols: usize,
}

impl MnistSet {
    /// Load the training or test split from `root`, downloading it first if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the files cannot be fetched or are malformed.
    pub fn load<P: AsRef<Path>>(root: P, train: bool) -> Result<Self> {
        let root = download::ensure_mnist(root)?;
        let (images, labels) = if train {
            (TRAIN_IMAGES, TRAIN_LABELS)
        } else {
            (TEST_IMAGES, TEST_LABELS)
        };
        Self::from_idx_files(&root.join(images), &root.join(labels))
    }

    /// Parse a pair of uncompressed IDX files.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure, bad magic numbers, truncated payloads,
    /// or mismatched image/label counts.
    pub fn from_idx_files(images_path: &Path, labels_path: &Path) -> Result<Self> {
        let image_bytes = fs::read(images_path).map_err(|e| {
            OpenSetError::IoError(format!("Failed to read {}: {e}", images_path.display()))
        })?;
        let label_bytes = fs::read(labels_path).map_err(|e| {
            OpenSetError::IoError(format!("Failed to read {}: {e}", labels_path.display()))
        })?;
        let (images, rows, cols) = parse_idx_images(&image_bytes)?;
        let labels = parse_idx_labels(&label_bytes)?;
        Self::from_raw(images, labels, rows, cols)
    }

    /// Build a set from raw row-major pixel bytes and labels.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer sizes disagree or a label is not a digit.
    pub fn from_raw(images: Vec<u8>, labels: Vec<u8>, rows: usize, cols: usize) -> Result<Self> {
        let expected = rows
            .checked_mul(cols)
            .filter(|&pixels| pixels > 0)
            .and_then(|pixels| labels.len().checked_mul(pixels));
        if expected != Some(images.len()) {
            return Err(OpenSetError::DatasetError(format!(
                "{} pixel bytes do not match {} labels of {rows}x{cols}",
                images.len(),
                labels.len()
            )));
        }
        if let Some(bad) = labels.iter().find(|&&l| usize::from(l) >= NUM_CLASSES) {
            return Err(OpenSetError::DatasetError(format!("Label {bad} out of range")));
        }
        Ok(Self {
            images,
            labels,
            rows,
            cols,
        })
    }

    /// Number of samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Whether the set has no samples.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Image height and width.
    #[must_use]
    pub const fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// All labels in dataset order.
    #[must_use]
    pub fn labels(&self) -> &[u8] {
        &self.labels
    }

    /// Gather the given samples into a normalized `(N, 1, H, W)` batch.
    #[must_use]
    pub fn batch(&self, indices: &[usize]) -> Batch {
        let pixels = self.rows * self.cols;
        let images = Array4::from_shape_fn((indices.len(), 1, self.rows, self.cols), |(n, _, y, x)| {
            let byte = self.images[indices[n] * pixels + y * self.cols + x];
            (f32::from(byte) / 255.0 - MNIST_MEAN) / MNIST_STD
        });
        let labels = indices.iter().map(|&i| usize::from(self.labels[i])).collect();
        Batch { images, labels }
    }
}

fn read_u32(bytes: &[u8], offset: usize) -> Result<u32> {
    bytes
        .get(offset..offset + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| OpenSetError::DatasetError("Truncated IDX header".to_string()))
}

/// Parse an IDX3 image file into `(pixels, rows, cols)`.
///
/// # Errors
///
/// Returns an error for a wrong magic number or a truncated payload.
pub fn parse_idx_images(bytes: &[u8]) -> Result<(Vec<u8>, usize, usize)> {
    let magic = read_u32(bytes, 0)?;
    if magic != IMAGE_MAGIC {
        return Err(OpenSetError::DatasetError(format!(
            "Bad image file magic {magic}, expected {IMAGE_MAGIC}"
        )));
    }
    let count = read_u32(bytes, 4)? as usize;
    let rows = read_u32(bytes, 8)? as usize;
    let cols = read_u32(bytes, 12)? as usize;
    let payload = &bytes[16..];
    let expected = count
        .checked_mul(rows)
        .and_then(|n| n.checked_mul(cols))
        .ok_or_else(|| OpenSetError::DatasetError("IDX header dimensions overflow".to_string()))?;
    if payload.len() < expected {
        return Err(OpenSetError::DatasetError(format!(
            "Image payload has {} bytes, expected {expected}",
            payload.len()
        )));
    }
    Ok((payload[..expected].to_vec(), rows, cols))
}

/// Parse an IDX1 label file.
///
/// # Errors
///
/// Returns an error for a wrong magic number or a truncated payload.
pub fn parse_idx_labels(bytes: &[u8]) -> Result<Vec<u8>> {
    let magic = read_u32(bytes, 0)?;
    if magic != LABEL_MAGIC {
        return Err(OpenSetError::DatasetError(format!(
            "Bad label file magic {magic}, expected {LABEL_MAGIC}"
        )));
    }
    let count = read_u32(bytes, 4)? as usize;
    let payload = &bytes[8..];
    if payload.len() < count {
        return Err(OpenSetError::DatasetError(format!(
            "Label payload has {} bytes, expected {count}",
            payload.len()
        )));
    }
    Ok(payload[..count].to_vec())
}

/// Partition sample indices into known (`label < num_known`) and unknown classes.
///
/// Both lists keep dataset order.
#[must_use]
pub fn split_known_unknown(labels: &[u8], num_known: usize) -> (Vec<usize>, Vec<usize>) {
    (0..labels.len()).partition(|&i| usize::from(labels[i]) < num_known)
}

/// A mini-batch of normalized images and their labels.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Images as `(N, 1, H, W)`.
    pub images: Array4<f32>,
    /// Integer class labels.
    pub labels: Vec<usize>,
}

impl Batch {
    /// Number of samples in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Whether the batch is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Iterates a subset of a [`MnistSet`] in mini-batches.
///
/// With shuffling enabled every call to [`DataLoader::epoch`] draws a fresh
/// permutation of the subset from the loader's seeded generator.
#[derive(Debug)]
pub struct DataLoader<'a> {
    dataset: &'a MnistSet,
    indices: Vec<usize>,
    batch_size: usize,
    shuffle: bool,
    rng: StdRng,
}

impl<'a> DataLoader<'a> {
    /// Create a loader over `indices`.
    ///
    /// # Errors
    ///
    /// Returns an error if `batch_size` is zero or an index is out of range.
    pub fn new(
        dataset: &'a MnistSet,
        indices: Vec<usize>,
        batch_size: usize,
        shuffle: bool,
        seed: u64,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(OpenSetError::ConfigError(
                "batch size must be at least 1".to_string(),
            ));
        }
        if let Some(&bad) = indices.iter().find(|&&i| i >= dataset.len()) {
            return Err(OpenSetError::DatasetError(format!(
                "Index {bad} out of range for {} samples",
                dataset.len()
            )));
        }
        Ok(Self {
            dataset,
            indices,
            batch_size,
            shuffle,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    /// Loader over every sample of the dataset.
    ///
    /// # Errors
    ///
    /// Returns an error if `batch_size` is zero.
    pub fn full(dataset: &'a MnistSet, batch_size: usize, shuffle: bool, seed: u64) -> Result<Self> {
        Self::new(dataset, (0..dataset.len()).collect(), batch_size, shuffle, seed)
    }

    /// Number of samples covered.
    #[must_use]
    pub fn num_samples(&self) -> usize {
        self.indices.len()
    }

    /// Number of batches per epoch; the last one may be short.
    #[must_use]
    pub fn num_batches(&self) -> usize {
        self.indices.len().div_ceil(self.batch_size)
    }

    /// Produce the batches of one epoch.
    pub fn epoch(&mut self) -> impl Iterator<Item = Batch> + '_ {
        if self.shuffle {
            self.indices.shuffle(&mut self.rng);
        }
        let dataset = self.dataset;
        self.indices
            .chunks(self.batch_size)
            .map(move |chunk| dataset.batch(chunk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy_set(labels: &[u8]) -> MnistSet {
        let images = labels
            .iter()
            .flat_map(|&l| std::iter::repeat_n(l * 20, 4))
            .collect();
        MnistSet::from_raw(images, labels.to_vec(), 2, 2).unwrap()
    }

    fn idx_images(count: u32, rows: u32, cols: u32, payload: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for v in [IMAGE_MAGIC, count, rows, cols] {
            bytes.extend_from_slice(&v.to_be_bytes());
        }
        bytes.extend_from_slice(payload);
        bytes
    }

    #[test]
    fn test_split_known_unknown() {
        let labels = [0, 7, 6, 9, 3, 8, 1];
        let (known, unknown) = split_known_unknown(&labels, NUM_KNOWN_CLASSES);
        assert_eq!(known, vec![0, 2, 4, 6]);
        assert_eq!(unknown, vec![1, 3, 5]);
    }

    #[test]
    fn test_parse_idx_images() {
        let bytes = idx_images(2, 1, 2, &[1, 2, 3, 4]);
        let (pixels, rows, cols) = parse_idx_images(&bytes).unwrap();
        assert_eq!(pixels, vec![1, 2, 3, 4]);
        assert_eq!((rows, cols), (1, 2));
    }

    #[test]
    fn test_parse_idx_rejects_bad_input() {
        let truncated = idx_images(3, 1, 2, &[1, 2, 3, 4]);
        assert!(parse_idx_images(&truncated).is_err());

        let mut labels = Vec::new();
        labels.extend_from_slice(&IMAGE_MAGIC.to_be_bytes());
        labels.extend_from_slice(&1u32.to_be_bytes());
        labels.push(5);
        let err = parse_idx_labels(&labels).unwrap_err();
        assert!(err.to_string().contains("magic"));

        assert!(parse_idx_labels(&[0, 0]).is_err());
    }

    #[test]
    fn test_parse_idx_rejects_overflowing_header() {
        let bytes = idx_images(u32::MAX, u32::MAX, u32::MAX, &[]);
        let err = parse_idx_images(&bytes).unwrap_err();
        assert!(err.to_string().contains("overflow"));
    }

    #[test]
    fn test_from_raw_validates() {
        assert!(MnistSet::from_raw(vec![0; 3], vec![1], 2, 2).is_err());
        assert!(MnistSet::from_raw(vec![0; 4], vec![10], 2, 2).is_err());
        assert!(MnistSet::from_raw(vec![0; 4], vec![1], usize::MAX, 2).is_err());
        assert!(MnistSet::from_raw(vec![], vec![], 0, 2).is_err());

        let set = MnistSet::from_raw(vec![0; 6], vec![1], 2, 3).unwrap();
        assert_eq!(set.shape(), (2, 3));
    }

    #[test]
    fn test_batch_normalization() {
        let set = toy_set(&[0, 5]);
        let batch = set.batch(&[1]);
        assert_eq!(batch.images.dim(), (1, 1, 2, 2));
        assert_eq!(batch.labels, vec![5]);
        let expected = (100.0 / 255.0 - MNIST_MEAN) / MNIST_STD;
        assert!((batch.images[[0, 0, 1, 1]] - expected).abs() < 1e-6);
    }

    #[test]
    fn test_loader_covers_subset_once_per_epoch() {
        let set = toy_set(&[0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
        let (known, _) = split_known_unknown(set.labels(), NUM_KNOWN_CLASSES);
        let mut loader = DataLoader::new(&set, known, 3, true, 42).unwrap();
        assert_eq!(loader.num_samples(), 7);
        assert_eq!(loader.num_batches(), 3);

        let batches: Vec<Batch> = loader.epoch().collect();
        assert_eq!(batches.iter().map(Batch::len).collect::<Vec<_>>(), vec![3, 3, 1]);
        let mut seen: Vec<usize> = batches.iter().flat_map(|b| b.labels.clone()).collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_loader_without_shuffle_keeps_order() {
        let set = toy_set(&[3, 1, 2]);
        let mut loader = DataLoader::full(&set, 2, false, 0).unwrap();
        let labels: Vec<usize> = loader.epoch().flat_map(|b| b.labels).collect();
        assert_eq!(labels, vec![3, 1, 2]);
    }

    #[test]
    fn test_loader_rejects_bad_config() {
        let set = toy_set(&[0]);
        assert!(DataLoader::new(&set, vec![0], 0, false, 0).is_err());
        assert!(DataLoader::new(&set, vec![1], 1, false, 0).is_err());
        let mut empty = DataLoader::new(&set, vec![], 4, true, 0).unwrap();
        assert_eq!(empty.epoch().count(), 0);
    }
}

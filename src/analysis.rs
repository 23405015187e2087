// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! Open-set softmax statistics.
//!
//! For every sample the analysis takes the row of output logits, finds the
//! predicted class (`argmax`), and records two scalars under that class: the
//! maximum logit (`S`) and the mean logit (`M`). Known and unknown digits are
//! bucketed separately so that the distributions can be compared offline.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::dataset::DataLoader;
use crate::error::{OpenSetError, Result};
use crate::model::ConvNet;
use crate::utils::{argmax, mean};

/// Predicted class → values, in the order samples were seen.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClassBuckets(BTreeMap<usize, Vec<f32>>);

impl ClassBuckets {
    /// Append `value` to the bucket of `class`, creating it on first sight.
    pub fn record(&mut self, class: usize, value: f32) {
        self.0.entry(class).or_default().push(value);
    }

    /// Values recorded for `class`.
    #[must_use]
    pub fn get(&self, class: usize) -> Option<&[f32]> {
        self.0.get(&class).map(Vec::as_slice)
    }

    /// Observed classes in ascending order.
    pub fn classes(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.keys().copied()
    }

    /// Iterate `(class, values)` in ascending class order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &[f32])> + '_ {
        self.0.iter().map(|(&c, v)| (c, v.as_slice()))
    }

    /// Total number of recorded values across all classes.
    #[must_use]
    pub fn total(&self) -> usize {
        self.0.values().map(Vec::len).sum()
    }

    /// Whether nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Max- and mean-logit buckets for one subset.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubsetStatistics {
    /// Max logit per predicted class.
    pub max: ClassBuckets,
    /// Mean logit per predicted class.
    pub mean: ClassBuckets,
}

impl SubsetStatistics {
    /// Record every row of a `(N, K)` logit matrix.
    pub fn record_logits(&mut self, logits: &Array2<f32>) {
        for row in logits.rows() {
            let values: Vec<f32> = row.iter().copied().collect();
            if let Some((class, max)) = argmax(&values) {
                self.max.record(class, max);
                self.mean.record(class, mean(&values));
            }
        }
    }
}

/// Run the model over one loader and bucket the logit statistics.
///
/// # Errors
///
/// Returns an error if the forward pass fails.
pub fn collect_statistics(model: &mut ConvNet, loader: &mut DataLoader<'_>) -> Result<SubsetStatistics> {
    let mut stats = SubsetStatistics::default();
    for batch in loader.epoch() {
        let (_, logits) = model.forward(&batch.images)?;
        stats.record_logits(&logits);
    }
    Ok(stats)
}

/// Statistics for the known and unknown subsets, serialized under the keys
/// `known_S`, `unknown_S`, `known_M`, and `unknown_M`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// Max logit per predicted class on known digits.
    #[serde(rename = "known_S")]
    pub known_s: ClassBuckets,
    /// Max logit per predicted class on unknown digits.
    #[serde(rename = "unknown_S")]
    pub unknown_s: ClassBuckets,
    /// Mean logit per predicted class on known digits.
    #[serde(rename = "known_M")]
    pub known_m: ClassBuckets,
    /// Mean logit per predicted class on unknown digits.
    #[serde(rename = "unknown_M")]
    pub unknown_m: ClassBuckets,
}

impl AnalysisResult {
    /// Combine the statistics of the two subsets.
    #[must_use]
    pub fn from_subsets(known: SubsetStatistics, unknown: SubsetStatistics) -> Self {
        Self {
            known_s: known.max,
            unknown_s: unknown.max,
            known_m: known.mean,
            unknown_m: unknown.mean,
        }
    }

    /// Write as JSON, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if a value is not finite (JSON has no encoding for it)
    /// or the file cannot be created or written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        for (key, buckets) in [
            ("known_S", &self.known_s),
            ("unknown_S", &self.unknown_s),
            ("known_M", &self.known_m),
            ("unknown_M", &self.unknown_m),
        ] {
            if let Some((class, value)) = buckets
                .iter()
                .find_map(|(c, values)| values.iter().find(|v| !v.is_finite()).map(|v| (c, *v)))
            {
                return Err(OpenSetError::SerializationError(format!(
                    "{key} class {class} holds non-finite value {value}"
                )));
            }
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| {
                OpenSetError::IoError(format!("Failed to create {}: {e}", parent.display()))
            })?;
        }
        let file = File::create(path).map_err(|e| {
            OpenSetError::IoError(format!("Failed to create {}: {e}", path.display()))
        })?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }

    /// Read a result previously written by [`AnalysisResult::save`].
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or not a valid result.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            OpenSetError::IoError(format!("Failed to open {}: {e}", path.display()))
        })?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }

    /// One line per subset: `known: 0=812 1=790 ...`.
    #[must_use]
    pub fn summary(&self) -> Vec<String> {
        [("known", &self.known_s), ("unknown", &self.unknown_s)]
            .into_iter()
            .map(|(name, buckets)| {
                let counts: Vec<String> = buckets
                    .iter()
                    .map(|(class, values)| format!("{class}={}", values.len()))
                    .collect();
                format!("{name} ({} samples): {}", buckets.total(), counts.join(" "))
            })
            .collect()
    }
}

/// Run the analysis over the known and unknown loaders.
///
/// # Errors
///
/// Returns an error if a forward pass fails.
pub fn analyze(
    model: &mut ConvNet,
    known: &mut DataLoader<'_>,
    unknown: &mut DataLoader<'_>,
) -> Result<AnalysisResult> {
    let known_stats = collect_statistics(model, known)?;
    let unknown_stats = collect_statistics(model, unknown)?;
    Ok(AnalysisResult::from_subsets(known_stats, unknown_stats))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_record_logits_buckets_by_prediction() {
        let mut stats = SubsetStatistics::default();
        stats.record_logits(&array![[1.0, 4.0, 1.0], [6.0, 0.0, 0.0], [0.0, 3.0, 3.0]]);

        assert_eq!(stats.max.classes().collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(stats.max.get(1), Some(&[4.0, 3.0][..]));
        assert_eq!(stats.max.get(0), Some(&[6.0][..]));
        assert_eq!(stats.mean.get(1), Some(&[2.0, 2.0][..]));
        assert_eq!(stats.mean.get(0), Some(&[2.0][..]));
        assert_eq!(stats.max.total(), 3);
        assert!(stats.max.get(2).is_none());
    }

    #[test]
    fn test_result_json_keys_and_roundtrip() {
        let mut known = SubsetStatistics::default();
        known.record_logits(&array![[2.0, 0.0]]);
        let mut unknown = SubsetStatistics::default();
        unknown.record_logits(&array![[0.0, 1.0], [0.5, 1.5]]);
        let result = AnalysisResult::from_subsets(known, unknown);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("result.json");
        result.save(&path).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        for key in ["known_S", "unknown_S", "known_M", "unknown_M"] {
            assert!(raw.get(key).is_some(), "missing {key}");
        }
        assert_eq!(raw["unknown_S"]["1"], serde_json::json!([1.0, 1.5]));

        let loaded = AnalysisResult::load(&path).unwrap();
        assert_eq!(loaded, result);
    }

    #[test]
    fn test_summary_lists_counts() {
        let mut known = SubsetStatistics::default();
        known.record_logits(&array![[2.0, 0.0], [3.0, 1.0], [0.0, 1.0]]);
        let result = AnalysisResult::from_subsets(known, SubsetStatistics::default());
        let summary = result.summary();
        assert_eq!(summary[0], "known (3 samples): 0=2 1=1");
        assert_eq!(summary[1], "unknown (0 samples): ");
    }

    #[test]
    fn test_save_rejects_non_finite_values() {
        let mut unknown = SubsetStatistics::default();
        unknown.record_logits(&array![[f32::INFINITY, 0.0]]);
        let result = AnalysisResult::from_subsets(SubsetStatistics::default(), unknown);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("result.json");
        let err = result.save(&path).unwrap_err();
        assert!(matches!(err, OpenSetError::SerializationError(_)));
        assert!(err.to_string().contains("unknown_S"));
        assert!(!path.exists());
    }

    #[test]
    fn test_load_missing_file() {
        let err = AnalysisResult::load("/nonexistent/result.json").unwrap_err();
        assert!(err.to_string().contains("Failed to open"));
    }
}

// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! Model checkpoints stored as JSON.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use ndarray::{Array2, ArrayD};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::error::{OpenSetError, Result};
use crate::model::{ConvNet, FEATURE_DIM, ModelKind};

/// Serialized network weights plus the metadata needed to rebuild the network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Architecture.
    pub model: ModelKind,
    /// Number of output classes.
    pub num_classes: usize,
    /// Embedding dimension.
    pub feat_dim: usize,
    /// Parameter name → value.
    pub state: BTreeMap<String, ArrayD<f32>>,
    /// Learned class centers, if saved by a center-loss run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub centers: Option<Array2<f32>>,
}

impl Checkpoint {
    /// Capture a network and, optionally, its class centers.
    #[must_use]
    pub fn from_model(model: &ConvNet, centers: Option<Array2<f32>>) -> Self {
        Self {
            model: model.kind(),
            num_classes: model.num_classes(),
            feat_dim: FEATURE_DIM,
            state: model.state_dict(),
            centers,
        }
    }

    /// Rebuild the network described by this checkpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored weights do not fit the architecture.
    pub fn to_model(&self) -> Result<ConvNet> {
        if self.feat_dim != FEATURE_DIM {
            return Err(OpenSetError::CheckpointError(format!(
                "feature dimension {} is not supported",
                self.feat_dim
            )));
        }
        // Initial values are replaced wholesale by load_state_dict
        let mut rng = StdRng::seed_from_u64(0);
        let mut model = ConvNet::new(self.model, self.num_classes, &mut rng)?;
        model.load_state_dict(&self.state)?;
        Ok(model)
    }

    /// Write as JSON, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if a weight is not finite or the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let bad = self
            .state
            .iter()
            .find(|(_, value)| value.iter().any(|v| !v.is_finite()))
            .map(|(name, _)| name.as_str())
            .or_else(|| {
                self.centers
                    .as_ref()
                    .filter(|c| c.iter().any(|v| !v.is_finite()))
                    .map(|_| "centers")
            });
        if let Some(name) = bad {
            return Err(OpenSetError::SerializationError(format!(
                "{name} holds non-finite values"
            )));
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(path).map_err(|e| {
            OpenSetError::CheckpointError(format!("Failed to create {}: {e}", path.display()))
        })?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }

    /// Read a checkpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or malformed.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            OpenSetError::CheckpointError(format!(
                "Failed to open {}: {e}. Run `train` first or pass --checkpoint",
                path.display()
            ))
        })?;
        serde_json::from_reader(BufReader::new(file)).map_err(|e| {
            OpenSetError::CheckpointError(format!("Failed to parse {}: {e}", path.display()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array4, array};

    #[test]
    fn test_checkpoint_roundtrip_preserves_outputs() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut model = ConvNet::new(ModelKind::CnnMini, 7, &mut rng).unwrap();
        let x = Array4::from_shape_fn((2, 1, 28, 28), |(n, _, y, x)| ((n + y + x) as f32 * 0.05).sin());
        let (_, expected) = model.forward(&x).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ckpt").join("model.json");
        Checkpoint::from_model(&model, Some(array![[0.0, 1.0]]))
            .save(&path)
            .unwrap();

        let loaded = Checkpoint::load(&path).unwrap();
        assert_eq!(loaded.model, ModelKind::CnnMini);
        assert_eq!(loaded.num_classes, 7);
        assert_eq!(loaded.centers, Some(array![[0.0, 1.0]]));

        let mut restored = loaded.to_model().unwrap();
        let (_, logits) = restored.forward(&x).unwrap();
        for (a, b) in logits.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_save_rejects_non_finite_weights() {
        let mut rng = StdRng::seed_from_u64(3);
        let model = ConvNet::new(ModelKind::CnnMini, 7, &mut rng).unwrap();
        let dir = tempfile::tempdir().unwrap();

        let mut ckpt = Checkpoint::from_model(&model, None);
        if let Some(first) = ckpt
            .state
            .get_mut("fc2.bias")
            .and_then(|bias| bias.iter_mut().next())
        {
            *first = f32::NAN;
        }
        let err = ckpt.save(dir.path().join("nan.json")).unwrap_err();
        assert!(err.to_string().contains("fc2.bias"));

        let ckpt = Checkpoint::from_model(&model, Some(array![[f32::INFINITY, 0.0]]));
        let err = ckpt.save(dir.path().join("inf.json")).unwrap_err();
        assert!(matches!(err, OpenSetError::SerializationError(_)));
    }

    #[test]
    fn test_load_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Checkpoint::load(dir.path().join("missing.json")).is_err());

        let bad = dir.path().join("bad.json");
        fs::write(&bad, "{\"model\": \"cnn\"}").unwrap();
        let err = Checkpoint::load(&bad).unwrap_err();
        assert!(err.to_string().contains("Failed to parse"));
    }
}

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::data::normalize::NormalizationMode;
use crate::data::transforms::AugmentationConfig;
use crate::error::{Result, SegError};
use crate::model::{LossConfig, UNet3dConfig};

/// Bytes per f32 activation.
const BYTES_PER_VALUE: f64 = 4.0;

/// Forward activations kept per voxel and feature channel (conv, norm, act, grads).
const ACTIVATION_COPIES: f64 = 6.0;

/// Which checkpoint to resume from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeFrom {
    /// A named checkpoint (`last`, `best`, `epoch_N`) under `checkpoint_dir`.
    Name(String),
    /// An explicit checkpoint directory.
    Path(PathBuf),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    // Dataset
    pub dataset_root: PathBuf,
    pub images_dir: String,
    pub labels_dir: String,
    /// Keep loaded cases in memory for the whole run.
    pub cache_volumes: bool,
    pub skip_corrupt_cases: bool,

    // Cross-validation
    pub num_folds: usize,
    pub fold: usize,

    // Preprocessing / sampling
    pub normalization: NormalizationMode,
    pub background_value: f32,
    pub patch_size: [usize; 3],
    pub samples_per_volume: usize,
    pub foreground_prob: f64,
    pub augmentation: AugmentationConfig,

    // Training
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub weight_decay: f32,
    pub seed: u64,
    pub prefetch_batches: usize,
    pub memory_budget_mb: usize,

    // Model / loss
    pub model: UNet3dConfig,
    pub loss: LossConfig,

    // Validation
    pub val_interval: usize,
    pub sw_overlap: f32,
    /// Epochs without improvement before stopping; 0 disables.
    pub patience: usize,
    pub min_delta: f32,

    // Checkpointing
    pub checkpoint_dir: PathBuf,
    pub save_interval: usize,
    pub resume: Option<ResumeFrom>,
    pub allow_fresh_on_corrupt: bool,

    pub show_progress: bool,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            dataset_root: PathBuf::from("data/Task01_BrainTumour"),
            images_dir: "imagesTr".to_string(),
            labels_dir: "labelsTr".to_string(),
            cache_volumes: false,
            skip_corrupt_cases: false,
            num_folds: 5,
            fold: 0,
            normalization: NormalizationMode::ZScore,
            background_value: 0.0,
            patch_size: [96, 96, 96],
            samples_per_volume: 4,
            foreground_prob: 0.5,
            augmentation: AugmentationConfig::default(),
            epochs: 100,
            batch_size: 2,
            learning_rate: 1e-4,
            weight_decay: 1e-5,
            seed: 42,
            prefetch_batches: 2,
            memory_budget_mb: 16 * 1024,
            model: UNet3dConfig::new(),
            loss: LossConfig::default(),
            val_interval: 1,
            sw_overlap: 0.5,
            patience: 0,
            min_delta: 0.0,
            checkpoint_dir: PathBuf::from("runs/train"),
            save_interval: 10,
            resume: None,
            allow_fresh_on_corrupt: false,
            show_progress: true,
        }
    }
}

impl TrainingConfig {
    pub fn from_yaml(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: TrainingConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Check ranges, patch divisibility and the memory budget.
    pub fn validate(&self) -> Result<()> {
        self.model.validate()?;
        self.loss.validate()?;
        self.augmentation.validate()?;
        self.model.check_patch_size(self.patch_size)?;

        let positive = [
            ("epochs", self.epochs),
            ("batch_size", self.batch_size),
            ("samples_per_volume", self.samples_per_volume),
            ("val_interval", self.val_interval),
            ("save_interval", self.save_interval),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(SegError::config(format!("{} must be positive", name)));
            }
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(SegError::config("learning_rate must be positive"));
        }
        if !(self.weight_decay.is_finite() && self.weight_decay >= 0.0) {
            return Err(SegError::config("weight_decay must be non-negative"));
        }
        if !(0.0..=1.0).contains(&self.foreground_prob) {
            return Err(SegError::config("foreground_prob must be in [0, 1]"));
        }
        if !(0.0..1.0).contains(&self.sw_overlap) {
            return Err(SegError::config("sw_overlap must be in [0, 1)"));
        }
        if self.num_folds >= 2 && self.fold >= self.num_folds {
            return Err(SegError::config(format!(
                "fold {} out of range for {} folds",
                self.fold, self.num_folds
            )));
        }

        self.check_memory()
    }

    /// Rough activation memory of one training step, in MiB.
    pub fn estimated_memory_mb(&self) -> usize {
        let voxels: f64 = self.patch_size.iter().map(|&p| p as f64).product();
        let mut features = 0.0;
        let mut scale = 1.0;
        for (i, &c) in self.model.channels.iter().enumerate() {
            // encoder stage, plus the matching decoder stage (skip concat doubles it)
            let decoder = if i + 1 < self.model.channels.len() { 3.0 } else { 0.0 };
            features += c as f64 * (1.0 + decoder) / scale;
            scale *= 8.0;
        }
        features += (self.model.in_channels + self.model.num_classes) as f64;

        let bytes = voxels * features * self.batch_size as f64 * ACTIVATION_COPIES * BYTES_PER_VALUE;
        (bytes / (1024.0 * 1024.0)).ceil() as usize
    }

    fn check_memory(&self) -> Result<()> {
        if self.memory_budget_mb == 0 {
            return Ok(());
        }
        let estimated_mb = self.estimated_memory_mb();
        if estimated_mb > self.memory_budget_mb {
            return Err(SegError::ResourceExhaustion {
                patch_size: self.patch_size,
                batch_size: self.batch_size,
                estimated_mb,
                budget_mb: self.memory_budget_mb,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_is_valid() {
        TrainingConfig::default().validate().unwrap();
    }

    #[test]
    fn test_yaml_round_trip_with_partial_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("train.yaml");
        std::fs::write(
            &path,
            "epochs: 3\npatch_size: [32, 32, 32]\nloss:\n  ce_weight: 0.5\nresume: !name last\n",
        )
        .unwrap();

        let config = TrainingConfig::from_yaml(&path).unwrap();
        assert_eq!(config.epochs, 3);
        assert_eq!(config.patch_size, [32, 32, 32]);
        assert_eq!(config.loss.ce_weight, 0.5);
        assert_eq!(config.loss.dice_weight, 1.0);
        assert_eq!(config.resume, Some(ResumeFrom::Name("last".to_string())));

        config.save(&path).unwrap();
        let again = TrainingConfig::from_yaml(&path).unwrap();
        assert_eq!(again.patch_size, config.patch_size);
        assert_eq!(again.model, config.model);
    }

    #[test]
    fn test_indivisible_patch_rejected() {
        let config = TrainingConfig {
            patch_size: [96, 90, 96],
            ..TrainingConfig::default()
        };
        assert!(matches!(config.validate(), Err(SegError::InvalidConfig { .. })));
    }

    #[test]
    fn test_memory_budget_enforced() {
        let config = TrainingConfig {
            patch_size: [256, 256, 256],
            batch_size: 8,
            memory_budget_mb: 1024,
            ..TrainingConfig::default()
        };
        match config.validate() {
            Err(SegError::ResourceExhaustion {
                patch_size,
                batch_size,
                estimated_mb,
                budget_mb,
            }) => {
                assert_eq!(patch_size, [256, 256, 256]);
                assert_eq!(batch_size, 8);
                assert_eq!(budget_mb, 1024);
                assert!(estimated_mb > budget_mb);
            }
            other => panic!("expected ResourceExhaustion, got {:?}", other),
        }
    }
}

use burn::optim::Optimizer;
use burn::prelude::*;
use burn::record::{BinFileRecorder, FullPrecisionSettings, Recorder};
use burn::tensor::backend::AutodiffBackend;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Result, SegError};
use crate::model::{UNet3d, UNet3dConfig};
use crate::training::config::ResumeFrom;
use crate::training::state::TrainingContext;

/// Bumped whenever the on-disk layout changes.
pub const FORMAT_VERSION: u32 = 1;

const MODEL_FILE: &str = "model";
const OPTIM_FILE: &str = "optim";
const METADATA_FILE: &str = "metadata.json";

type CheckpointRecorder = BinFileRecorder<FullPrecisionSettings>;

/// Contents of `metadata.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub version: u32,
    pub name: String,
    /// Last completed epoch.
    pub epoch: usize,
    pub global_step: usize,
    pub best_metric: Option<f32>,
    pub best_epoch: Option<usize>,
    pub model: UNet3dConfig,
    pub num_params: usize,
}

impl CheckpointMetadata {
    pub fn new(
        name: impl Into<String>,
        context: &TrainingContext,
        model: &UNet3dConfig,
        num_params: usize,
    ) -> Self {
        Self {
            version: FORMAT_VERSION,
            name: name.into(),
            epoch: context.epoch,
            global_step: context.global_step,
            best_metric: context.best_metric,
            best_epoch: context.best_epoch,
            model: model.clone(),
            num_params,
        }
    }
}

/// Location of one checkpoint directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointHandle {
    pub name: String,
    pub dir: PathBuf,
}

impl CheckpointHandle {
    pub fn model_path(&self) -> PathBuf {
        self.dir.join(MODEL_FILE).with_extension("bin")
    }

    pub fn optim_path(&self) -> PathBuf {
        self.dir.join(OPTIM_FILE).with_extension("bin")
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.dir.join(METADATA_FILE)
    }

    pub fn exists(&self) -> bool {
        self.dir.is_dir()
    }
}

/// Saves and restores checkpoints below one root directory.
///
/// Layout:
/// runs/train/
/// ├── best/
/// │   ├── model.bin
/// │   ├── optim.bin
/// │   └── metadata.json
/// ├── epoch_10/
/// └── last/
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    root: PathBuf,
}

impl CheckpointManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn handle(&self, name: &str) -> CheckpointHandle {
        CheckpointHandle {
            name: name.to_string(),
            dir: self.root.join(name),
        }
    }

    pub fn resolve(&self, target: &ResumeFrom) -> CheckpointHandle {
        match target {
            ResumeFrom::Name(name) => {
                self.recover_interrupted(name);
                self.handle(name)
            }
            ResumeFrom::Path(dir) => CheckpointHandle {
                name: dir
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                dir: dir.clone(),
            },
        }
    }

    fn temp_dir(&self, name: &str) -> PathBuf {
        self.root.join(format!(".{}.tmp", name))
    }

    fn backup_dir(&self, name: &str) -> PathBuf {
        self.root.join(format!(".{}.old", name))
    }

    /// Put back a checkpoint whose swap was interrupted between the two renames.
    fn recover_interrupted(&self, name: &str) {
        let target = self.root.join(name);
        let backup = self.backup_dir(name);
        if !target.exists() && backup.is_dir() {
            match fs::rename(&backup, &target) {
                Ok(()) => log::warn!("restored checkpoint '{}' from an interrupted save", name),
                Err(e) => log::warn!("could not restore checkpoint '{}': {}", name, e),
            }
        }
    }

    /// Write model, optimizer state and metadata, replacing any checkpoint of the same name.
    ///
    /// Everything is written to a hidden sibling first and swapped in with renames, so a
    /// crash leaves either the old or the new checkpoint intact.
    pub fn save<B, O>(
        &self,
        name: &str,
        model: &UNet3d<B>,
        optimizer: &O,
        metadata: &CheckpointMetadata,
    ) -> Result<CheckpointHandle>
    where
        B: AutodiffBackend,
        O: Optimizer<UNet3d<B>, B>,
    {
        fs::create_dir_all(&self.root)?;
        self.recover_interrupted(name);

        let tmp = self.temp_dir(name);
        if tmp.exists() {
            fs::remove_dir_all(&tmp)?;
        }
        fs::create_dir_all(&tmp)?;

        let recorder = CheckpointRecorder::new();
        <CheckpointRecorder as Recorder<B>>::record(&recorder, model.clone().into_record(), tmp.join(MODEL_FILE))
            .map_err(|e| SegError::corrupt(&tmp, format!("failed to write model: {:?}", e)))?;
        <CheckpointRecorder as Recorder<B>>::record(&recorder, optimizer.to_record(), tmp.join(OPTIM_FILE))
            .map_err(|e| SegError::corrupt(&tmp, format!("failed to write optimizer: {:?}", e)))?;
        fs::write(tmp.join(METADATA_FILE), serde_json::to_string_pretty(metadata)?)?;

        let target = self.root.join(name);
        let backup = self.backup_dir(name);
        if backup.exists() {
            fs::remove_dir_all(&backup)?;
        }
        if target.exists() {
            fs::rename(&target, &backup)?;
        }
        fs::rename(&tmp, &target)?;
        if backup.exists() {
            fs::remove_dir_all(&backup)?;
        }

        log::info!(
            "saved checkpoint '{}' (epoch {}, step {}) to {}",
            name,
            metadata.epoch,
            metadata.global_step,
            target.display()
        );
        Ok(self.handle(name))
    }

    pub fn read_metadata(&self, handle: &CheckpointHandle) -> Result<CheckpointMetadata> {
        let path = handle.metadata_path();
        let content = fs::read_to_string(&path)
            .map_err(|e| SegError::corrupt(&path, format!("unreadable metadata: {}", e)))?;
        let metadata: CheckpointMetadata = serde_json::from_str(&content)
            .map_err(|e| SegError::corrupt(&path, format!("invalid metadata: {}", e)))?;

        if metadata.version != FORMAT_VERSION {
            return Err(SegError::corrupt(
                &path,
                format!(
                    "format version {} is not supported (expected {})",
                    metadata.version, FORMAT_VERSION
                ),
            ));
        }
        Ok(metadata)
    }

    /// Restore the weights alone, e.g. for inference on a non-autodiff backend.
    pub fn load_model<B: Backend>(
        &self,
        handle: &CheckpointHandle,
        config: &UNet3dConfig,
        device: &B::Device,
    ) -> Result<(UNet3d<B>, CheckpointMetadata)> {
        if !handle.exists() {
            return Err(SegError::corrupt(&handle.dir, "checkpoint directory not found"));
        }
        let metadata = self.read_metadata(handle)?;
        if &metadata.model != config {
            return Err(SegError::corrupt(
                &handle.dir,
                format!(
                    "model config mismatch: checkpoint has {:?}, current is {:?}",
                    metadata.model, config
                ),
            ));
        }

        let model_path = handle.model_path();
        if !model_path.is_file() {
            return Err(SegError::corrupt(&model_path, "model weights missing"));
        }
        let recorder = CheckpointRecorder::new();
        let record = <CheckpointRecorder as Recorder<B>>::load(&recorder, handle.dir.join(MODEL_FILE), device)
            .map_err(|e| SegError::corrupt(&model_path, format!("unreadable weights: {:?}", e)))?;
        let model = config.init::<B>(device).load_record(record);

        let num_params = model.num_params();
        if num_params != metadata.num_params {
            return Err(SegError::corrupt(
                &model_path,
                format!(
                    "parameter count mismatch: metadata says {}, weights have {}",
                    metadata.num_params, num_params
                ),
            ));
        }

        Ok((model, metadata))
    }

    /// Restore model, optimizer state and metadata.
    pub fn load<B, O>(
        &self,
        handle: &CheckpointHandle,
        config: &UNet3dConfig,
        optimizer: O,
        device: &B::Device,
    ) -> Result<(UNet3d<B>, O, CheckpointMetadata)>
    where
        B: AutodiffBackend,
        O: Optimizer<UNet3d<B>, B>,
    {
        let (model, metadata) = self.load_model::<B>(handle, config, device)?;

        let optim_path = handle.optim_path();
        if !optim_path.is_file() {
            return Err(SegError::corrupt(&optim_path, "optimizer state missing"));
        }
        let recorder = CheckpointRecorder::new();
        let record = <CheckpointRecorder as Recorder<B>>::load::<O::Record>(
            &recorder,
            handle.dir.join(OPTIM_FILE),
            device,
        )
        .map_err(|e| SegError::corrupt(&optim_path, format!("unreadable optimizer state: {:?}", e)))?;

        log::info!(
            "loaded checkpoint '{}' (epoch {}, step {})",
            handle.name,
            metadata.epoch,
            metadata.global_step
        );
        Ok((model, optimizer.load_record(record), metadata))
    }
}

use burn::backend::{Autodiff, NdArray};
use burn::module::{Module, ParamId};
use burn::optim::Optimizer;
use burn::record::{BinBytesRecorder, FullPrecisionSettings, Recorder};
use burn::tensor::backend::AutodiffBackend;
use ndarray::{Array3, Array4};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::Arc;
use tempfile::TempDir;

use tumorseg::data::{
    AugmentationConfig, Case, HostBatch, InMemoryDataset, LabelMap, PatchPair, Volume,
    VolumeSource,
};
use tumorseg::model::{UNet3d, UNet3dConfig};
use tumorseg::training::{ResumeFrom, Trainer, TrainingConfig};

type TestBackend = Autodiff<NdArray>;
type BytesRecorder = BinBytesRecorder<FullPrecisionSettings>;

fn config(dir: &TempDir, patch: usize, model: UNet3dConfig) -> TrainingConfig {
    TrainingConfig {
        patch_size: [patch; 3],
        batch_size: 2,
        model,
        augmentation: AugmentationConfig::disabled(),
        checkpoint_dir: dir.path().join("runs"),
        show_progress: false,
        ..TrainingConfig::default()
    }
}

fn param_bytes<B: burn::tensor::backend::Backend>(model: &UNet3d<B>) -> Vec<u8> {
    let recorder = BytesRecorder::default();
    <BytesRecorder as Recorder<B>>::record(&recorder, model.clone().into_record(), ()).unwrap()
}

/// Serialized optimizer state per parameter.
fn optimizer_bytes<B: AutodiffBackend>(trainer: &Trainer<B>) -> HashMap<ParamId, Vec<u8>> {
    let recorder = BytesRecorder::default();
    trainer
        .optimizer()
        .to_record()
        .into_iter()
        .map(|(id, record)| {
            let bytes = <BytesRecorder as Recorder<B>>::record(&recorder, record, ()).unwrap();
            (id, bytes)
        })
        .collect()
}

fn background_batch(batch: usize, channels: usize, size: usize, seed: u64) -> HostBatch {
    let mut rng = StdRng::seed_from_u64(seed);
    let pairs = (0..batch)
        .map(|i| {
            let image = Array4::from_shape_fn((channels, size, size, size), |_| rng.gen_range(-1.0..1.0));
            let pair = PatchPair {
                image,
                label: Array3::zeros((size, size, size)),
                offset: [0; 3],
            };
            (format!("sample_{}", i), pair)
        })
        .collect();
    HostBatch::from_pairs(pairs).unwrap()
}

#[test]
fn test_single_step_on_background_only_batch() {
    let dir = TempDir::new().unwrap();
    let model = UNet3dConfig::new().with_in_channels(2).with_channels(vec![4, 8]);
    let mut trainer = Trainer::<TestBackend>::new(config(&dir, 32, model), Default::default()).unwrap();

    let batch = background_batch(2, 2, 32, 0);
    assert_eq!(batch.image_dims(), [2, 2, 32, 32, 32]);

    let before = param_bytes(trainer.model());
    let step = trainer.train_step(&batch).unwrap();
    let after = param_bytes(trainer.model());

    assert!(step.loss.is_finite());
    assert!(step.dice_loss >= 0.0 && step.ce_loss >= 0.0);
    assert_ne!(before, after);
    assert_eq!(trainer.context().global_step, 1);
}

#[test]
fn test_overfits_single_cube() {
    let dir = TempDir::new().unwrap();
    let model = UNet3dConfig::new()
        .with_in_channels(1)
        .with_num_classes(2)
        .with_channels(vec![8, 16]);
    let mut train_config = config(&dir, 16, model);
    train_config.learning_rate = 3e-3;
    train_config.batch_size = 1;
    train_config.samples_per_volume = 10;
    train_config.epochs = 30;
    train_config.val_interval = 30;
    train_config.save_interval = 30;

    // 8^3 cube inside a 24^3 volume, so every patch is a real crop
    let label = Array3::from_shape_fn((24, 24, 24), |(z, y, x)| {
        u8::from((8..16).contains(&z) && (8..16).contains(&y) && (8..16).contains(&x))
    });
    let image = Array4::from_shape_fn((1, 24, 24, 24), |(_, z, y, x)| {
        1.0 + 2.0 * f32::from(label[[z, y, x]])
    });
    let case = Case::new(
        "cube",
        Volume::new(image, [1.0; 3]),
        LabelMap::new(label, [1.0; 3]),
    );
    let source: Arc<dyn VolumeSource> = Arc::new(InMemoryDataset::from_cases(vec![case]));
    let ids = vec!["cube".to_string()];

    let mut trainer = Trainer::<TestBackend>::new(train_config, Default::default()).unwrap();
    let summary = trainer.fit(source, &ids, &ids).unwrap();
    assert_eq!(summary.global_step, 300);

    let report = summary
        .history
        .last()
        .and_then(|r| r.validation.as_ref())
        .unwrap();
    assert!(
        report.dice[1] > 0.9,
        "foreground dice {} after overfitting",
        report.dice[1]
    );
}

#[test]
fn test_checkpoint_restores_exact_parameters() {
    let dir = TempDir::new().unwrap();
    let model_config = UNet3dConfig::new()
        .with_in_channels(2)
        .with_num_classes(3)
        .with_channels(vec![4, 8]);
    let train_config = config(&dir, 8, model_config.clone());
    let mut trainer = Trainer::<TestBackend>::new(train_config, Default::default()).unwrap();

    let handle = trainer.save_checkpoint("snapshot").unwrap();
    let saved = param_bytes(trainer.model());

    trainer.train_step(&background_batch(2, 2, 8, 1)).unwrap();
    assert_ne!(param_bytes(trainer.model()), saved);

    let (restored, metadata) = trainer
        .checkpoints()
        .load_model::<TestBackend>(&handle, &model_config, &Default::default())
        .unwrap();
    assert_eq!(param_bytes(&restored), saved);
    assert_eq!(metadata.num_params, restored.num_params());
    assert_eq!(metadata.global_step, 0);
}

#[test]
fn test_resume_restores_model_and_optimizer_state() {
    let dir = TempDir::new().unwrap();
    let model_config = UNet3dConfig::new()
        .with_in_channels(2)
        .with_num_classes(3)
        .with_channels(vec![4, 8]);
    let mut train_config = config(&dir, 8, model_config);
    train_config.resume = Some(ResumeFrom::Name("snapshot".to_string()));
    let mut trainer = Trainer::<TestBackend>::new(train_config, Default::default()).unwrap();

    // one step first so the Adam moments are populated
    trainer.train_step(&background_batch(2, 2, 8, 1)).unwrap();
    trainer.save_checkpoint("snapshot").unwrap();
    let saved_model = param_bytes(trainer.model());
    let saved_optim = optimizer_bytes(&trainer);
    assert!(!saved_optim.is_empty());

    trainer.train_step(&background_batch(2, 2, 8, 2)).unwrap();
    assert_ne!(param_bytes(trainer.model()), saved_model);
    assert_ne!(optimizer_bytes(&trainer), saved_optim);

    trainer.restore().unwrap();
    assert_eq!(param_bytes(trainer.model()), saved_model);
    assert_eq!(optimizer_bytes(&trainer), saved_optim);
    assert_eq!(trainer.context().global_step, 1);
}

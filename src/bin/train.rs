use anyhow::Context;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tumorseg::data::{k_fold_splits, NiftiDataset, VolumeSource};
use tumorseg::training::{MetricReport, ResumeFrom, Trainer, TrainingConfig};

#[cfg(not(feature = "wgpu"))]
type MyBackend = burn::backend::Autodiff<burn::backend::NdArray>;
#[cfg(feature = "wgpu")]
type MyBackend = burn::backend::Autodiff<burn::backend::Wgpu>;

const CLASS_NAMES: [&str; 4] = ["background", "edema", "non-enhancing tumor", "enhancing tumor"];

#[derive(Parser, Debug)]
#[command(author, version, about = "Train the 3D U-Net on a Decathlon-style dataset")]
struct Args {
    /// Training config (written with defaults if missing)
    #[arg(short, long, default_value = "configs/train_config.yaml")]
    config: PathBuf,

    /// Cross-validation fold to train (overrides the config)
    #[arg(long, conflicts_with = "all_folds")]
    fold: Option<usize>,

    /// Train every fold in turn and report the averaged metrics
    #[arg(long)]
    all_folds: bool,

    /// Checkpoint name (`last`, `best`, `epoch_N`) or directory to resume from
    #[arg(long)]
    resume: Option<String>,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = load_or_create(&args.config)?;
    if let Some(fold) = args.fold {
        config.fold = fold;
    }
    if let Some(target) = &args.resume {
        config.resume = Some(resume_target(target));
    }
    config.validate().context("invalid training config")?;

    println!("Training Configuration:");
    println!("  Dataset: {}", config.dataset_root.display());
    println!("  Epochs: {}", config.epochs);
    println!("  Batch size: {}", config.batch_size);
    println!("  Patch size: {:?}", config.patch_size);
    println!("  Learning rate: {}", config.learning_rate);
    println!("  Checkpoints: {}", config.checkpoint_dir.display());
    println!();

    let dataset = NiftiDataset::open(
        &config.dataset_root,
        &config.images_dir,
        &config.labels_dir,
        config.model.in_channels,
        config.model.num_classes,
    )
    .with_context(|| format!("failed to open dataset at {}", config.dataset_root.display()))?;
    let ids = dataset.case_ids().to_vec();
    log::info!("found {} cases", ids.len());
    let source: Arc<dyn VolumeSource> = Arc::new(dataset);

    let device = Default::default();

    if config.num_folds < 2 {
        log::warn!("cross-validation disabled, training on every case without validation");
        let mut trainer = Trainer::<MyBackend>::new(config, device)?;
        let summary = trainer.fit(source, &ids, &[])?;
        println!(
            "Training finished after {} epochs ({:?})",
            summary.epochs_completed, summary.stop_reason
        );
        return Ok(());
    }

    let folds = k_fold_splits(ids.len(), config.num_folds, config.seed)?;
    let selected: Vec<usize> = if args.all_folds {
        (0..folds.len()).collect()
    } else {
        vec![config.fold]
    };

    let mut reports = Vec::new();
    for fold_index in selected {
        let fold = &folds[fold_index];
        let train_ids: Vec<String> = fold.train.iter().map(|&i| ids[i].clone()).collect();
        let val_ids: Vec<String> = fold.val.iter().map(|&i| ids[i].clone()).collect();

        let mut fold_config = config.clone();
        fold_config.fold = fold_index;
        fold_config.checkpoint_dir = config.checkpoint_dir.join(format!("fold_{}", fold_index));

        println!(
            "Fold {}/{}: {} training / {} validation cases",
            fold_index + 1,
            folds.len(),
            train_ids.len(),
            val_ids.len()
        );

        let mut trainer = Trainer::<MyBackend>::new(fold_config, device.clone())?;
        let summary = trainer
            .fit(source.clone(), &train_ids, &val_ids)
            .with_context(|| format!("training fold {} failed", fold_index))?;

        match summary.best_report() {
            Some(report) => {
                print_report(&format!("Fold {} (best epoch)", fold_index), report);
                reports.push(report.clone());
            }
            None => log::warn!("fold {} finished without a validation report", fold_index),
        }
    }

    if reports.len() > 1 {
        if let Some(mean) = MetricReport::average(&reports) {
            print_report(&format!("Mean over {} folds", reports.len()), &mean);
        }
    }

    Ok(())
}

fn load_or_create(path: &Path) -> anyhow::Result<TrainingConfig> {
    if path.exists() {
        log::info!("loading config from {}", path.display());
        return TrainingConfig::from_yaml(path)
            .with_context(|| format!("failed to read {}", path.display()));
    }

    let config = TrainingConfig::default();
    config
        .save(path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    println!("Created default config at {}", path.display());
    Ok(config)
}

fn resume_target(value: &str) -> ResumeFrom {
    let path = Path::new(value);
    if path.components().count() > 1 || path.is_absolute() {
        ResumeFrom::Path(path.to_path_buf())
    } else {
        ResumeFrom::Name(value.to_string())
    }
}

fn class_name(class: usize, num_classes: usize) -> String {
    if num_classes == CLASS_NAMES.len() {
        CLASS_NAMES[class].to_string()
    } else {
        format!("class {}", class)
    }
}

fn print_report(title: &str, report: &MetricReport) {
    println!("\n{}", title);
    println!("  {:<22} {:>8} {:>10}", "class", "dice", "hd95 (mm)");
    for (class, dice) in report.dice.iter().enumerate() {
        let hd = match report.hd95.get(class).copied().flatten() {
            Some(h) => format!("{:.2}", h),
            None => "n/a".to_string(),
        };
        println!(
            "  {:<22} {:>8.4} {:>10}",
            class_name(class, report.dice.len()),
            dice,
            hd
        );
    }
    println!("  mean foreground dice: {:.4}", report.mean_foreground_dice());
}


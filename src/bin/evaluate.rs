use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;

use tumorseg::data::preview::write_slice_png;
use tumorseg::data::{k_fold_splits, NiftiDataset, Normalizer, VolumeSource};
use tumorseg::training::{CheckpointManager, Evaluator, ResumeFrom, SlidingWindow, TrainingConfig};

#[cfg(not(feature = "wgpu"))]
type MyBackend = burn::backend::NdArray;
#[cfg(feature = "wgpu")]
type MyBackend = burn::backend::Wgpu;

#[derive(Parser, Debug)]
#[command(author, version, about = "Score a checkpoint with sliding-window inference")]
struct Args {
    /// Training config the checkpoint was produced with
    #[arg(short, long, default_value = "configs/train_config.yaml")]
    config: PathBuf,

    /// Checkpoint directory
    #[arg(short = 'w', long, default_value = "runs/train/fold_0/best")]
    checkpoint: PathBuf,

    /// Only score the validation cases of this fold
    #[arg(long)]
    fold: Option<usize>,

    /// Write one PNG per case with the prediction overlaid
    #[arg(long)]
    preview_dir: Option<PathBuf>,

    /// Modality shown in previews
    #[arg(long, default_value_t = 0)]
    channel: usize,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = TrainingConfig::from_yaml(&args.config)
        .with_context(|| format!("failed to read {}", args.config.display()))?;
    config.model.validate()?;
    let device = Default::default();

    let manager = CheckpointManager::new(&config.checkpoint_dir);
    let handle = manager.resolve(&ResumeFrom::Path(args.checkpoint.clone()));
    let (model, metadata) = manager
        .load_model::<MyBackend>(&handle, &config.model, &device)
        .with_context(|| format!("failed to load {}", args.checkpoint.display()))?;
    println!(
        "Loaded checkpoint '{}' (epoch {}, best {:?})",
        metadata.name, metadata.epoch, metadata.best_metric
    );

    let dataset = NiftiDataset::open(
        &config.dataset_root,
        &config.images_dir,
        &config.labels_dir,
        config.model.in_channels,
        config.model.num_classes,
    )?;
    let all_ids = dataset.case_ids().to_vec();
    let ids: Vec<String> = match args.fold {
        Some(fold) => {
            let folds = k_fold_splits(all_ids.len(), config.num_folds, config.seed)?;
            let fold = folds
                .get(fold)
                .with_context(|| format!("fold {} out of range", fold))?;
            fold.val.iter().map(|&i| all_ids[i].clone()).collect()
        }
        None => all_ids,
    };

    let evaluator = Evaluator::new(
        SlidingWindow::new(config.patch_size, config.sw_overlap, config.batch_size),
        Normalizer::new(config.normalization, config.background_value),
        config.model.num_classes,
    );
    if let Some(dir) = &args.preview_dir {
        std::fs::create_dir_all(dir)?;
    }

    let report = evaluator.evaluate_with(
        &model,
        &dataset,
        &ids,
        config.skip_corrupt_cases,
        &device,
        |case, result| {
            let fg: Vec<String> = result.metrics.dice[1..]
                .iter()
                .map(|d| format!("{:.3}", d))
                .collect();
            println!("  {:<16} dice [{}]", case.id, fg.join(", "));

            match &args.preview_dir {
                Some(dir) => write_slice_png(
                    dir.join(format!("{}.png", case.id)),
                    case.volume.data(),
                    args.channel,
                    case.volume.spatial_shape()[2] / 2,
                    Some(&result.prediction),
                ),
                None => Ok(()),
            }
        },
    )?;

    println!("\nEvaluated {} cases", report.num_cases);
    for (class, dice) in report.dice.iter().enumerate() {
        let hd = report.hd95[class]
            .map(|h| format!("{:.2} mm", h))
            .unwrap_or_else(|| "n/a".to_string());
        println!("  class {}: dice {:.4}, hd95 {}", class, dice, hd);
    }
    println!("  mean foreground dice: {:.4}", report.mean_foreground_dice());
    if let Some(loss) = report.loss {
        println!("  cross-entropy: {:.4}", loss);
    }

    Ok(())
}

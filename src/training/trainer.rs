use burn::module::AutodiffModule;
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::decay::WeightDecayConfig;
use burn::optim::{Adam, AdamConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use indicatif::{ProgressBar, ProgressStyle};
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;

use crate::data::dataloader::{HostBatch, LoaderSettings, PatchLoader};
use crate::data::dataset::{InMemoryDataset, VolumeSource};
use crate::data::normalize::Normalizer;
use crate::data::sampler::PatchSampler;
use crate::data::transforms::AugmentationEngine;
use crate::error::{Result, SegError};
use crate::model::{SegmentationLoss, UNet3d};
use crate::training::checkpoint::{CheckpointHandle, CheckpointManager, CheckpointMetadata};
use crate::training::config::TrainingConfig;
use crate::training::early_stopping::EarlyStopping;
use crate::training::evaluator::{Evaluator, SlidingWindow};
use crate::training::metrics::MetricReport;
use crate::training::state::{
    CancelToken, EpochReport, StopReason, TrainingContext, TrainingPhase, TrainingSummary,
};

const METRICS_FILE: &str = "metrics.jsonl";

/// Loss values of one optimisation step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOutput {
    pub loss: f32,
    pub dice_loss: f32,
    pub ce_loss: f32,
}

#[derive(Debug, Default)]
struct EpochTotals {
    loss: f32,
    dice_loss: f32,
    ce_loss: f32,
    batches: usize,
}

impl EpochTotals {
    fn add(&mut self, step: StepOutput) {
        self.loss += step.loss;
        self.dice_loss += step.dice_loss;
        self.ce_loss += step.ce_loss;
        self.batches += 1;
    }

    fn mean(&self) -> (f32, f32, f32) {
        let n = self.batches.max(1) as f32;
        (self.loss / n, self.dice_loss / n, self.ce_loss / n)
    }
}

pub struct Trainer<B: AutodiffBackend> {
    model: UNet3d<B>,
    optimizer: OptimizerAdaptor<Adam, UNet3d<B>, B>,
    loss_fn: SegmentationLoss,
    config: TrainingConfig,
    device: B::Device,
    context: TrainingContext,
    early_stopping: EarlyStopping,
    checkpoints: CheckpointManager,
    cancel: CancelToken,
}

impl<B: AutodiffBackend> Trainer<B> {
    /// Validate `config`, seed the backend and build a fresh model.
    pub fn new(config: TrainingConfig, device: B::Device) -> Result<Self> {
        config.validate()?;
        B::seed(config.seed);

        let model = config.model.init::<B>(&device);
        let optimizer = AdamConfig::new()
            .with_weight_decay(Some(WeightDecayConfig::new(config.weight_decay)))
            .init();

        log::info!(
            "initialised U-Net with {} parameters (stages {:?})",
            model.num_params(),
            config.model.channels
        );

        Ok(Self {
            model,
            optimizer,
            loss_fn: SegmentationLoss::new(config.loss.clone()),
            early_stopping: EarlyStopping::new(config.patience, config.min_delta),
            checkpoints: CheckpointManager::new(&config.checkpoint_dir),
            context: TrainingContext::new(config.seed),
            cancel: CancelToken::new(),
            config,
            device,
        })
    }

    pub fn model(&self) -> &UNet3d<B> {
        &self.model
    }

    pub fn optimizer(&self) -> &OptimizerAdaptor<Adam, UNet3d<B>, B> {
        &self.optimizer
    }

    pub fn into_model(self) -> UNet3d<B> {
        self.model
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn context(&self) -> &TrainingContext {
        &self.context
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    /// Handle for stopping [`Self::fit`] from another thread.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Restore the configured resume target, if any.
    ///
    /// A missing target starts fresh. A target that exists but cannot be restored is
    /// fatal unless `allow_fresh_on_corrupt` is set.
    pub fn restore(&mut self) -> Result<()> {
        let Some(target) = self.config.resume.clone() else {
            return Ok(());
        };
        let handle = self.checkpoints.resolve(&target);
        if !handle.exists() {
            log::warn!(
                "resume target {} not found, starting fresh",
                handle.dir.display()
            );
            return Ok(());
        }

        match self.checkpoints.load::<B, _>(
            &handle,
            &self.config.model,
            self.optimizer.clone(),
            &self.device,
        ) {
            Ok((model, optimizer, metadata)) => {
                self.model = model;
                self.optimizer = optimizer;
                self.context = TrainingContext::resumed(
                    self.config.seed,
                    metadata.epoch,
                    metadata.global_step,
                    metadata.best_metric,
                    metadata.best_epoch,
                );
                self.early_stopping = EarlyStopping::new(self.config.patience, self.config.min_delta)
                    .with_best(metadata.best_metric);
                log::info!(
                    "resuming after epoch {} (step {}, best {:?})",
                    metadata.epoch,
                    metadata.global_step,
                    metadata.best_metric
                );
                Ok(())
            }
            Err(e @ SegError::CheckpointCorruption { .. }) if self.config.allow_fresh_on_corrupt => {
                log::warn!("{}; starting fresh as configured", e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Run the training state machine until the epoch budget, early stopping or cancellation.
    pub fn fit(
        &mut self,
        source: Arc<dyn VolumeSource>,
        train_ids: &[String],
        val_ids: &[String],
    ) -> Result<TrainingSummary> {
        if train_ids.is_empty() {
            return Err(SegError::config("no training cases"));
        }
        self.context.begin_run();
        self.restore()?;
        std::fs::create_dir_all(&self.config.checkpoint_dir)?;

        let source: Arc<dyn VolumeSource> = if self.config.cache_volumes {
            let ids: Vec<String> = train_ids.iter().chain(val_ids).cloned().collect();
            log::info!("caching {} volumes in memory", ids.len());
            Arc::new(InMemoryDataset::cache(
                source.as_ref(),
                &ids,
                self.config.skip_corrupt_cases,
            )?)
        } else {
            source
        };

        let loader = self.build_loader(source.clone());
        let evaluator = self.build_evaluator();
        let first_epoch = self.context.epoch + 1;
        let mut stop_reason = StopReason::EpochBudget;

        log::info!(
            "training epochs {}..={} on {} cases, validating on {}",
            first_epoch,
            self.config.epochs,
            train_ids.len(),
            val_ids.len()
        );

        for epoch in first_epoch..=self.config.epochs {
            if self.cancel.is_cancelled() {
                stop_reason = StopReason::Cancelled;
                break;
            }

            self.context.advance(TrainingPhase::TrainingEpoch);
            let started = Instant::now();
            let Some(totals) = self.train_epoch(&loader, train_ids, epoch)? else {
                stop_reason = StopReason::Cancelled;
                break;
            };

            let boundary = epoch % self.config.val_interval == 0 || epoch == self.config.epochs;
            let validation = if boundary && !val_ids.is_empty() {
                self.context.advance(TrainingPhase::Validating);
                Some(self.validate(&evaluator, source.as_ref(), val_ids)?)
            } else {
                None
            };

            self.context.epoch = epoch;
            self.context.advance(TrainingPhase::Checkpointing);
            self.checkpoint(epoch, boundary, validation.as_ref())?;

            let (train_loss, train_dice_loss, train_ce_loss) = totals.mean();
            let report = EpochReport {
                epoch,
                global_step: self.context.global_step,
                train_loss,
                train_dice_loss,
                train_ce_loss,
                batches: totals.batches,
                validation,
                seconds: started.elapsed().as_secs_f32(),
            };
            self.log_epoch(&report);
            self.append_metrics(&report)?;

            let stalled = report
                .validation
                .as_ref()
                .is_some_and(|v| self.early_stopping.should_stop(v.mean_foreground_dice()));
            self.context.history.push(report);
            if stalled {
                stop_reason = StopReason::EarlyStopping;
                break;
            }
        }

        self.context.advance(TrainingPhase::Terminated);
        log::info!(
            "training finished after epoch {} ({:?}), best foreground dice {:?} at epoch {:?}",
            self.context.epoch,
            stop_reason,
            self.context.best_metric,
            self.context.best_epoch
        );

        Ok(TrainingSummary {
            epochs_completed: self.context.epoch,
            global_step: self.context.global_step,
            best_metric: self.context.best_metric,
            best_epoch: self.context.best_epoch,
            stop_reason,
            history: self.context.history.clone(),
        })
    }

    /// One forward/backward/update on a host batch.
    pub fn train_step(&mut self, batch: &HostBatch) -> Result<StepOutput> {
        let num_classes = self.config.model.num_classes;
        let images = batch.images_tensor::<B>(&self.device);
        let targets = batch.targets_tensor::<B>(num_classes, &self.device)?;

        let logits = self.model.forward_logits(images);
        let output = self.loss_fn.forward(logits, targets);
        let (loss, dice_loss, ce_loss) = output.values();

        self.context.global_step += 1;
        if !loss.is_finite() {
            return Err(SegError::Divergence {
                epoch: self.context.epoch + 1,
                step: self.context.global_step,
                loss,
            });
        }

        let grads = output.total.backward();
        let grads = GradientsParams::from_grads(grads, &self.model);
        self.model = self
            .optimizer
            .step(self.config.learning_rate, self.model.clone(), grads);

        log::debug!(
            "step {}: loss={:.4} dice={:.4} ce={:.4} fg={:.3}",
            self.context.global_step,
            loss,
            dice_loss,
            ce_loss,
            batch.foreground_fraction()
        );

        Ok(StepOutput {
            loss,
            dice_loss,
            ce_loss,
        })
    }

    /// Full-volume validation with the forward-only copy of the model.
    pub fn validate(
        &self,
        evaluator: &Evaluator,
        source: &dyn VolumeSource,
        ids: &[String],
    ) -> Result<MetricReport> {
        let model = self.model.valid();
        evaluator.evaluate::<B::InnerBackend>(
            &model,
            source,
            ids,
            self.config.skip_corrupt_cases,
            &self.device,
        )
    }

    /// Save the current state under `name`.
    pub fn save_checkpoint(&self, name: &str) -> Result<CheckpointHandle> {
        let metadata = CheckpointMetadata::new(
            name,
            &self.context,
            &self.config.model,
            self.model.num_params(),
        );
        self.checkpoints
            .save(name, &self.model, &self.optimizer, &metadata)
    }

    pub fn build_evaluator(&self) -> Evaluator {
        Evaluator::new(
            SlidingWindow::new(
                self.config.patch_size,
                self.config.sw_overlap,
                self.config.batch_size,
            ),
            self.normalizer(),
            self.config.model.num_classes,
        )
    }

    fn normalizer(&self) -> Normalizer {
        Normalizer::new(self.config.normalization, self.config.background_value)
    }

    fn build_loader(&self, source: Arc<dyn VolumeSource>) -> PatchLoader {
        PatchLoader::new(
            source,
            self.normalizer(),
            PatchSampler::new(
                self.config.patch_size,
                self.config.foreground_prob,
                self.config.background_value,
            ),
            AugmentationEngine::new(self.config.augmentation.clone(), self.config.background_value),
            LoaderSettings {
                in_channels: self.config.model.in_channels,
                num_classes: self.config.model.num_classes,
                batch_size: self.config.batch_size,
                samples_per_volume: self.config.samples_per_volume,
                prefetch_batches: self.config.prefetch_batches,
                skip_corrupt_cases: self.config.skip_corrupt_cases,
            },
        )
    }

    /// `None` when cancelled part way.
    fn train_epoch(
        &mut self,
        loader: &PatchLoader,
        ids: &[String],
        epoch: usize,
    ) -> Result<Option<EpochTotals>> {
        let seed = self.context.next_epoch_seed();
        let pb = self.progress_bar(loader.batches_per_epoch(ids.len()));
        pb.set_message(format!("epoch {}/{}", epoch, self.config.epochs));

        let mut totals = EpochTotals::default();
        for batch in loader.epoch(ids.to_vec(), seed, self.cancel.clone())? {
            if self.cancel.is_cancelled() {
                break;
            }
            let step = self.train_step(&batch?)?;
            totals.add(step);

            pb.inc(1);
            pb.set_message(format!(
                "epoch {}/{} loss={:.4}",
                epoch, self.config.epochs, step.loss
            ));
        }

        if self.cancel.is_cancelled() {
            pb.abandon_with_message(format!("epoch {} cancelled", epoch));
            log::warn!("cancelled during epoch {}", epoch);
            return Ok(None);
        }
        pb.finish_and_clear();

        if totals.batches == 0 {
            return Err(SegError::config(format!(
                "epoch {} produced no training batches",
                epoch
            )));
        }
        Ok(Some(totals))
    }

    fn checkpoint(
        &mut self,
        epoch: usize,
        boundary: bool,
        validation: Option<&MetricReport>,
    ) -> Result<()> {
        if let Some(report) = validation {
            let score = report.mean_foreground_dice();
            if self.context.improve(score, epoch, self.config.min_delta) {
                log::info!("foreground dice improved to {:.4}", score);
                self.save_checkpoint("best")?;
            }
        }
        if epoch % self.config.save_interval == 0 {
            self.save_checkpoint(&format!("epoch_{}", epoch))?;
        }
        if boundary {
            self.save_checkpoint("last")?;
        }
        Ok(())
    }

    fn progress_bar(&self, len: usize) -> ProgressBar {
        if !self.config.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(len as u64);
        if let Ok(style) =
            ProgressStyle::default_bar().template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
        {
            pb.set_style(style);
        }
        pb
    }

    fn log_epoch(&self, report: &EpochReport) {
        log::info!(
            "epoch {}/{}: loss={:.4} (dice {:.4}, ce {:.4}) over {} batches in {:.1}s",
            report.epoch,
            self.config.epochs,
            report.train_loss,
            report.train_dice_loss,
            report.train_ce_loss,
            report.batches,
            report.seconds
        );
        if let Some(val) = &report.validation {
            log::info!(
                "  validation: dice {:?}, hd95 {:?}, mean fg dice {:.4}",
                val.dice,
                val.hd95,
                val.mean_foreground_dice()
            );
        }
    }

    fn append_metrics(&self, report: &EpochReport) -> Result<()> {
        let path = self.config.checkpoint_dir.join(METRICS_FILE);
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{}", serde_json::to_string(report)?)?;
        Ok(())
    }
}

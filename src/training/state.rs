use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::training::metrics::MetricReport;

/// Cooperative stop flag shared between the caller, the trainer and the prefetch worker.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrainingPhase {
    Initializing,
    TrainingEpoch,
    Validating,
    Checkpointing,
    Terminated,
}

impl TrainingPhase {
    /// Whether the loop may move from `self` to `next`.
    pub fn can_advance_to(self, next: TrainingPhase) -> bool {
        use TrainingPhase::*;
        matches!(
            (self, next),
            (Initializing, TrainingEpoch)
                | (TrainingEpoch, Validating)
                | (TrainingEpoch, Checkpointing)
                | (Validating, Checkpointing)
                | (Checkpointing, TrainingEpoch)
                | (_, Terminated)
        )
    }
}

impl fmt::Display for TrainingPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TrainingPhase::Initializing => "initializing",
            TrainingPhase::TrainingEpoch => "training",
            TrainingPhase::Validating => "validating",
            TrainingPhase::Checkpointing => "checkpointing",
            TrainingPhase::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Why the loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EpochBudget,
    EarlyStopping,
    Cancelled,
}

/// Summary of one epoch, appended to `metrics.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochReport {
    pub epoch: usize,
    pub global_step: usize,
    pub train_loss: f32,
    pub train_dice_loss: f32,
    pub train_ce_loss: f32,
    pub batches: usize,
    pub validation: Option<MetricReport>,
    pub seconds: f32,
}

/// Result of [`crate::training::Trainer::fit`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSummary {
    pub epochs_completed: usize,
    pub global_step: usize,
    pub best_metric: Option<f32>,
    pub best_epoch: Option<usize>,
    pub stop_reason: StopReason,
    pub history: Vec<EpochReport>,
}

impl TrainingSummary {
    /// Validation report of the best epoch.
    pub fn best_report(&self) -> Option<&MetricReport> {
        let epoch = self.best_epoch?;
        self.history
            .iter()
            .find(|r| r.epoch == epoch)
            .and_then(|r| r.validation.as_ref())
    }
}

/// Mutable run state owned by the trainer.
#[derive(Debug)]
pub struct TrainingContext {
    /// Last completed epoch (0 before the first).
    pub epoch: usize,
    pub global_step: usize,
    pub best_metric: Option<f32>,
    pub best_epoch: Option<usize>,
    pub rng: StdRng,
    pub history: Vec<EpochReport>,
    phase: TrainingPhase,
}

impl TrainingContext {
    pub fn new(seed: u64) -> Self {
        Self {
            epoch: 0,
            global_step: 0,
            best_metric: None,
            best_epoch: None,
            rng: StdRng::seed_from_u64(seed),
            history: Vec::new(),
            phase: TrainingPhase::Initializing,
        }
    }

    /// Continue from a checkpoint; the RNG stream is re-derived from the seed and epoch.
    pub fn resumed(
        seed: u64,
        epoch: usize,
        global_step: usize,
        best_metric: Option<f32>,
        best_epoch: Option<usize>,
    ) -> Self {
        let mut ctx = Self::new(seed ^ (epoch as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
        ctx.epoch = epoch;
        ctx.global_step = global_step;
        ctx.best_metric = best_metric;
        ctx.best_epoch = best_epoch;
        ctx
    }

    pub fn phase(&self) -> TrainingPhase {
        self.phase
    }

    /// Back to `Initializing` for another run; counters, best metric and history are kept.
    pub fn begin_run(&mut self) {
        if self.phase != TrainingPhase::Initializing {
            log::debug!("phase {} -> {}", self.phase, TrainingPhase::Initializing);
            self.phase = TrainingPhase::Initializing;
        }
    }

    pub fn advance(&mut self, next: TrainingPhase) {
        debug_assert!(
            self.phase.can_advance_to(next),
            "illegal transition {} -> {}",
            self.phase,
            next
        );
        log::debug!("phase {} -> {}", self.phase, next);
        self.phase = next;
    }

    /// Seed for the next epoch's prefetch worker.
    pub fn next_epoch_seed(&mut self) -> u64 {
        self.rng.gen()
    }

    /// Record `metric` if it beats the best so far by more than `min_delta`.
    pub fn improve(&mut self, metric: f32, epoch: usize, min_delta: f32) -> bool {
        let better = match self.best_metric {
            None => metric.is_finite(),
            Some(best) => metric > best + min_delta,
        };
        if better {
            self.best_metric = Some(metric);
            self.best_epoch = Some(epoch);
        }
        better
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_transitions() {
        use TrainingPhase::*;
        assert!(Initializing.can_advance_to(TrainingEpoch));
        assert!(TrainingEpoch.can_advance_to(Validating));
        assert!(Validating.can_advance_to(Checkpointing));
        assert!(Checkpointing.can_advance_to(TrainingEpoch));
        assert!(Validating.can_advance_to(Terminated));
        assert!(!Initializing.can_advance_to(Validating));
        assert!(!Terminated.can_advance_to(TrainingEpoch));
    }

    #[test]
    fn test_cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_improve_tracks_maximum() {
        let mut ctx = TrainingContext::new(0);
        assert!(ctx.improve(0.5, 1, 0.0));
        assert!(!ctx.improve(0.4, 2, 0.0));
        assert!(ctx.improve(0.6, 3, 0.0));
        assert!(!ctx.improve(0.61, 4, 0.05));
        assert_eq!(ctx.best_metric, Some(0.6));
        assert_eq!(ctx.best_epoch, Some(3));
    }

    #[test]
    fn test_epoch_seeds_are_reproducible() {
        let mut a = TrainingContext::new(42);
        let mut b = TrainingContext::new(42);
        assert_eq!(a.next_epoch_seed(), b.next_epoch_seed());
        assert_ne!(a.next_epoch_seed(), TrainingContext::new(43).next_epoch_seed());
    }
}

use burn::prelude::*;
use burn::tensor::activation::log_softmax;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SegError};

/// Floor applied to probabilities before taking their log.
const LOG_EPS: f32 = 1e-7;

/// Weights of the composite segmentation loss.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LossConfig {
    /// Weight of the soft Dice term (alpha).
    pub dice_weight: f32,
    /// Weight of the cross-entropy term (beta).
    pub ce_weight: f32,
    /// Dice weight of class 0; foreground classes weigh 1.
    pub background_weight: f32,
    /// Additive smoothing in the Dice ratio.
    pub smooth: f32,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            dice_weight: 1.0,
            ce_weight: 1.0,
            background_weight: 0.0,
            smooth: 1e-5,
        }
    }
}

impl LossConfig {
    pub fn validate(&self) -> Result<()> {
        let weights = [self.dice_weight, self.ce_weight, self.background_weight];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(SegError::config("loss weights must be finite and non-negative"));
        }
        if self.dice_weight == 0.0 && self.ce_weight == 0.0 {
            return Err(SegError::config("at least one loss term needs a positive weight"));
        }
        if !(self.smooth.is_finite() && self.smooth > 0.0) {
            return Err(SegError::config("dice smoothing must be positive"));
        }
        Ok(())
    }
}

/// Total loss and its two components, all `[1]`.
#[derive(Debug, Clone)]
pub struct LossOutput<B: Backend> {
    pub total: Tensor<B, 1>,
    pub dice: Tensor<B, 1>,
    pub ce: Tensor<B, 1>,
}

impl<B: Backend> LossOutput<B> {
    /// `(total, dice, ce)` as host scalars.
    pub fn values(&self) -> (f32, f32, f32) {
        (
            self.total.clone().into_scalar().elem::<f32>(),
            self.dice.clone().into_scalar().elem::<f32>(),
            self.ce.clone().into_scalar().elem::<f32>(),
        )
    }
}

/// `dice_weight * DiceLoss + ce_weight * CrossEntropy`
#[derive(Debug, Clone, Default)]
pub struct SegmentationLoss {
    config: LossConfig,
}

impl SegmentationLoss {
    pub fn new(config: LossConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LossConfig {
        &self.config
    }

    /// `logits`: `[B, K, D, H, W]` raw scores. `targets`: one-hot of the same shape.
    pub fn forward<B: Backend>(&self, logits: Tensor<B, 5>, targets: Tensor<B, 5>) -> LossOutput<B> {
        let log_probs = log_softmax(logits, 1);
        let probs = log_probs.clone().exp();

        let dice = self.dice_loss(probs, targets.clone());
        let ce = (targets * log_probs).sum_dim(1).mean().neg();

        let total = dice.clone() * self.config.dice_weight + ce.clone() * self.config.ce_weight;
        LossOutput { total, dice, ce }
    }

    /// Soft Dice loss per sample and class, `[B, K]`, each in `[0, 1]`.
    pub fn dice_per_class<B: Backend>(&self, probs: Tensor<B, 5>, targets: Tensor<B, 5>) -> Tensor<B, 2> {
        let [b, k, d, h, w] = probs.dims();
        let probs = probs.reshape([b, k, d * h * w]);
        let targets = targets.reshape([b, k, d * h * w]);

        let intersection = (probs.clone() * targets.clone()).sum_dim(2).reshape([b, k]);
        let cardinality = (probs.sum_dim(2) + targets.sum_dim(2)).reshape([b, k]);

        let smooth = self.config.smooth;
        let score = (intersection * 2.0 + smooth) / (cardinality + smooth);
        score.neg() + 1.0
    }

    /// Class-weighted mean of [`Self::dice_per_class`].
    pub fn dice_loss<B: Backend>(&self, probs: Tensor<B, 5>, targets: Tensor<B, 5>) -> Tensor<B, 1> {
        let device = probs.device();
        let [b, k, _, _, _] = probs.dims();

        let mut weights = vec![1.0f32; k];
        weights[0] = self.config.background_weight;
        let total_weight: f32 = weights.iter().sum::<f32>() * b as f32;
        let weights = Tensor::<B, 2>::from_data(TensorData::new(weights, [1, k]), &device);

        let per_class = self.dice_per_class(probs, targets);
        (per_class * weights).sum() / total_weight.max(f32::EPSILON)
    }

    /// Mean voxel-wise `-log p_true` from probabilities (clamped away from 0).
    pub fn cross_entropy_from_probs<B: Backend>(
        &self,
        probs: Tensor<B, 5>,
        targets: Tensor<B, 5>,
    ) -> Tensor<B, 1> {
        (targets * probs.clamp_min(LOG_EPS).log())
            .sum_dim(1)
            .mean()
            .neg()
    }
}

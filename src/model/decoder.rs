use burn::prelude::*;

use crate::model::blocks::{ConvBlock, ConvNormAct, Upsample3d};
use crate::model::encoder::EncoderFeatures;

/// Upsample, reduce channels, concatenate the skip, refine.
#[derive(Module, Debug)]
pub struct UpStage<B: Backend> {
    scale_factor: usize,
    reduce: ConvNormAct<B>,
    fuse: ConvBlock<B>,
}

impl<B: Backend> UpStage<B> {
    pub fn new(device: &B::Device, in_channels: usize, skip_channels: usize, dropout: f64) -> Self {
        Self {
            scale_factor: 2,
            reduce: ConvNormAct::new(device, in_channels, skip_channels, 1, 1),
            fuse: ConvBlock::new(device, 2 * skip_channels, skip_channels, 1, dropout),
        }
    }

    pub fn forward(&self, x: Tensor<B, 5>, skip: Tensor<B, 5>) -> Tensor<B, 5> {
        let x = Upsample3d::new(self.scale_factor).forward(x); // [B, C_in, 2D, 2H, 2W]
        let x = self.reduce.forward(x); // [B, C_skip, 2D, 2H, 2W]
        let x = Tensor::cat(vec![x, skip], 1); // [B, 2*C_skip, 2D, 2H, 2W]
        self.fuse.forward(x)
    }
}

#[derive(Module, Debug)]
pub struct Decoder<B: Backend> {
    /// Deepest stage first.
    stages: Vec<UpStage<B>>,
}

impl<B: Backend> Decoder<B> {
    pub fn new(device: &B::Device, channels: &[usize], dropout: f64) -> Self {
        let stages = channels
            .windows(2)
            .rev()
            .map(|pair| UpStage::new(device, pair[1], pair[0], dropout))
            .collect();

        Self { stages }
    }

    /// Consumes the skips deepest first; returns full-resolution features.
    pub fn forward(&self, features: EncoderFeatures<B>) -> Tensor<B, 5> {
        let EncoderFeatures {
            bottleneck,
            mut skips,
        } = features;

        let mut x = bottleneck;
        for stage in &self.stages {
            match skips.pop() {
                Some(skip) => x = stage.forward(x, skip),
                None => break,
            }
        }
        x
    }
}

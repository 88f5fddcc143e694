use burn::prelude::*;

use crate::model::blocks::ConvBlock;

/// Multi-scale encoder output handed to the decoder.
#[derive(Debug, Clone)]
pub struct EncoderFeatures<B: Backend> {
    /// Deepest (lowest resolution) feature map.
    pub bottleneck: Tensor<B, 5>,
    /// Skip features, shallowest first.
    pub skips: Vec<Tensor<B, 5>>,
}

#[derive(Module, Debug)]
pub struct Encoder<B: Backend> {
    stages: Vec<ConvBlock<B>>,
}

impl<B: Backend> Encoder<B> {
    /// One stage per entry of `channels`; every stage after the first halves the extent.
    pub fn new(device: &B::Device, in_channels: usize, channels: &[usize], dropout: f64) -> Self {
        let mut stages = Vec::with_capacity(channels.len());
        let mut prev = in_channels;

        for (i, &out) in channels.iter().enumerate() {
            let stride = if i == 0 { 1 } else { 2 };
            stages.push(ConvBlock::new(device, prev, out, stride, dropout));
            prev = out;
        }

        Self { stages }
    }

    pub fn forward(&self, x: Tensor<B, 5>) -> EncoderFeatures<B> {
        let mut skips = Vec::with_capacity(self.stages.len().saturating_sub(1));
        let mut x = x;

        for (i, stage) in self.stages.iter().enumerate() {
            x = stage.forward(x);
            if i + 1 < self.stages.len() {
                skips.push(x.clone());
            }
        }

        EncoderFeatures {
            bottleneck: x,
            skips,
        }
    }
}

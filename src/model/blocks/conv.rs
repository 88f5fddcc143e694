use burn::nn::conv::{Conv3d, Conv3dConfig};
use burn::nn::{Dropout, DropoutConfig, InstanceNorm, InstanceNormConfig, PaddingConfig3d};
use burn::prelude::*;
use burn::tensor::activation;

/// Conv3d -> InstanceNorm -> SiLU.
#[derive(Module, Debug)]
pub struct ConvNormAct<B: Backend> {
    conv: Conv3d<B>,
    norm: InstanceNorm<B>,
}

impl<B: Backend> ConvNormAct<B> {
    pub fn new(
        device: &B::Device,
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
    ) -> Self {
        let padding = kernel_size / 2;

        Self {
            conv: Conv3dConfig::new(
                [in_channels, out_channels],
                [kernel_size, kernel_size, kernel_size],
            )
            .with_stride([stride, stride, stride])
            .with_padding(PaddingConfig3d::Explicit(padding, padding, padding))
            .with_bias(false)
            .init(device),
            norm: InstanceNormConfig::new(out_channels)
                .with_affine(true)
                .init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 5>) -> Tensor<B, 5> {
        let x = self.conv.forward(x);
        let x = self.norm.forward(x);
        activation::silu(x)
    }
}

/// Two 3x3x3 [`ConvNormAct`] units; the first carries the stride.
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    first: ConvNormAct<B>,
    second: ConvNormAct<B>,
    dropout: Option<Dropout>,
}

impl<B: Backend> ConvBlock<B> {
    pub fn new(
        device: &B::Device,
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        dropout: f64,
    ) -> Self {
        Self {
            first: ConvNormAct::new(device, in_channels, out_channels, 3, stride),
            second: ConvNormAct::new(device, out_channels, out_channels, 3, 1),
            dropout: (dropout > 0.0).then(|| DropoutConfig::new(dropout).init()),
        }
    }

    pub fn forward(&self, x: Tensor<B, 5>) -> Tensor<B, 5> {
        let x = self.first.forward(x);
        let x = match &self.dropout {
            Some(dropout) => dropout.forward(x),
            None => x,
        };
        self.second.forward(x)
    }
}

use burn::config::Config;
use burn::prelude::*;
use burn::tensor::activation::softmax;

use super::decoder::Decoder;
use super::encoder::Encoder;
use crate::error::SegError;
use burn::nn::conv::{Conv3d, Conv3dConfig};

/// Hyper-parameters of the segmentation network.
#[derive(Config, Debug, PartialEq)]
pub struct UNet3dConfig {
    /// Input modalities.
    #[config(default = 4)]
    pub in_channels: usize,
    /// Output classes, background included.
    #[config(default = 4)]
    pub num_classes: usize,
    /// Feature width per encoder stage.
    #[config(default = "vec![16, 32, 64, 128, 256]")]
    pub channels: Vec<usize>,
    #[config(default = 0.0)]
    pub dropout: f64,
}

impl UNet3dConfig {
    /// Patch extents must be multiples of this.
    pub fn downsample_factor(&self) -> usize {
        1 << self.channels.len().saturating_sub(1)
    }

    pub fn validate(&self) -> crate::error::Result<()> {
        if self.in_channels == 0 {
            return Err(SegError::config("model needs at least one input channel"));
        }
        if self.num_classes < 2 {
            return Err(SegError::config("model needs at least two classes"));
        }
        if self.channels.len() < 2 || self.channels.contains(&0) {
            return Err(SegError::config(format!(
                "model needs at least two non-empty stages, got {:?}",
                self.channels
            )));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(SegError::config(format!("dropout must be in [0, 1), got {}", self.dropout)));
        }
        Ok(())
    }

    /// Reject patch sizes the encoder cannot halve cleanly at every stage.
    pub fn check_patch_size(&self, patch_size: [usize; 3]) -> crate::error::Result<()> {
        let factor = self.downsample_factor();
        if patch_size.iter().any(|&p| p == 0 || p % factor != 0) {
            return Err(SegError::config(format!(
                "patch size {:?} must be a positive multiple of {} for {} stages",
                patch_size,
                factor,
                self.channels.len()
            )));
        }
        Ok(())
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> UNet3d<B> {
        let encoder = Encoder::new(device, self.in_channels, &self.channels, self.dropout);
        let decoder = Decoder::new(device, &self.channels, self.dropout);
        let first = self.channels.first().copied().unwrap_or(self.in_channels);

        UNet3d {
            encoder,
            decoder,
            head: Conv3dConfig::new([first, self.num_classes], [1, 1, 1]).init(device),
        }
    }
}

/// 3D U-Net: stride-2 encoder, nearest-upsampling decoder with skips, 1x1x1 head.
#[derive(Module, Debug)]
pub struct UNet3d<B: Backend> {
    pub encoder: Encoder<B>,
    pub decoder: Decoder<B>,
    head: Conv3d<B>,
}

impl<B: Backend> UNet3d<B> {
    /// Per-voxel class scores before softmax, `[B, K, D, H, W]`.
    pub fn forward_logits(&self, x: Tensor<B, 5>) -> Tensor<B, 5> {
        let features = self.encoder.forward(x);
        let x = self.decoder.forward(features);
        self.head.forward(x)
    }

    /// Per-voxel class probabilities, summing to 1 over dim 1.
    pub fn forward(&self, x: Tensor<B, 5>) -> Tensor<B, 5> {
        softmax(self.forward_logits(x), 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    fn small_config() -> UNet3dConfig {
        UNet3dConfig::new()
            .with_in_channels(2)
            .with_num_classes(3)
            .with_channels(vec![4, 8, 8])
    }

    #[test]
    fn test_output_shape_and_simplex() {
        let device = Default::default();
        let model = small_config().init::<TestBackend>(&device);
        let x = Tensor::<TestBackend, 5>::random(
            [2, 2, 8, 8, 8],
            burn::tensor::Distribution::Normal(0.0, 1.0),
            &device,
        );

        let probs = model.forward(x);
        assert_eq!(probs.dims(), [2, 3, 8, 8, 8]);

        let sums: Vec<f32> = probs.sum_dim(1).into_data().to_vec().unwrap();
        assert!(sums.iter().all(|s| (s - 1.0).abs() < 1e-4));
    }

    #[test]
    fn test_patch_divisibility() {
        let config = small_config();
        assert_eq!(config.downsample_factor(), 4);
        assert!(config.check_patch_size([8, 12, 16]).is_ok());
        assert!(config.check_patch_size([8, 10, 16]).is_err());
    }

    #[test]
    fn test_validate() {
        assert!(UNet3dConfig::new().validate().is_ok());
        assert!(UNet3dConfig::new().with_channels(vec![16]).validate().is_err());
        assert!(UNet3dConfig::new().with_num_classes(1).validate().is_err());
    }

    #[test]
    fn test_default_matches_five_stage_unet() {
        let config = UNet3dConfig::new();
        assert_eq!(config.channels, vec![16, 32, 64, 128, 256]);
        assert_eq!(config.downsample_factor(), 16);
    }
}

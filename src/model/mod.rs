pub mod blocks;
pub mod decoder;
pub mod encoder;
pub mod loss;
pub mod unet;

pub use decoder::Decoder;
pub use encoder::{Encoder, EncoderFeatures};
pub use loss::{LossConfig, LossOutput, SegmentationLoss};
pub use unet::{UNet3d, UNet3dConfig};

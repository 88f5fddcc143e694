pub mod conv;
pub mod upsample;

pub use conv::{ConvBlock, ConvNormAct};
pub use upsample::Upsample3d;

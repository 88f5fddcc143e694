pub mod data;
pub mod error;
pub mod model;
pub mod training;

// Re-exports for convenience
pub use data::{Case, NiftiDataset, VolumeSource};
pub use error::{Result, SegError};
pub use model::{SegmentationLoss, UNet3d, UNet3dConfig};
pub use training::{Trainer, TrainingConfig};

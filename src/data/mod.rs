pub mod dataloader;
pub mod dataset;
pub mod normalize;
pub mod preview;
pub mod sampler;
pub mod transforms;
pub mod volume;

pub use dataloader::{EpochBatches, HostBatch, LoaderSettings, PatchLoader};
pub use dataset::{k_fold_splits, Fold, InMemoryDataset, NiftiDataset, VolumeSource};
pub use normalize::{ChannelStats, NormalizationMode, Normalizer};
pub use sampler::{PatchPair, PatchSampler};
pub use transforms::{AugmentationConfig, AugmentationEngine};
pub use volume::{Case, LabelMap, Volume};

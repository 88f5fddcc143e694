pub mod checkpoint;
pub mod config;
pub mod early_stopping;
pub mod evaluator;
pub mod metrics;
pub mod state;
pub mod trainer;

pub use checkpoint::{CheckpointHandle, CheckpointManager, CheckpointMetadata};
pub use config::{ResumeFrom, TrainingConfig};
pub use early_stopping::EarlyStopping;
pub use evaluator::{argmax_classes, CasePrediction, Evaluator, SlidingWindow};
pub use metrics::{dice_score, hausdorff95, CaseMetrics, MetricReport};
pub use state::{
    CancelToken, EpochReport, StopReason, TrainingContext, TrainingPhase, TrainingSummary,
};
pub use trainer::{StepOutput, Trainer};

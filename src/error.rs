//! Error types for tumorseg.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the training pipeline.
#[derive(Error, Debug)]
pub enum SegError {
    /// A volume/label pair is malformed or misaligned.
    #[error("data integrity error in case '{case}': {reason}")]
    DataIntegrity {
        /// Case identifier.
        case: String,
        /// What did not match.
        reason: String,
    },

    /// The loss became NaN or infinite.
    #[error("training diverged at epoch {epoch}, step {step}: loss = {loss}")]
    Divergence {
        /// Epoch (1-based) in which the loss blew up.
        epoch: usize,
        /// Global optimizer step.
        step: usize,
        /// The offending loss value.
        loss: f32,
    },

    /// A checkpoint exists but cannot be restored into the current model.
    #[error("checkpoint at {path:?} is corrupt: {reason}")]
    CheckpointCorruption {
        /// Checkpoint directory.
        path: PathBuf,
        /// Description of the failure.
        reason: String,
    },

    /// The requested batch/patch configuration does not fit the memory budget.
    #[error(
        "patch size {patch_size:?} with batch size {batch_size} needs ~{estimated_mb} MiB, \
         budget is {budget_mb} MiB"
    )]
    ResourceExhaustion {
        /// Configured patch size.
        patch_size: [usize; 3],
        /// Configured batch size.
        batch_size: usize,
        /// Estimated activation memory.
        estimated_mb: usize,
        /// Configured budget.
        budget_mb: usize,
    },

    /// Invalid configuration.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Description of the configuration error.
        message: String,
    },

    /// Tensor data could not be read back from the device.
    #[error("tensor error: {0}")]
    Tensor(String),

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML (de)serialization error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl SegError {
    /// Shorthand for a [`SegError::DataIntegrity`] error.
    pub fn integrity(case: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DataIntegrity {
            case: case.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`SegError::InvalidConfig`] error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Shorthand for a [`SegError::CheckpointCorruption`] error.
    pub fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::CheckpointCorruption {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Whether the run may continue after excluding the offending sample.
    pub fn is_sample_local(&self) -> bool {
        matches!(self, Self::DataIntegrity { .. })
    }
}

/// Result type for tumorseg operations.
pub type Result<T> = std::result::Result<T, SegError>;

use thiserror::Error;

use crate::core::types::DeviceId;

#[derive(Error, Debug)]
pub enum SegError {
    /// Singular or degenerate affine, non-positive spacing, mismatched grids
    #[error("Geometry error: {0}")]
    Geometry(String),

    #[error(
        "Resource exhaustion on {device} at batch size {batch_size}: \
         requires {required_bytes} bytes, {available_bytes} available"
    )]
    ResourceExhaustion {
        device: DeviceId,
        batch_size: usize,
        required_bytes: u64,
        available_bytes: u64,
    },

    #[error("Model resolution error: {0}")]
    ModelResolution(String),

    #[error("Inference error on {device}: {message}")]
    Inference { device: DeviceId, message: String },

    #[error("Image format error: {0}")]
    Format(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Run cancelled before sub-model {0}")]
    Cancelled(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl SegError {
    /// Whether the caller may retry the same run with a smaller batch or fewer workers
    pub fn is_retryable_with_smaller_batch(&self) -> bool {
        matches!(self, SegError::ResourceExhaustion { .. })
    }
}

pub type Result<T> = std::result::Result<T, SegError>;

//! Error types for sitesee-eye

use thiserror::Error;

#[derive(Error, Debug)]
pub enum VisionError {
    #[error("Invalid buffer: {reason}")]
    InvalidBuffer { reason: String },

    #[error("Decode failure: {0}")]
    DecodeFailure(String),

    #[error("Inference unavailable: {0}")]
    InferenceUnavailable(String),

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl VisionError {
    pub(crate) fn invalid_buffer(reason: impl Into<String>) -> Self {
        VisionError::InvalidBuffer { reason: reason.into() }
    }

    /// Errors that only cost the current frame. The pipeline logs them,
    /// releases the slot and moves on to the next delivery.
    pub fn is_frame_local(&self) -> bool {
        matches!(
            self,
            VisionError::InvalidBuffer { .. }
                | VisionError::DecodeFailure(_)
                | VisionError::InferenceUnavailable(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, VisionError>;

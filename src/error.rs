//! Error taxonomy for the serving core

use thiserror::Error;

/// Errors surfaced by the classifier host and the serving façade
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServeError {
    /// Input bytes are not a decodable image, or the image has no pixels
    #[error("image decode failed: {0}")]
    ImageDecode(String),

    /// Weights file missing, truncated, or not matching the declared architecture
    #[error("weight load failed: {0}")]
    WeightLoad(String),

    /// Forward pass failed; the host stays usable
    #[error("inference failed: {0}")]
    Inference(String),

    /// Label table and model disagree, or a manifest is unusable
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl ServeError {
    /// Stable identifier used in replies and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            ServeError::ImageDecode(_) => "image_decode",
            ServeError::WeightLoad(_) => "weight_load",
            ServeError::Inference(_) => "inference",
            ServeError::Configuration(_) => "configuration",
        }
    }

    /// HTTP-style status reported to callers
    pub fn status_code(&self) -> u16 {
        match self {
            ServeError::ImageDecode(_) => 400,
            ServeError::WeightLoad(_) => 503,
            ServeError::Inference(_) | ServeError::Configuration(_) => 500,
        }
    }

    /// Whether the caller is at fault
    pub fn is_client_error(&self) -> bool {
        matches!(self, ServeError::ImageDecode(_))
    }
}

pub type Result<T> = std::result::Result<T, ServeError>;

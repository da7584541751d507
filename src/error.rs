//! Error types shared by every stage of the pipeline

use std::time::Duration;

use thiserror::Error;

/// Errors raised by the capture pipeline and its collaborators
#[derive(Error, Debug)]
pub enum CamError {
    #[error("Device error: {0}")]
    Device(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Read exceeded timeout of {0:?}")]
    Timeout(Duration),

    #[error("Calibration failed: {0}")]
    Calibration(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Channel closed: {0}")]
    Channel(String),

    #[error("Sink error: {0}")]
    Sink(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<jpeg_decoder::Error> for CamError {
    fn from(e: jpeg_decoder::Error) -> Self {
        CamError::Decode(e.to_string())
    }
}

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, CamError>;

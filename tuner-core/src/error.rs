//! Error types for the tuner core.
//!
//! Lifecycle outcomes such as "already running" are not errors; they are
//! reported through [`crate::detector::Status`]. The variants here cover
//! construction and I/O failures only.

use thiserror::Error;

/// Main error type for the tuner core.
#[derive(Error, Debug)]
pub enum TunerError {
    #[error("Audio error: {0}")]
    Audio(String),

    #[error("Estimator error: {0}")]
    Estimator(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config file error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),
}

/// Result type alias for the tuner core.
pub type Result<T> = std::result::Result<T, TunerError>;

impl TunerError {
    /// Wraps any displayable audio backend error.
    pub fn audio(err: impl std::fmt::Display) -> Self {
        TunerError::Audio(err.to_string())
    }
}

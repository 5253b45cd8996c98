//! Error types for Onda

use thiserror::Error;

/// Core error type
#[derive(Error, Debug)]
pub enum OndaError {
    #[error("Invalid sample rate: {0}")]
    InvalidSampleRate(u32),

    #[error("Invalid channel count: {0}")]
    InvalidChannelCount(usize),

    #[error("Invalid parameter: {0}")]
    InvalidParam(String),
}

/// Result type alias
pub type OndaResult<T> = Result<T, OndaError>;

//! Error types for softcam
//!
//! Construction failures (`InvalidArgument`, `AlreadyExists`, `NotFound`,
//! `Oversized`) are surfaced to most callers as an invalid [`FrameBuffer`]
//! handle; the typed error is available through the `try_*` constructors.
//!
//! [`FrameBuffer`]: crate::FrameBuffer

use thiserror::Error;

/// Result alias used throughout softcam
pub type SoftcamResult<T> = Result<T, SoftcamError>;

#[derive(Debug, Error)]
pub enum SoftcamError {
    /// Non-positive dimensions, negative or non-finite framerate
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Another producer holds a live region under this name
    #[error("Frame buffer '{0}' already exists and is active")]
    AlreadyExists(String),

    /// No region exists under this name
    #[error("Frame buffer '{0}' does not exist")]
    NotFound(String),

    /// Requested dimensions exceed the allocation cap
    #[error("Frame of {requested} bytes exceeds the limit of {limit} bytes")]
    Oversized { requested: u64, limit: u64 },

    #[error("Frame buffer handle is not valid")]
    InvalidHandle,

    #[error("Operation requires a producer handle")]
    NotProducer,

    #[error("Frame buffer is no longer active")]
    Inactive,

    #[error("Frame size mismatch: expected {expected} bytes, got {actual}")]
    FrameSizeMismatch { expected: usize, actual: usize },

    /// Mapped region does not carry a valid header
    #[error("Corrupt shared memory region: {0}")]
    Corrupt(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SoftcamError {
    pub fn config(msg: impl Into<String>) -> Self {
        SoftcamError::Config(msg.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        SoftcamError::InvalidArgument(msg.into())
    }

    pub fn corrupt(msg: impl Into<String>) -> Self {
        SoftcamError::Corrupt(msg.into())
    }
}

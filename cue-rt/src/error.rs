//! Error types for cue-rt
//!
//! Setup paths (context creation, bank loading, config, audio output) return
//! these errors. Playback-path operations never do: they report failure
//! through `Option`/`bool` and a log line.

use thiserror::Error;

/// Main error type for cue-rt
#[derive(Error, Debug)]
pub enum Error {
    /// Errors from the shared library (bank format, version, config resolution)
    #[error(transparent)]
    Common(#[from] cue_common::Error),

    /// Configuration loading or validation errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Audio decoding errors
    #[error("Audio decode error: {0}")]
    Decode(String),

    /// Audio output device errors
    #[error("Audio output error: {0}")]
    AudioOutput(String),

    /// A bounded pool or table is full
    #[error("Resource exhausted: {0}")]
    Resource(String),

    /// Coding format tag this runtime cannot decode
    #[error("Unsupported coding format: {0}")]
    UnsupportedFormat(u32),

    /// Invalid state for operation
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Convenience Result type using cue-rt Error
pub type Result<T> = std::result::Result<T, Error>;

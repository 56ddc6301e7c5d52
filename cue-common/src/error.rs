//! Common error types for cue

use thiserror::Error;

/// Common result type for cue operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types shared by the runtime and tooling
#[derive(Error, Debug)]
pub enum Error {
    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Bank buffer is structurally invalid (truncated, out-of-range offset, bad tag)
    #[error("Bank format error: {0}")]
    BankFormat(String),

    /// Bank was baked for a different runtime version
    #[error("Bank version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },

    /// Requested resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid caller input
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

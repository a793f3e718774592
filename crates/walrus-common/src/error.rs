//! Error types for the Walrus engine.

use thiserror::Error;

/// Result type alias using WalrusError.
pub type Result<T> = std::result::Result<T, WalrusError>;

/// Errors that can occur in Walrus operations.
#[derive(Debug, Error)]
pub enum WalrusError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("checksum mismatch at sector {sector}: {reason}")]
    Checksum { sector: u64, reason: String },

    #[error("invalid lsid {lsid}: {reason}")]
    InvalidLsid { lsid: u64, reason: String },

    #[error("log space overflow")]
    LogOverflow,

    #[error("device is read-only")]
    ReadOnly,

    #[error("name already exists: {0}")]
    NameConflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("busy: {0}")]
    Busy(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

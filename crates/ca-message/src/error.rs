//! Error types for message handling.

use thiserror::Error;

/// Message error type.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MessageError {
    /// Block option carried the reserved size exponent.
    #[error("reserved block size exponent: {0}")]
    ReservedSizeExp(u8),

    /// Token exceeds the 8-byte protocol limit.
    #[error("token too long: {0} bytes (max 8)")]
    TokenTooLong(usize),
}

/// Result type for message operations.
pub type Result<T> = std::result::Result<T, MessageError>;

//! Error types for blockwise transfer.

use thiserror::Error;

/// Blockwise engine error type.
///
/// Protocol-level conditions (incomplete, too large, duplicates) are not
/// errors; they are reported as reassembly outcomes the caller acts on.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BlockwiseError {
    /// Message carries neither a request method nor a response code.
    #[error("message has neither request nor response role")]
    MissingRole,

    /// No record exists for an exchange the operation requires.
    #[error("no block record for exchange {0}")]
    UnknownExchange(String),

    /// Record exists but its direction was never established.
    #[error("exchange {0} has no active block direction")]
    NoDirection(String),

    /// Payload buffer growth failed; the record keeps its last consistent state.
    #[error("payload buffer allocation failed ({requested} bytes)")]
    Alloc { requested: usize },
}

/// Result type for blockwise operations.
pub type Result<T> = std::result::Result<T, BlockwiseError>;

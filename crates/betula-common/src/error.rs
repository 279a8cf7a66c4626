//! Error types for Betula.

use thiserror::Error;

/// Result type alias using BetulaError.
pub type Result<T> = std::result::Result<T, BetulaError>;

/// Errors that can occur in Betula operations.
#[derive(Debug, Error)]
pub enum BetulaError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Query errors
    #[error("key not found")]
    KeyNotFound,

    #[error("key is smaller than any pivot in the node")]
    OutOfRange,

    // Paging errors
    #[error("node not found: {node_id}")]
    NodeNotFound { node_id: u64 },

    #[error("node already checked out: {node_id}")]
    NodeCheckedOut { node_id: u64 },

    #[error("node corrupted: {node_id}, reason: {reason}")]
    NodeCorrupted { node_id: u64, reason: String },

    // Metadata errors
    #[error("tree metadata corrupted: {0}")]
    MetaCorrupted(String),

    // Serialization errors
    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("invalid message opcode: {0}")]
    InvalidOpcode(u8),
}

impl BetulaError {
    /// Returns true if this error is the expected negative result of a
    /// point query or iteration, rather than a fault.
    pub fn is_not_found(&self) -> bool {
        matches!(self, BetulaError::KeyNotFound)
    }
}

//! Error types for chronokv

use thiserror::Error;

/// Result type alias using the chronokv Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for chronokv
///
/// Absent keys and exhausted cursors are not errors; they surface as
/// `Option::None` or `false` from the store API.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from sockets and files
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// LMDB/heed database errors
    #[error("Database error: {0}")]
    Database(#[from] heed::Error),

    /// Index corruption or other storage-level inconsistencies
    #[error("Storage error: {0}")]
    Storage(String),

    /// Table name is empty or contains the separator byte
    #[error("Invalid table name: {0}")]
    InvalidTable(String),

    /// Node name is empty or contains forbidden bytes
    #[error("Invalid node name: {0}")]
    InvalidNodeName(String),

    /// A mutation whose operation bit disagrees with its payload
    #[error("Invalid mutation: {0}")]
    InvalidMutation(String),

    /// Malformed frame or unexpected message shape
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// A frame or buffer exceeded its size limit
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Handshake and session-level protocol failures
    #[error("Replication error: {0}")]
    Replication(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create an invalid message error
    pub fn invalid_message(msg: impl Into<String>) -> Self {
        Self::InvalidMessage(msg.into())
    }

    /// Create an invalid mutation error
    pub fn invalid_mutation(msg: impl Into<String>) -> Self {
        Self::InvalidMutation(msg.into())
    }

    /// Create a resource exhausted error
    pub fn resource_exhausted(msg: impl Into<String>) -> Self {
        Self::ResourceExhausted(msg.into())
    }

    /// Create a replication error
    pub fn replication(msg: impl Into<String>) -> Self {
        Self::Replication(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the error must stop the replicator rather than just the
    /// session that hit it (engine and index failures).
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Database(_) | Self::Storage(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_constructors() {
        assert!(matches!(Error::storage("x"), Error::Storage(_)));
        assert!(matches!(
            Error::invalid_message("bad frame"),
            Error::InvalidMessage(_)
        ));
        assert!(matches!(Error::config("no node"), Error::Config(_)));
    }

    #[test]
    fn test_fatal_classification() {
        assert!(Error::storage("index diverged").is_fatal());
        assert!(!Error::invalid_message("short frame").is_fatal());
        assert!(!Error::Io(std::io::Error::other("reset")).is_fatal());
        assert!(!Error::resource_exhausted("frame too large").is_fatal());
    }
}

//! Error types for preference storage.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The stored document could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A key holds a value of a different shape than requested.
    #[error("type mismatch for {scope}/{key}: expected {expected}, found {found}")]
    TypeMismatch {
        /// Scope of the key.
        scope: String,
        /// The key.
        key: String,
        /// The requested value shape.
        expected: &'static str,
        /// The stored value shape.
        found: &'static str,
    },

    /// Another process holds the preference file.
    #[error("preference file is locked by another process: {0}")]
    Locked(String),
}

//! Error types for the usersync core.

use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Preference storage error.
    #[error("storage error: {0}")]
    Storage(#[from] usersync_storage::StorageError),

    /// A persisted model could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A persisted document had an unexpected shape.
    #[error("invalid model document: {0}")]
    InvalidDocument(String),
}

impl CoreError {
    /// Creates an invalid document error.
    pub fn invalid_document(msg: impl Into<String>) -> Self {
        Self::InvalidDocument(msg.into())
    }
}

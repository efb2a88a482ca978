//! Error types for the sync engine.

use crate::backend::BackendError;
use thiserror::Error;
use usersync_core::CoreError;
use usersync_storage::StorageError;

/// Result type for sync engine operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors raised by the sync engine.
///
/// Backend failures met while draining the queue never surface here: they
/// are classified and turned into retries or failure events. This type
/// covers setup and the persisted queue document.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Model layer error.
    #[error("model error: {0}")]
    Core(#[from] CoreError),

    /// Preference storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Queue document could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A backend call failed.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// The engine was configured without an app id.
    #[error("no app id configured")]
    MissingAppId,

    /// The drain loop is already running.
    #[error("operation repository already started")]
    AlreadyStarted,

    /// A call required a tokio runtime and none was running.
    #[error("no tokio runtime available")]
    NoRuntime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        assert_eq!(SyncError::MissingAppId.to_string(), "no app id configured");

        let err = SyncError::from(BackendError::status(500, None));
        assert!(err.to_string().contains("500"));

        let err = SyncError::from(StorageError::Locked("prefs.json".into()));
        assert!(err.to_string().starts_with("storage error"));
    }
}

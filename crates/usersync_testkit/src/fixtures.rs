//! Test fixtures.
//!
//! Provides a fully wired core over an in-memory backend, and file-backed
//! preferences that clean up after themselves.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use usersync_engine::{Backends, MockBackend, RetryConfig, SyncConfig, UserSyncCore};
use usersync_storage::{FilePreferences, InMemoryPreferences, PreferenceStore};

/// App id used by [`TestHarness`].
pub const TEST_APP_ID: &str = "test-app";

/// A configuration with every delay zeroed.
///
/// Retries are immediate and new records are addressable at once. The
/// missing-record window keeps its default.
pub fn test_config() -> SyncConfig {
    SyncConfig::new()
        .with_execution_interval(Duration::ZERO)
        .with_post_create_delay(Duration::ZERO)
        .with_retry(RetryConfig::immediate())
}

/// A core wired to in-memory preferences and a [`MockBackend`].
pub struct TestHarness {
    /// The backend the core talks to.
    pub backend: Arc<MockBackend>,
    /// The core's preferences.
    pub prefs: Arc<InMemoryPreferences>,
    /// The core.
    pub core: UserSyncCore,
    config: SyncConfig,
}

impl TestHarness {
    /// Creates a harness with [`test_config`]. The queue is not started.
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    /// Creates a harness with `config`. The queue is not started.
    pub fn with_config(config: SyncConfig) -> Self {
        let backend = Arc::new(MockBackend::new());
        let prefs = Arc::new(InMemoryPreferences::new());
        let core = open_core(&config, &backend, &prefs);
        Self {
            backend,
            prefs,
            core,
            config,
        }
    }

    /// Creates a harness with [`test_config`] and starts the queue.
    ///
    /// Must be called inside a tokio runtime.
    pub fn started() -> Self {
        let harness = Self::new();
        harness.core.start().expect("Failed to start the queue");
        harness
    }

    /// Shuts the core down and opens a new one over the same preferences
    /// and backend, as a process restart would. The new queue is started.
    pub async fn restart(self) -> Self {
        self.core.shutdown().await;
        let Self {
            backend,
            prefs,
            core,
            config,
        } = self;
        drop(core);
        let core = open_core(&config, &backend, &prefs);
        core.start().expect("Failed to start the queue");
        Self {
            backend,
            prefs,
            core,
            config,
        }
    }

    /// Waits until the queue is empty.
    ///
    /// # Panics
    ///
    /// Panics if the queue has not drained after 30 seconds.
    pub async fn settle(&self) {
        let repository = Arc::clone(self.core.repository());
        tokio::time::timeout(Duration::from_secs(30), async move {
            while !repository.is_empty() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap_or_else(|_| {
            panic!(
                "queue did not drain: {:?}",
                self.core.repository().pending_operations()
            )
        });
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

fn open_core(config: &SyncConfig, backend: &Arc<MockBackend>, prefs: &Arc<InMemoryPreferences>) -> UserSyncCore {
    let prefs: Arc<dyn PreferenceStore> = prefs.clone();
    UserSyncCore::open(
        config.clone(),
        TEST_APP_ID,
        Some(prefs),
        Backends::from_shared(Arc::clone(backend)),
    )
    .expect("Failed to open the core")
}

/// File-backed preferences in a temporary directory.
pub struct TempPreferences {
    path: PathBuf,
    _temp_dir: TempDir,
}

impl TempPreferences {
    /// Creates an empty temporary location.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join("prefs").join("usersync.json");
        Self {
            path,
            _temp_dir: temp_dir,
        }
    }

    /// Returns the preference file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Opens the preference file. Only one handle may be open at a time.
    pub fn open(&self) -> Arc<FilePreferences> {
        Arc::new(FilePreferences::open_with_create_dirs(&self.path).expect("Failed to open preferences"))
    }
}

impl Default for TempPreferences {
    fn default() -> Self {
        Self::new()
    }
}

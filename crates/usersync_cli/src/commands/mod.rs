//! CLI command implementations.

pub mod dump_queue;
pub mod inspect;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use usersync_engine::{NewRecordsState, OperationRepository, SyncConfig};
use usersync_storage::{FilePreferences, PreferenceStore};

/// Opens the preference file at `path`. Fails if it does not exist.
pub(crate) fn open_prefs(path: &Path) -> Result<Arc<dyn PreferenceStore>, Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(format!("No preference file found at {:?}", path).into());
    }
    Ok(Arc::new(FilePreferences::open(path)?))
}

/// Loads the persisted queue without starting it.
pub(crate) fn load_queue(prefs: &Arc<dyn PreferenceStore>) -> Arc<OperationRepository> {
    OperationRepository::new(
        SyncConfig::default(),
        Vec::new(),
        Arc::new(NewRecordsState::new(Duration::ZERO, Duration::ZERO)),
        Some(Arc::clone(prefs)),
    )
}

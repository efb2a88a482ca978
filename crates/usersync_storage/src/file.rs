//! File-based preference store for persistent state.

use crate::error::{StorageError, StorageResult};
use crate::preferences::{PreferenceStore, PreferenceValue};
use fs2::FileExt;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

type Document = BTreeMap<String, BTreeMap<String, PreferenceValue>>;

/// A preference store backed by a JSON document on disk.
///
/// The whole document is held in memory and rewritten on every `set`.
/// Values survive process restarts.
///
/// # Durability
///
/// Each write goes to `<path>.tmp`, is synced with `File::sync_all()` and
/// then renamed over `<path>`, so a crash leaves either the old or the new
/// document, never a torn one.
///
/// # Locking
///
/// An exclusive advisory lock on `<path>.lock` is held for the lifetime of
/// the store. A second open of the same path fails with
/// [`StorageError::Locked`].
///
/// # Example
///
/// ```no_run
/// use usersync_storage::{FilePreferences, PreferenceStore};
/// use std::path::Path;
///
/// let prefs = FilePreferences::open(Path::new("prefs.json")).unwrap();
/// prefs.set_bool("usersync", "enabled", Some(true)).unwrap();
/// ```
#[derive(Debug)]
pub struct FilePreferences {
    path: PathBuf,
    document: RwLock<Document>,
    _lock_file: File,
}

impl FilePreferences {
    /// Opens or creates a preference file at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Another process holds the lock (returns `Locked`)
    /// - The existing document is not valid JSON
    /// - I/O errors occur
    pub fn open(path: &Path) -> StorageResult<Self> {
        let lock_path = sibling(path, "lock");
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;

        if lock_file.try_lock_exclusive().is_err() {
            return Err(StorageError::Locked(path.display().to_string()));
        }

        let document = if path.exists() {
            let bytes = fs::read(path)?;
            if bytes.is_empty() {
                Document::new()
            } else {
                serde_json::from_slice(&bytes)?
            }
        } else {
            Document::new()
        };

        Ok(Self {
            path: path.to_path_buf(),
            document: RwLock::new(document),
            _lock_file: lock_file,
        })
    }

    /// Opens or creates a preference file, creating parent directories if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if directories cannot be created or the file cannot be opened.
    pub fn open_with_create_dirs(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Self::open(path)
    }

    /// Returns the path to the preference document.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_document(&self, document: &Document) -> StorageResult<()> {
        let bytes = serde_json::to_vec_pretty(document)?;
        let temp_path = sibling(&self.path, "tmp");
        {
            let mut temp = File::create(&temp_path)?;
            temp.write_all(&bytes)?;
            temp.sync_all()?;
        }
        fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}

impl PreferenceStore for FilePreferences {
    fn get(&self, scope: &str, key: &str) -> StorageResult<Option<PreferenceValue>> {
        Ok(self
            .document
            .read()
            .get(scope)
            .and_then(|entries| entries.get(key))
            .cloned())
    }

    fn set(&self, scope: &str, key: &str, value: Option<PreferenceValue>) -> StorageResult<()> {
        // Held across the write so concurrent setters persist in order.
        let mut document = self.document.write();
        let previous = document.clone();

        match value {
            Some(value) => {
                document
                    .entry(scope.to_string())
                    .or_default()
                    .insert(key.to_string(), value);
            }
            None => {
                if let Some(entries) = document.get_mut(scope) {
                    entries.remove(key);
                    if entries.is_empty() {
                        document.remove(scope);
                    }
                }
            }
        }

        if let Err(e) = self.write_document(&document) {
            tracing::error!(path = %self.path.display(), error = %e, "failed to persist preferences");
            *document = previous;
            return Err(e);
        }
        Ok(())
    }

    fn keys(&self, scope: &str) -> StorageResult<Vec<String>> {
        Ok(self
            .document
            .read()
            .get(scope)
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default())
    }
}

fn sibling(path: &Path, extension: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(extension);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("prefs.json");

        {
            let prefs = FilePreferences::open(&path).unwrap();
            prefs.set_string("usersync", "a", Some("1")).unwrap();
            prefs.set_long("usersync", "b", Some(2)).unwrap();
        }

        let prefs = FilePreferences::open(&path).unwrap();
        assert_eq!(prefs.get_string("usersync", "a").unwrap().as_deref(), Some("1"));
        assert_eq!(prefs.get_long("usersync", "b").unwrap(), Some(2));
        assert_eq!(prefs.keys("usersync").unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn file_remove_key() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("prefs.json");
        let prefs = FilePreferences::open(&path).unwrap();

        prefs.set_bool("s", "k", Some(true)).unwrap();
        prefs.set_bool("s", "k", None).unwrap();
        assert_eq!(prefs.get_bool("s", "k").unwrap(), None);
        assert!(prefs.keys("s").unwrap().is_empty());
    }

    #[test]
    fn file_second_open_is_locked() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("prefs.json");
        let _first = FilePreferences::open(&path).unwrap();

        let second = FilePreferences::open(&path);
        assert!(matches!(second, Err(StorageError::Locked(_))));
    }

    #[test]
    fn file_rejects_corrupt_document() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("prefs.json");
        fs::write(&path, b"{not json").unwrap();

        let result = FilePreferences::open(&path);
        assert!(matches!(result, Err(StorageError::Serialization(_))));
    }

    #[test]
    fn file_create_dirs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("deeper").join("prefs.json");
        let prefs = FilePreferences::open_with_create_dirs(&path).unwrap();
        prefs.set_int("s", "k", Some(1)).unwrap();
        assert!(path.exists());
    }
}

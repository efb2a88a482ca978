//! In-memory preference store for testing.

use crate::error::StorageResult;
use crate::preferences::{PreferenceStore, PreferenceValue};
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// An in-memory preference store.
///
/// This store keeps all values in memory and is suitable for:
/// - Unit tests
/// - Integration tests
/// - Ephemeral sessions that don't need persistence
///
/// # Thread Safety
///
/// This store is thread-safe and can be shared across threads.
///
/// # Example
///
/// ```rust
/// use usersync_storage::{InMemoryPreferences, PreferenceStore};
///
/// let prefs = InMemoryPreferences::new();
/// prefs.set_long("usersync", "counter", Some(3)).unwrap();
/// assert_eq!(prefs.get_long("usersync", "counter").unwrap(), Some(3));
/// ```
#[derive(Debug, Default)]
pub struct InMemoryPreferences {
    values: RwLock<BTreeMap<(String, String), PreferenceValue>>,
    writes: RwLock<u64>,
}

impl InMemoryPreferences {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns how many `set` calls were made.
    ///
    /// Useful for asserting that mutations were persisted.
    #[must_use]
    pub fn write_count(&self) -> u64 {
        *self.writes.read()
    }

    /// Returns a copy of every stored value.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<(String, String), PreferenceValue> {
        self.values.read().clone()
    }

    /// Removes every value.
    pub fn clear(&self) {
        self.values.write().clear();
    }
}

impl PreferenceStore for InMemoryPreferences {
    fn get(&self, scope: &str, key: &str) -> StorageResult<Option<PreferenceValue>> {
        Ok(self
            .values
            .read()
            .get(&(scope.to_string(), key.to_string()))
            .cloned())
    }

    fn set(&self, scope: &str, key: &str, value: Option<PreferenceValue>) -> StorageResult<()> {
        let mut values = self.values.write();
        let slot = (scope.to_string(), key.to_string());
        match value {
            Some(value) => {
                values.insert(slot, value);
            }
            None => {
                values.remove(&slot);
            }
        }
        *self.writes.write() += 1;
        Ok(())
    }

    fn keys(&self, scope: &str) -> StorageResult<Vec<String>> {
        Ok(self
            .values
            .read()
            .keys()
            .filter(|(s, _)| s == scope)
            .map(|(_, k)| k.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use std::collections::BTreeSet;

    #[test]
    fn memory_new_is_empty() {
        let prefs = InMemoryPreferences::new();
        assert!(prefs.snapshot().is_empty());
        assert_eq!(prefs.get_string("s", "k").unwrap(), None);
    }

    #[test]
    fn memory_roundtrip_each_shape() {
        let prefs = InMemoryPreferences::new();
        prefs.set_string("s", "str", Some("v")).unwrap();
        prefs.set_bool("s", "bool", Some(true)).unwrap();
        prefs.set_int("s", "int", Some(-4)).unwrap();
        prefs.set_long("s", "long", Some(1 << 40)).unwrap();
        let set: BTreeSet<String> = ["a".to_string(), "b".to_string()].into();
        prefs.set_string_set("s", "set", Some(set.clone())).unwrap();

        assert_eq!(prefs.get_string("s", "str").unwrap().as_deref(), Some("v"));
        assert_eq!(prefs.get_bool("s", "bool").unwrap(), Some(true));
        assert_eq!(prefs.get_int("s", "int").unwrap(), Some(-4));
        assert_eq!(prefs.get_long("s", "long").unwrap(), Some(1 << 40));
        assert_eq!(prefs.get_string_set("s", "set").unwrap(), Some(set));
        assert_eq!(prefs.write_count(), 5);
    }

    #[test]
    fn memory_none_removes() {
        let prefs = InMemoryPreferences::new();
        prefs.set_string("s", "k", Some("v")).unwrap();
        prefs.set_string("s", "k", None).unwrap();
        assert_eq!(prefs.get_string("s", "k").unwrap(), None);
    }

    #[test]
    fn memory_scopes_are_isolated() {
        let prefs = InMemoryPreferences::new();
        prefs.set_int("a", "k", Some(1)).unwrap();
        prefs.set_int("b", "k", Some(2)).unwrap();
        assert_eq!(prefs.get_int("a", "k").unwrap(), Some(1));
        assert_eq!(prefs.keys("b").unwrap(), vec!["k".to_string()]);
    }

    #[test]
    fn memory_type_mismatch() {
        let prefs = InMemoryPreferences::new();
        prefs.set_bool("s", "k", Some(false)).unwrap();
        let err = prefs.get_string("s", "k").unwrap_err();
        assert!(matches!(
            err,
            StorageError::TypeMismatch {
                expected: "string",
                found: "bool",
                ..
            }
        ));
    }

    #[test]
    fn memory_int_widens_to_long() {
        let prefs = InMemoryPreferences::new();
        prefs.set_int("s", "k", Some(9)).unwrap();
        assert_eq!(prefs.get_long("s", "k").unwrap(), Some(9));
    }
}

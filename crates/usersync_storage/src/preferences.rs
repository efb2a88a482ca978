//! Preference store trait definition.

use crate::error::{StorageError, StorageResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Well-known scope and key names used by the sync core.
pub mod keys {
    /// Scope holding all sync-core state.
    pub const SCOPE: &str = "usersync";
    /// Prefix of the key a model store is persisted under.
    pub const MODEL_STORE_PREFIX: &str = "model_store_";
    /// Key of the persisted operation queue.
    pub const OPERATIONS: &str = "operations";
    /// Key of the persisted local-id promotion record.
    pub const ID_TRANSLATIONS: &str = "id_translations";

    /// Returns the key a model store named `name` is persisted under.
    pub fn model_store(name: &str) -> String {
        format!("{MODEL_STORE_PREFIX}{name}")
    }
}

/// A single stored value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum PreferenceValue {
    /// A string.
    String(String),
    /// A boolean.
    Bool(bool),
    /// A 32-bit integer.
    Int(i32),
    /// A 64-bit integer.
    Long(i64),
    /// An ordered set of strings.
    StringSet(BTreeSet<String>),
}

impl PreferenceValue {
    /// Returns the name of this value's shape.
    pub fn type_name(&self) -> &'static str {
        match self {
            PreferenceValue::String(_) => "string",
            PreferenceValue::Bool(_) => "bool",
            PreferenceValue::Int(_) => "int",
            PreferenceValue::Long(_) => "long",
            PreferenceValue::StringSet(_) => "string_set",
        }
    }
}

/// A scoped key-value store for small persisted values.
///
/// Preference stores are **opaque value stores**. The sync core serializes
/// model stores and the operation queue to strings and persists them here.
///
/// # Invariants
///
/// - `set` is durable when it returns
/// - `set(.., None)` removes the key
/// - Reading a missing key returns `Ok(None)`
/// - Implementations must be `Send + Sync` for concurrent access
///
/// # Implementors
///
/// - [`super::InMemoryPreferences`] - For testing
/// - [`super::FilePreferences`] - For persistent storage
pub trait PreferenceStore: Send + Sync {
    /// Reads the raw value stored under `(scope, key)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store cannot be read.
    fn get(&self, scope: &str, key: &str) -> StorageResult<Option<PreferenceValue>>;

    /// Stores or removes the value under `(scope, key)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the change cannot be made durable.
    fn set(&self, scope: &str, key: &str, value: Option<PreferenceValue>) -> StorageResult<()>;

    /// Returns every key present in `scope`, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store cannot be read.
    fn keys(&self, scope: &str) -> StorageResult<Vec<String>>;

    /// Reads a string value.
    fn get_string(&self, scope: &str, key: &str) -> StorageResult<Option<String>> {
        match self.get(scope, key)? {
            None => Ok(None),
            Some(PreferenceValue::String(s)) => Ok(Some(s)),
            Some(other) => Err(mismatch(scope, key, "string", &other)),
        }
    }

    /// Writes a string value.
    fn set_string(&self, scope: &str, key: &str, value: Option<&str>) -> StorageResult<()> {
        self.set(scope, key, value.map(|v| PreferenceValue::String(v.to_string())))
    }

    /// Reads a boolean value.
    fn get_bool(&self, scope: &str, key: &str) -> StorageResult<Option<bool>> {
        match self.get(scope, key)? {
            None => Ok(None),
            Some(PreferenceValue::Bool(b)) => Ok(Some(b)),
            Some(other) => Err(mismatch(scope, key, "bool", &other)),
        }
    }

    /// Writes a boolean value.
    fn set_bool(&self, scope: &str, key: &str, value: Option<bool>) -> StorageResult<()> {
        self.set(scope, key, value.map(PreferenceValue::Bool))
    }

    /// Reads a 32-bit integer value.
    fn get_int(&self, scope: &str, key: &str) -> StorageResult<Option<i32>> {
        match self.get(scope, key)? {
            None => Ok(None),
            Some(PreferenceValue::Int(i)) => Ok(Some(i)),
            Some(other) => Err(mismatch(scope, key, "int", &other)),
        }
    }

    /// Writes a 32-bit integer value.
    fn set_int(&self, scope: &str, key: &str, value: Option<i32>) -> StorageResult<()> {
        self.set(scope, key, value.map(PreferenceValue::Int))
    }

    /// Reads a 64-bit integer value.
    ///
    /// Values written with [`set_int`](Self::set_int) are widened.
    fn get_long(&self, scope: &str, key: &str) -> StorageResult<Option<i64>> {
        match self.get(scope, key)? {
            None => Ok(None),
            Some(PreferenceValue::Long(l)) => Ok(Some(l)),
            Some(PreferenceValue::Int(i)) => Ok(Some(i64::from(i))),
            Some(other) => Err(mismatch(scope, key, "long", &other)),
        }
    }

    /// Writes a 64-bit integer value.
    fn set_long(&self, scope: &str, key: &str, value: Option<i64>) -> StorageResult<()> {
        self.set(scope, key, value.map(PreferenceValue::Long))
    }

    /// Reads a string-set value.
    fn get_string_set(&self, scope: &str, key: &str) -> StorageResult<Option<BTreeSet<String>>> {
        match self.get(scope, key)? {
            None => Ok(None),
            Some(PreferenceValue::StringSet(set)) => Ok(Some(set)),
            Some(other) => Err(mismatch(scope, key, "string_set", &other)),
        }
    }

    /// Writes a string-set value.
    fn set_string_set(
        &self,
        scope: &str,
        key: &str,
        value: Option<BTreeSet<String>>,
    ) -> StorageResult<()> {
        self.set(scope, key, value.map(PreferenceValue::StringSet))
    }
}

fn mismatch(scope: &str, key: &str, expected: &'static str, found: &PreferenceValue) -> StorageError {
    StorageError::TypeMismatch {
        scope: scope.to_string(),
        key: key.to_string(),
        expected,
        found: found.type_name(),
    }
}

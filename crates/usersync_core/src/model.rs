//! Observable property-bag model.

use crate::error::{CoreError, CoreResult};
use crate::value::PropertyValue;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;

static NULL: PropertyValue = PropertyValue::Null;
static EMPTY_MAP: BTreeMap<String, PropertyValue> = BTreeMap::new();

/// Where a model mutation originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelChangeTag {
    /// Local application code. Listeners turn these into operations.
    Normal,
    /// Copied in from a backend response. Never sent back.
    Hydrate,
    /// Local bookkeeping that must not produce operations.
    NoPropagate,
}

impl ModelChangeTag {
    /// Returns true if changes with this tag should become operations.
    pub fn propagates(&self) -> bool {
        matches!(self, ModelChangeTag::Normal)
    }
}

/// A single recorded property mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyChange {
    /// Full path of the changed value (`tags.color` for map entries).
    pub path: String,
    /// Top-level property name (`tags` for map entries).
    pub property: String,
    /// Value before the change.
    pub old_value: PropertyValue,
    /// Value after the change.
    pub new_value: PropertyValue,
}

/// A named bag of typed properties.
///
/// Reads never fail: a missing property is [`PropertyValue::Null`] and the
/// typed getters return documented defaults. Every setter that changes a
/// value records a [`PropertyChange`]; the owning store drains those with
/// [`Model::take_changes`] and turns them into notifications.
#[derive(Debug, Clone, Default)]
pub struct Model {
    data: BTreeMap<String, PropertyValue>,
    changes: Vec<PropertyChange>,
}

impl Model {
    /// Creates an empty model.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a model from a JSON object.
    ///
    /// # Errors
    ///
    /// Returns an error if `json` is not an object.
    pub fn from_json(json: serde_json::Value) -> CoreResult<Self> {
        match serde_json::from_value::<PropertyValue>(json)? {
            PropertyValue::Map(data) => Ok(Self {
                data,
                changes: Vec::new(),
            }),
            other => Err(CoreError::invalid_document(format!(
                "expected a model object, found {}",
                other.type_name()
            ))),
        }
    }

    /// Serializes the model to a JSON object.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.data).unwrap_or(serde_json::Value::Null)
    }

    /// Returns the value at `name`, or `Null` if absent.
    pub fn get(&self, name: &str) -> &PropertyValue {
        self.data.get(name).unwrap_or(&NULL)
    }

    /// Returns true if `name` holds a non-null value.
    pub fn has(&self, name: &str) -> bool {
        self.data.get(name).is_some_and(|v| !v.is_null())
    }

    /// Returns the string at `name`, or `None`.
    pub fn get_string(&self, name: &str) -> Option<&str> {
        self.get(name).as_str()
    }

    /// Returns the boolean at `name`, or `false`.
    pub fn get_bool(&self, name: &str) -> bool {
        self.get_bool_or(name, false)
    }

    /// Returns the boolean at `name`, or `default`.
    pub fn get_bool_or(&self, name: &str, default: bool) -> bool {
        self.get(name).as_bool().unwrap_or(default)
    }

    /// Returns the integer at `name`, or `0`.
    pub fn get_int(&self, name: &str) -> i64 {
        self.get(name).as_int().unwrap_or(0)
    }

    /// Returns the number at `name`, or `0.0`.
    pub fn get_float(&self, name: &str) -> f64 {
        self.get(name).as_float().unwrap_or(0.0)
    }

    /// Returns the map at `name`, or an empty map.
    pub fn get_map(&self, name: &str) -> &BTreeMap<String, PropertyValue> {
        self.get(name).as_map().unwrap_or(&EMPTY_MAP)
    }

    /// Returns the `id` property.
    pub fn id(&self) -> Option<&str> {
        self.get_string("id")
    }

    /// Returns all properties.
    pub fn data(&self) -> &BTreeMap<String, PropertyValue> {
        &self.data
    }

    /// Sets `name` to `value`. Returns true if a change was recorded.
    ///
    /// Setting `Null` removes the property.
    pub fn set(&mut self, name: &str, value: impl Into<PropertyValue>) -> bool {
        self.set_with(name, value.into(), false)
    }

    /// Sets `name` to `value`, recording a change even if the value is
    /// unchanged when `force` is set.
    pub fn set_with(&mut self, name: &str, value: PropertyValue, force: bool) -> bool {
        let old_value = self.get(name).clone();
        if old_value == value && !force {
            return false;
        }

        if value.is_null() {
            self.data.remove(name);
        } else {
            self.data.insert(name.to_string(), value.clone());
        }

        self.changes.push(PropertyChange {
            path: name.to_string(),
            property: name.to_string(),
            old_value,
            new_value: value,
        });
        true
    }

    /// Sets or removes one entry of the map at `name`.
    ///
    /// The recorded change has path `name.key`.
    pub fn set_map_entry(&mut self, name: &str, key: &str, value: Option<PropertyValue>) -> bool {
        let mut map = self.get_map(name).clone();
        let old_value = map.get(key).cloned().unwrap_or_default();
        let new_value = value.unwrap_or_default();
        if old_value == new_value {
            return false;
        }

        if new_value.is_null() {
            map.remove(key);
        } else {
            map.insert(key.to_string(), new_value.clone());
        }

        if map.is_empty() {
            self.data.remove(name);
        } else {
            self.data.insert(name.to_string(), PropertyValue::Map(map));
        }

        self.changes.push(PropertyChange {
            path: format!("{name}.{key}"),
            property: name.to_string(),
            old_value,
            new_value,
        });
        true
    }

    /// Drains the changes recorded since the last call.
    pub fn take_changes(&mut self) -> Vec<PropertyChange> {
        std::mem::take(&mut self.changes)
    }

    /// Returns true if changes are waiting to be drained.
    pub fn has_pending_changes(&self) -> bool {
        !self.changes.is_empty()
    }
}

impl PartialEq for Model {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl Serialize for Model {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.data.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Model {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let data = BTreeMap::<String, PropertyValue>::deserialize(deserializer)?;
        Ok(Self {
            data,
            changes: Vec::new(),
        })
    }
}

/// A typed wrapper around a [`Model`] that can live in a model store.
pub trait StoreModel: Clone + Default + Send + Sync + 'static {
    /// Wraps an untyped model.
    fn from_model(model: Model) -> Self;

    /// Returns the underlying model.
    fn model(&self) -> &Model;

    /// Returns the underlying model mutably.
    fn model_mut(&mut self) -> &mut Model;

    /// Returns the key this model is stored under in a keyed store.
    fn key(&self) -> Option<&str> {
        self.model().id()
    }
}

impl StoreModel for Model {
    fn from_model(model: Model) -> Self {
        model
    }

    fn model(&self) -> &Model {
        self
    }

    fn model_mut(&mut self) -> &mut Model {
        self
    }
}

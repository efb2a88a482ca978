//! Identity model: the user's ids and aliases.

use super::store_model;
use crate::model::Model;
use crate::value::PropertyValue;
use std::collections::BTreeMap;

/// The current user's identity.
///
/// Every string property is an alias `label -> id`. Two labels are
/// reserved: [`IdentityModel::ONESIGNAL_ID`] (the backend's user id, or a
/// local placeholder until the user is created) and
/// [`IdentityModel::EXTERNAL_ID`] (the application's own user id).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IdentityModel(Model);

store_model!(IdentityModel);

impl IdentityModel {
    /// Alias label of the backend user id.
    pub const ONESIGNAL_ID: &'static str = "onesignal_id";
    /// Alias label of the application's user id.
    pub const EXTERNAL_ID: &'static str = "external_id";

    /// Creates an identity for `onesignal_id`.
    pub fn with_onesignal_id(onesignal_id: &str) -> Self {
        let mut model = Model::new();
        model.set(Self::ONESIGNAL_ID, onesignal_id);
        model.take_changes();
        Self(model)
    }

    /// Returns the backend user id.
    pub fn onesignal_id(&self) -> Option<&str> {
        self.0.get_string(Self::ONESIGNAL_ID)
    }

    /// Sets the backend user id.
    pub fn set_onesignal_id(&mut self, id: &str) {
        self.0.set(Self::ONESIGNAL_ID, id);
    }

    /// Returns the application's user id.
    pub fn external_id(&self) -> Option<&str> {
        self.0.get_string(Self::EXTERNAL_ID)
    }

    /// Sets or clears the application's user id.
    pub fn set_external_id(&mut self, id: Option<&str>) {
        self.0.set(Self::EXTERNAL_ID, id);
    }

    /// Returns one alias.
    pub fn alias(&self, label: &str) -> Option<&str> {
        self.0.get_string(label)
    }

    /// Sets or removes one alias.
    pub fn set_alias(&mut self, label: &str, id: Option<&str>) {
        self.0.set(label, id);
    }

    /// Returns every alias, reserved labels included.
    pub fn aliases(&self) -> BTreeMap<String, String> {
        self.0
            .data()
            .iter()
            .filter_map(|(label, value)| match value {
                PropertyValue::String(id) => Some((label.clone(), id.clone())),
                _ => None,
            })
            .collect()
    }

    /// Returns the aliases an application may edit (no `onesignal_id`).
    pub fn user_aliases(&self) -> BTreeMap<String, String> {
        let mut aliases = self.aliases();
        aliases.remove(Self::ONESIGNAL_ID);
        aliases
    }
}

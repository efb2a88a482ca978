//! Application configuration model.

use super::store_model;
use crate::model::Model;

/// Application-level settings the core needs to address the backend.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigModel(Model);

store_model!(ConfigModel);

impl ConfigModel {
    /// Property holding the application id.
    pub const APP_ID: &'static str = "app_id";
    /// Property holding the id of this device's push subscription.
    pub const PUSH_SUBSCRIPTION_ID: &'static str = "push_subscription_id";

    /// Returns the application id.
    pub fn app_id(&self) -> Option<&str> {
        self.0.get_string(Self::APP_ID)
    }

    /// Sets the application id.
    pub fn set_app_id(&mut self, app_id: &str) {
        self.0.set(Self::APP_ID, app_id);
    }

    /// Returns the push subscription id, if one was created.
    pub fn push_subscription_id(&self) -> Option<&str> {
        self.0.get_string(Self::PUSH_SUBSCRIPTION_ID)
    }

    /// Sets or clears the push subscription id.
    pub fn set_push_subscription_id(&mut self, id: Option<&str>) {
        self.0.set(Self::PUSH_SUBSCRIPTION_ID, id);
    }
}

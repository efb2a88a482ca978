//! Properties model: tags and descriptive user fields.

use super::store_model;
use crate::model::Model;
use crate::value::PropertyValue;
use std::collections::BTreeMap;

/// The current user's properties.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertiesModel(Model);

store_model!(PropertiesModel);

impl PropertiesModel {
    /// Property holding the owning user's backend id.
    pub const ONESIGNAL_ID: &'static str = "onesignal_id";
    /// Map property holding tags.
    pub const TAGS: &'static str = "tags";
    /// Language code.
    pub const LANGUAGE: &'static str = "language";
    /// IANA timezone id.
    pub const TIMEZONE: &'static str = "timezone_id";
    /// Country code.
    pub const COUNTRY: &'static str = "country";

    /// Creates properties owned by `onesignal_id`.
    pub fn with_onesignal_id(onesignal_id: &str) -> Self {
        let mut model = Model::new();
        model.set(Self::ONESIGNAL_ID, onesignal_id);
        model.take_changes();
        Self(model)
    }

    /// Returns the owning user's backend id.
    pub fn onesignal_id(&self) -> Option<&str> {
        self.0.get_string(Self::ONESIGNAL_ID)
    }

    /// Sets the owning user's backend id.
    pub fn set_onesignal_id(&mut self, id: &str) {
        self.0.set(Self::ONESIGNAL_ID, id);
    }

    /// Returns all tags.
    pub fn tags(&self) -> BTreeMap<String, String> {
        self.0
            .get_map(Self::TAGS)
            .iter()
            .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
            .collect()
    }

    /// Sets or removes one tag.
    pub fn set_tag(&mut self, key: &str, value: Option<&str>) {
        self.0
            .set_map_entry(Self::TAGS, key, value.map(PropertyValue::from));
    }

    /// Returns the language.
    pub fn language(&self) -> Option<&str> {
        self.0.get_string(Self::LANGUAGE)
    }

    /// Sets or clears the language.
    pub fn set_language(&mut self, language: Option<&str>) {
        self.0.set(Self::LANGUAGE, language);
    }

    /// Returns the timezone.
    pub fn timezone(&self) -> Option<&str> {
        self.0.get_string(Self::TIMEZONE)
    }

    /// Sets or clears the timezone.
    pub fn set_timezone(&mut self, timezone: Option<&str>) {
        self.0.set(Self::TIMEZONE, timezone);
    }

    /// Returns the country.
    pub fn country(&self) -> Option<&str> {
        self.0.get_string(Self::COUNTRY)
    }

    /// Sets or clears the country.
    pub fn set_country(&mut self, country: Option<&str>) {
        self.0.set(Self::COUNTRY, country);
    }
}

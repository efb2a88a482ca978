//! Subscription model: one delivery channel of the user.

use super::store_model;
use crate::model::Model;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Delivery channel of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionType {
    /// Device push notifications.
    Push,
    /// Email address.
    Email,
    /// SMS phone number.
    Sms,
}

impl SubscriptionType {
    /// Returns the wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionType::Push => "push",
            SubscriptionType::Email => "email",
            SubscriptionType::Sms => "sms",
        }
    }

    /// Parses a wire name.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "push" => Some(SubscriptionType::Push),
            "email" => Some(SubscriptionType::Email),
            "sms" => Some(SubscriptionType::Sms),
            _ => None,
        }
    }
}

impl fmt::Display for SubscriptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One subscription (push token, email address, or phone number).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubscriptionModel(Model);

store_model!(SubscriptionModel);

impl SubscriptionModel {
    /// Property holding the subscription id.
    pub const ID: &'static str = "id";
    /// Property holding the channel name.
    pub const TYPE: &'static str = "type";
    /// Property holding the token, address, or number.
    pub const ADDRESS: &'static str = "address";
    /// Property holding the user's opt-in choice.
    pub const OPTED_IN: &'static str = "opted_in";
    /// Property holding the delivery status code.
    pub const STATUS: &'static str = "status";

    /// Status code of a subscription that can receive messages.
    pub const SUBSCRIBED: i64 = 1;

    /// Creates a subscription.
    pub fn new(id: &str, kind: SubscriptionType, address: &str, opted_in: bool, status: i64) -> Self {
        let mut model = Model::new();
        model.set(Self::ID, id);
        model.set(Self::TYPE, kind.as_str());
        model.set(Self::ADDRESS, address);
        model.set(Self::OPTED_IN, opted_in);
        model.set(Self::STATUS, status);
        model.take_changes();
        Self(model)
    }

    /// Returns the subscription id.
    pub fn id(&self) -> Option<&str> {
        self.0.get_string(Self::ID)
    }

    /// Sets the subscription id.
    pub fn set_id(&mut self, id: &str) {
        self.0.set(Self::ID, id);
    }

    /// Returns the channel; unknown or missing values read as push.
    pub fn kind(&self) -> SubscriptionType {
        self.0
            .get_string(Self::TYPE)
            .and_then(SubscriptionType::parse)
            .unwrap_or(SubscriptionType::Push)
    }

    /// Returns the token, address, or number.
    pub fn address(&self) -> &str {
        self.0.get_string(Self::ADDRESS).unwrap_or("")
    }

    /// Sets the token, address, or number.
    pub fn set_address(&mut self, address: &str) {
        self.0.set(Self::ADDRESS, address);
    }

    /// Returns the opt-in choice.
    pub fn opted_in(&self) -> bool {
        self.0.get_bool(Self::OPTED_IN)
    }

    /// Sets the opt-in choice.
    pub fn set_opted_in(&mut self, opted_in: bool) {
        self.0.set(Self::OPTED_IN, opted_in);
    }

    /// Returns the delivery status code.
    pub fn status(&self) -> i64 {
        self.0.get_int(Self::STATUS)
    }

    /// Sets the delivery status code.
    pub fn set_status(&mut self, status: i64) {
        self.0.set(Self::STATUS, status);
    }

    /// Returns true if messages may be delivered.
    pub fn enabled(&self) -> bool {
        self.opted_in() && self.status() == Self::SUBSCRIBED
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_names() {
        for kind in [SubscriptionType::Push, SubscriptionType::Email, SubscriptionType::Sms] {
            assert_eq!(SubscriptionType::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(SubscriptionType::parse("fax"), None);
    }

    #[test]
    fn enabled_requires_opt_in_and_status() {
        let mut sub = SubscriptionModel::new("s1", SubscriptionType::Email, "a@b.c", true, 1);
        assert!(sub.enabled());
        sub.set_opted_in(false);
        assert!(!sub.enabled());
        sub.set_opted_in(true);
        sub.set_status(-3);
        assert!(!sub.enabled());
    }

    #[test]
    fn defaults() {
        let sub = SubscriptionModel::default();
        assert_eq!(sub.id(), None);
        assert_eq!(sub.kind(), SubscriptionType::Push);
        assert_eq!(sub.address(), "");
        assert!(!sub.enabled());
    }
}

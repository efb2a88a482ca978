//! Queued operations.
//!
//! An [`Operation`] is one intended change destined for the backend: a
//! shared envelope (operation id, app id, acting user, creation time) and a
//! closed [`OperationKind`] payload. The queue relies on four per-kind
//! properties:
//!
//! - the coalescing key: pending operations sharing it collapse into the
//!   newest one
//! - the comparison keys and [`GroupComparisonType`]: operations sharing a
//!   key are handed to one executor call
//! - [`Operation::can_start_execute`]: false while an id the call needs is
//!   still a local placeholder
//! - [`Operation::translate_ids`]: rewrites placeholder ids once promoted

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use usersync_core::id::is_local_id;
use usersync_core::{PropertyValue, SubscriptionModel, SubscriptionType};
use uuid::Uuid;

/// Discriminant of [`OperationKind`], used to route operations to executors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationName {
    /// Create or identify a user.
    LoginUser,
    /// Set an alias.
    SetAlias,
    /// Delete an alias.
    DeleteAlias,
    /// Set a tag.
    SetTag,
    /// Delete a tag.
    DeleteTag,
    /// Set a user property.
    SetProperty,
    /// Create a subscription.
    CreateSubscription,
    /// Update a subscription.
    UpdateSubscription,
    /// Delete a subscription.
    DeleteSubscription,
    /// Move a subscription to another user.
    TransferSubscription,
    /// Re-read the user from the backend.
    RefreshUser,
}

impl OperationName {
    /// Every operation name.
    pub const ALL: [OperationName; 11] = [
        OperationName::LoginUser,
        OperationName::SetAlias,
        OperationName::DeleteAlias,
        OperationName::SetTag,
        OperationName::DeleteTag,
        OperationName::SetProperty,
        OperationName::CreateSubscription,
        OperationName::UpdateSubscription,
        OperationName::DeleteSubscription,
        OperationName::TransferSubscription,
        OperationName::RefreshUser,
    ];

    /// Returns the persisted name.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationName::LoginUser => "login_user",
            OperationName::SetAlias => "set_alias",
            OperationName::DeleteAlias => "delete_alias",
            OperationName::SetTag => "set_tag",
            OperationName::DeleteTag => "delete_tag",
            OperationName::SetProperty => "set_property",
            OperationName::CreateSubscription => "create_subscription",
            OperationName::UpdateSubscription => "update_subscription",
            OperationName::DeleteSubscription => "delete_subscription",
            OperationName::TransferSubscription => "transfer_subscription",
            OperationName::RefreshUser => "refresh_user",
        }
    }
}

impl fmt::Display for OperationName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an operation is grouped with others into one executor call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupComparisonType {
    /// Gathers operations sharing the create comparison key.
    Create,
    /// Gathers operations sharing the modify comparison key.
    Alter,
    /// Always executes alone.
    None,
}

/// Subscription fields carried by create and update operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionFields {
    /// Subscription id (local until created).
    pub subscription_id: String,
    /// Channel.
    pub subscription_type: SubscriptionType,
    /// Token, address or number.
    pub address: String,
    /// Opt-in choice.
    pub opted_in: bool,
    /// Delivery status code.
    pub status: i64,
}

impl SubscriptionFields {
    /// Captures the fields of a subscription model.
    pub fn from_model(model: &SubscriptionModel) -> Option<Self> {
        Some(Self {
            subscription_id: model.id()?.to_string(),
            subscription_type: model.kind(),
            address: model.address().to_string(),
            opted_in: model.opted_in(),
            status: model.status(),
        })
    }
}

/// Kind-specific payload of an [`Operation`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum OperationKind {
    /// Creates the user `onesignal_id` (a local id), or attaches
    /// `external_id` to `existing_onesignal_id` when that anonymous user
    /// already exists on the backend.
    LoginUser {
        /// Application user id, if identified.
        external_id: Option<String>,
        /// Anonymous user to identify instead of creating a new one.
        existing_onesignal_id: Option<String>,
    },
    /// Sets an alias on the user.
    SetAlias {
        /// Alias label.
        label: String,
        /// Alias id.
        value: String,
    },
    /// Deletes an alias from the user.
    DeleteAlias {
        /// Alias label.
        label: String,
    },
    /// Sets a tag.
    SetTag {
        /// Tag key.
        key: String,
        /// Tag value.
        value: String,
    },
    /// Deletes a tag.
    DeleteTag {
        /// Tag key.
        key: String,
    },
    /// Sets a descriptive user property.
    SetProperty {
        /// Property name.
        property: String,
        /// New value; null clears it.
        value: PropertyValue,
    },
    /// Creates a subscription owned by the user.
    CreateSubscription(SubscriptionFields),
    /// Updates a subscription.
    UpdateSubscription(SubscriptionFields),
    /// Deletes a subscription.
    DeleteSubscription {
        /// Subscription id.
        subscription_id: String,
    },
    /// Moves a subscription to the user.
    TransferSubscription {
        /// Subscription id.
        subscription_id: String,
    },
    /// Re-reads the user and hydrates the local models.
    RefreshUser,
}

/// One queued intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Unique operation id.
    pub id: String,
    /// Application the user belongs to.
    pub app_id: String,
    /// Acting user; a local id until the user is created.
    pub onesignal_id: String,
    /// Creation time in milliseconds since the Unix epoch.
    pub created_at: i64,
    /// Payload.
    #[serde(flatten)]
    pub kind: OperationKind,
}

impl Operation {
    /// Creates an operation stamped with a fresh id and the current time.
    pub fn new(app_id: impl Into<String>, onesignal_id: impl Into<String>, kind: OperationKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            app_id: app_id.into(),
            onesignal_id: onesignal_id.into(),
            created_at: now_millis(),
            kind,
        }
    }

    /// Creates a login operation.
    pub fn login_user(
        app_id: &str,
        onesignal_id: &str,
        external_id: Option<&str>,
        existing_onesignal_id: Option<&str>,
    ) -> Self {
        Self::new(
            app_id,
            onesignal_id,
            OperationKind::LoginUser {
                external_id: external_id.map(str::to_string),
                existing_onesignal_id: existing_onesignal_id.map(str::to_string),
            },
        )
    }

    /// Creates a set-alias operation.
    pub fn set_alias(app_id: &str, onesignal_id: &str, label: &str, value: &str) -> Self {
        Self::new(
            app_id,
            onesignal_id,
            OperationKind::SetAlias {
                label: label.to_string(),
                value: value.to_string(),
            },
        )
    }

    /// Creates a delete-alias operation.
    pub fn delete_alias(app_id: &str, onesignal_id: &str, label: &str) -> Self {
        Self::new(
            app_id,
            onesignal_id,
            OperationKind::DeleteAlias {
                label: label.to_string(),
            },
        )
    }

    /// Creates a set-tag operation.
    pub fn set_tag(app_id: &str, onesignal_id: &str, key: &str, value: &str) -> Self {
        Self::new(
            app_id,
            onesignal_id,
            OperationKind::SetTag {
                key: key.to_string(),
                value: value.to_string(),
            },
        )
    }

    /// Creates a delete-tag operation.
    pub fn delete_tag(app_id: &str, onesignal_id: &str, key: &str) -> Self {
        Self::new(
            app_id,
            onesignal_id,
            OperationKind::DeleteTag {
                key: key.to_string(),
            },
        )
    }

    /// Creates a set-property operation.
    pub fn set_property(
        app_id: &str,
        onesignal_id: &str,
        property: &str,
        value: impl Into<PropertyValue>,
    ) -> Self {
        Self::new(
            app_id,
            onesignal_id,
            OperationKind::SetProperty {
                property: property.to_string(),
                value: value.into(),
            },
        )
    }

    /// Creates a create-subscription operation.
    pub fn create_subscription(app_id: &str, onesignal_id: &str, fields: SubscriptionFields) -> Self {
        Self::new(app_id, onesignal_id, OperationKind::CreateSubscription(fields))
    }

    /// Creates an update-subscription operation.
    pub fn update_subscription(app_id: &str, onesignal_id: &str, fields: SubscriptionFields) -> Self {
        Self::new(app_id, onesignal_id, OperationKind::UpdateSubscription(fields))
    }

    /// Creates a delete-subscription operation.
    pub fn delete_subscription(app_id: &str, onesignal_id: &str, subscription_id: &str) -> Self {
        Self::new(
            app_id,
            onesignal_id,
            OperationKind::DeleteSubscription {
                subscription_id: subscription_id.to_string(),
            },
        )
    }

    /// Creates a transfer-subscription operation.
    pub fn transfer_subscription(app_id: &str, onesignal_id: &str, subscription_id: &str) -> Self {
        Self::new(
            app_id,
            onesignal_id,
            OperationKind::TransferSubscription {
                subscription_id: subscription_id.to_string(),
            },
        )
    }

    /// Creates a refresh operation.
    pub fn refresh_user(app_id: &str, onesignal_id: &str) -> Self {
        Self::new(app_id, onesignal_id, OperationKind::RefreshUser)
    }

    /// Returns the operation's discriminant.
    pub fn name(&self) -> OperationName {
        match &self.kind {
            OperationKind::LoginUser { .. } => OperationName::LoginUser,
            OperationKind::SetAlias { .. } => OperationName::SetAlias,
            OperationKind::DeleteAlias { .. } => OperationName::DeleteAlias,
            OperationKind::SetTag { .. } => OperationName::SetTag,
            OperationKind::DeleteTag { .. } => OperationName::DeleteTag,
            OperationKind::SetProperty { .. } => OperationName::SetProperty,
            OperationKind::CreateSubscription(_) => OperationName::CreateSubscription,
            OperationKind::UpdateSubscription(_) => OperationName::UpdateSubscription,
            OperationKind::DeleteSubscription { .. } => OperationName::DeleteSubscription,
            OperationKind::TransferSubscription { .. } => OperationName::TransferSubscription,
            OperationKind::RefreshUser => OperationName::RefreshUser,
        }
    }

    /// Returns the drain group: operations of one group run strictly in
    /// queue order, one executor call at a time.
    pub fn group_key(&self) -> String {
        format!("{}/{}", self.app_id, self.onesignal_id)
    }

    /// Returns the subscription id the operation addresses, if any.
    pub fn subscription_id(&self) -> Option<&str> {
        match &self.kind {
            OperationKind::CreateSubscription(fields) | OperationKind::UpdateSubscription(fields) => {
                Some(&fields.subscription_id)
            }
            OperationKind::DeleteSubscription { subscription_id }
            | OperationKind::TransferSubscription { subscription_id } => Some(subscription_id),
            _ => None,
        }
    }

    /// Returns true for subscription operations.
    pub fn is_subscription_operation(&self) -> bool {
        self.subscription_id().is_some()
    }

    /// Returns the key pending duplicates of this edit collapse on.
    pub fn coalesce_key(&self) -> Option<String> {
        let scope = format!("{}.{}", self.app_id, self.onesignal_id);
        match &self.kind {
            OperationKind::SetTag { key, .. } | OperationKind::DeleteTag { key } => {
                Some(format!("tag:{scope}.{key}"))
            }
            OperationKind::SetAlias { label, .. } | OperationKind::DeleteAlias { label } => {
                Some(format!("alias:{scope}.{label}"))
            }
            OperationKind::SetProperty { property, .. } => Some(format!("property:{scope}.{property}")),
            OperationKind::UpdateSubscription(fields) => {
                Some(format!("subscription:{scope}.{}", fields.subscription_id))
            }
            _ => None,
        }
    }

    /// Returns how this operation gathers companions.
    pub fn group_comparison_type(&self) -> GroupComparisonType {
        match &self.kind {
            OperationKind::LoginUser { .. } => GroupComparisonType::Create,
            OperationKind::SetAlias { .. }
            | OperationKind::DeleteAlias { .. }
            | OperationKind::SetTag { .. }
            | OperationKind::DeleteTag { .. }
            | OperationKind::SetProperty { .. }
            | OperationKind::CreateSubscription(_)
            | OperationKind::UpdateSubscription(_) => GroupComparisonType::Alter,
            OperationKind::DeleteSubscription { .. }
            | OperationKind::TransferSubscription { .. }
            | OperationKind::RefreshUser => GroupComparisonType::None,
        }
    }

    /// Returns the key of calls that create the user.
    pub fn create_comparison_key(&self) -> Option<String> {
        match &self.kind {
            OperationKind::LoginUser { .. } | OperationKind::CreateSubscription(_) => {
                Some(self.user_key())
            }
            _ => None,
        }
    }

    /// Returns the key of calls that modify one backend record.
    pub fn modify_comparison_key(&self) -> Option<String> {
        match &self.kind {
            OperationKind::SetAlias { .. } | OperationKind::DeleteAlias { .. } => {
                Some(format!("{}.Identity.{}", self.app_id, self.onesignal_id))
            }
            OperationKind::SetTag { .. }
            | OperationKind::DeleteTag { .. }
            | OperationKind::SetProperty { .. } => Some(self.user_key()),
            OperationKind::CreateSubscription(fields) | OperationKind::UpdateSubscription(fields) => {
                Some(self.subscription_key(&fields.subscription_id))
            }
            OperationKind::DeleteSubscription { subscription_id }
            | OperationKind::TransferSubscription { subscription_id } => {
                Some(self.subscription_key(subscription_id))
            }
            OperationKind::LoginUser { .. } | OperationKind::RefreshUser => None,
        }
    }

    /// Returns true if every id the call needs has been promoted.
    pub fn can_start_execute(&self) -> bool {
        self.awaits().is_empty()
    }

    /// Local ids that must be promoted before this operation can run.
    pub fn awaits(&self) -> Vec<&str> {
        let ids: Vec<&str> = match &self.kind {
            OperationKind::LoginUser {
                existing_onesignal_id,
                ..
            } => existing_onesignal_id.iter().map(String::as_str).collect(),
            OperationKind::CreateSubscription(_) => vec![self.onesignal_id.as_str()],
            OperationKind::UpdateSubscription(SubscriptionFields { subscription_id, .. })
            | OperationKind::DeleteSubscription { subscription_id }
            | OperationKind::TransferSubscription { subscription_id } => {
                vec![self.onesignal_id.as_str(), subscription_id.as_str()]
            }
            _ => vec![self.onesignal_id.as_str()],
        };
        ids.into_iter().filter(|id| is_local_id(id)).collect()
    }

    /// Local ids this operation promotes to backend ids when applied.
    pub fn establishes(&self) -> Vec<&str> {
        let id = match &self.kind {
            OperationKind::LoginUser { .. } => Some(self.onesignal_id.as_str()),
            OperationKind::CreateSubscription(fields) => Some(fields.subscription_id.as_str()),
            _ => None,
        };
        id.into_iter().filter(|id| is_local_id(id)).collect()
    }

    /// Returns true if this operation establishes its user on the backend
    /// rather than addressing an existing one.
    pub fn creates_user(&self) -> bool {
        matches!(self.kind, OperationKind::LoginUser { .. })
    }

    /// Returns true if this operation may ride along in a batch another
    /// operation started.
    ///
    /// Logins, transfers and refreshes always start their own batch.
    pub fn joins_batches(&self) -> bool {
        !matches!(
            self.kind,
            OperationKind::LoginUser { .. }
                | OperationKind::TransferSubscription { .. }
                | OperationKind::RefreshUser
        )
    }

    /// Returns true if any id field equals `id`.
    pub fn references(&self, id: &str) -> bool {
        if self.onesignal_id == id || self.subscription_id() == Some(id) {
            return true;
        }
        matches!(
            &self.kind,
            OperationKind::LoginUser { existing_onesignal_id: Some(existing), .. } if existing == id
        )
    }

    /// Rewrites every id found in `translations`. Returns true if anything
    /// changed.
    pub fn translate_ids(&mut self, translations: &BTreeMap<String, String>) -> bool {
        let mut changed = translate(&mut self.onesignal_id, translations);
        match &mut self.kind {
            OperationKind::LoginUser {
                existing_onesignal_id: Some(existing),
                ..
            } => changed |= translate(existing, translations),
            OperationKind::CreateSubscription(fields) | OperationKind::UpdateSubscription(fields) => {
                changed |= translate(&mut fields.subscription_id, translations);
            }
            OperationKind::DeleteSubscription { subscription_id }
            | OperationKind::TransferSubscription { subscription_id } => {
                changed |= translate(subscription_id, translations);
            }
            _ => {}
        }
        changed
    }

    /// Returns true if both operations carry the same intent, ignoring the
    /// operation id and timestamp.
    pub fn same_intent(&self, other: &Operation) -> bool {
        self.app_id == other.app_id && self.onesignal_id == other.onesignal_id && self.kind == other.kind
    }

    fn user_key(&self) -> String {
        format!("{}.User.{}", self.app_id, self.onesignal_id)
    }

    fn subscription_key(&self, subscription_id: &str) -> String {
        format!("{}.User.{}.Subscription.{}", self.app_id, self.onesignal_id, subscription_id)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.onesignal_id)?;
        if let Some(subscription_id) = self.subscription_id() {
            write!(f, "[{subscription_id}]")?;
        }
        Ok(())
    }
}

fn translate(id: &mut String, translations: &BTreeMap<String, String>) -> bool {
    match translations.get(id.as_str()) {
        Some(promoted) if promoted != id => {
            *id = promoted.clone();
            true
        }
        _ => false,
    }
}

pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

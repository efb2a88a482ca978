//! Identity rebuild.
//!
//! When the backend turns out to have lost a user (or never finished
//! creating it) after local state moved on, the rebuild service produces
//! the operations that recreate it: a login for the identity, a create for
//! the device's push subscription, and a refresh to pull the result back.

use crate::operation::{Operation, SubscriptionFields};
use crate::stores::UserStores;
use std::sync::Arc;

/// Regenerates the operations that recreate the current user.
pub struct RebuildService {
    stores: Arc<UserStores>,
}

impl RebuildService {
    /// Creates a service reading `stores`.
    pub fn new(stores: Arc<UserStores>) -> Self {
        Self { stores }
    }

    /// Returns the rebuild operations for `onesignal_id`, or `None` if it
    /// is no longer the current user.
    pub fn get_rebuild_operations(&self, app_id: &str, onesignal_id: &str) -> Option<Vec<Operation>> {
        // Copies, so concurrent edits cannot change them under us.
        let identity = self.stores.identity.model();
        let config = self.stores.config.model();
        let push = config
            .push_subscription_id()
            .and_then(|id| self.stores.subscriptions.get(id));

        if identity.onesignal_id() != Some(onesignal_id) {
            tracing::debug!(onesignal_id, "skipping rebuild of a user that is no longer current");
            return None;
        }

        let mut operations = vec![Operation::login_user(
            app_id,
            onesignal_id,
            identity.external_id(),
            None,
        )];
        if let Some(fields) = push.as_ref().and_then(SubscriptionFields::from_model) {
            operations.push(Operation::create_subscription(app_id, onesignal_id, fields));
        }
        operations.push(Operation::refresh_user(app_id, onesignal_id));

        tracing::info!(onesignal_id, count = operations.len(), "rebuilding user");
        Some(operations)
    }
}

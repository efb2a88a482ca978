use super::{unexpected, ExecutionResponse, ExecutorContext, OperationExecutor};
use crate::backend::UserResponse;
use crate::operation::{Operation, OperationKind, OperationName};
use async_trait::async_trait;
use usersync_core::{IdentityModel, ModelChangeTag, PropertiesModel, SubscriptionModel};

/// Re-reads the user and overwrites the local models with the backend's
/// view.
pub struct RefreshUserExecutor {
    context: ExecutorContext,
}

impl RefreshUserExecutor {
    /// Creates the executor.
    pub fn new(context: ExecutorContext) -> Self {
        Self { context }
    }

    fn hydrate(&self, onesignal_id: &str, user: &UserResponse) {
        let stores = &self.context.stores;

        let mut identity = IdentityModel::with_onesignal_id(onesignal_id);
        for (label, value) in &user.identity {
            identity.set_alias(label, Some(value));
        }

        let mut properties = PropertiesModel::with_onesignal_id(onesignal_id);
        for (key, value) in &user.properties.tags {
            properties.set_tag(key, Some(value));
        }
        properties.set_language(user.properties.language.as_deref());
        properties.set_timezone(user.properties.timezone_id.as_deref());
        properties.set_country(user.properties.country.as_deref());

        let mut subscriptions: Vec<SubscriptionModel> = user
            .subscriptions
            .iter()
            .filter_map(|s| {
                let id = s.id.as_deref()?;
                Some(SubscriptionModel::new(
                    id,
                    s.subscription_type,
                    &s.token,
                    s.enabled,
                    s.notification_types,
                ))
            })
            .collect();
        // The device's own push subscription is authoritative locally.
        if let Some(push) = stores.push_subscription() {
            subscriptions.retain(|s| s.id() != push.id());
            subscriptions.push(push);
        }

        stores.identity.replace(identity, ModelChangeTag::Hydrate);
        stores.properties.replace(properties, ModelChangeTag::Hydrate);
        stores
            .subscriptions
            .replace_all(subscriptions, ModelChangeTag::Hydrate);
    }
}

#[async_trait]
impl OperationExecutor for RefreshUserExecutor {
    fn operations(&self) -> &'static [OperationName] {
        &[OperationName::RefreshUser]
    }

    async fn execute(&self, operations: Vec<Operation>) -> ExecutionResponse {
        let Some(first) = operations.first() else {
            return ExecutionResponse::success();
        };
        if !matches!(first.kind, OperationKind::RefreshUser) {
            return unexpected(first, "RefreshUserExecutor");
        }

        let user = match self
            .context
            .backends
            .users
            .get_user(&first.app_id, &first.onesignal_id)
            .await
        {
            Ok(user) => user,
            Err(error) => {
                tracing::warn!(op = %first, %error, "refresh user failed");
                return self.context.failure_response(first, &error);
            }
        };

        // The user may have logged out while the call was in flight.
        if !self.context.stores.is_current_user(&first.onesignal_id) {
            tracing::debug!(onesignal_id = %first.onesignal_id, "discarding refresh of a stale user");
            return ExecutionResponse::success();
        }

        self.hydrate(&first.onesignal_id, &user);
        tracing::debug!(
            onesignal_id = %first.onesignal_id,
            subscriptions = user.subscriptions.len(),
            "user refreshed"
        );
        ExecutionResponse::success()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MockBackend, UpdateUserRequest, UserBackend};
    use crate::executor::testing::{context, make_current};
    use crate::executor::ExecutionResult;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use usersync_core::SubscriptionType;

    #[tokio::test]
    async fn hydrates_current_user_and_keeps_push() {
        let backend = Arc::new(MockBackend::new());
        let mut aliases = BTreeMap::new();
        aliases.insert("external_id".to_string(), "alice".to_string());
        let user = backend.insert_user(aliases);
        let mut request = UpdateUserRequest::default();
        request.tags.insert("level".into(), Some("3".into()));
        backend.update_user("app", &user, &request).await.unwrap();

        let context = context(backend.clone());
        make_current(&context, &user, None);
        context.stores.subscriptions.add(
            SubscriptionModel::new("push-1", SubscriptionType::Push, "tok", true, 1),
            ModelChangeTag::NoPropagate,
        );
        context.stores.subscriptions.add(
            SubscriptionModel::new("stale", SubscriptionType::Email, "old@x.io", true, 1),
            ModelChangeTag::NoPropagate,
        );
        context.stores.config.update(ModelChangeTag::NoPropagate, |c| {
            c.set_push_subscription_id(Some("push-1"))
        });

        let response = RefreshUserExecutor::new(context.clone())
            .execute(vec![Operation::refresh_user("app", &user)])
            .await;

        assert_eq!(response.result, ExecutionResult::Success);
        assert_eq!(context.stores.identity.model().external_id(), Some("alice"));
        assert_eq!(
            context.stores.properties.model().tags().get("level").map(String::as_str),
            Some("3")
        );
        let ids: Vec<_> = context
            .stores
            .subscriptions
            .list()
            .iter()
            .filter_map(|s| s.id().map(str::to_string))
            .collect();
        assert_eq!(ids, vec!["push-1".to_string()]);
    }

    #[tokio::test]
    async fn stale_refresh_changes_nothing() {
        let backend = Arc::new(MockBackend::new());
        let user = backend.insert_user(BTreeMap::new());
        let context = context(backend);
        make_current(&context, "somebody-else", Some("bob"));

        let response = RefreshUserExecutor::new(context.clone())
            .execute(vec![Operation::refresh_user("app", &user)])
            .await;
        assert_eq!(response.result, ExecutionResult::Success);
        assert_eq!(context.stores.identity.model().external_id(), Some("bob"));
    }
}

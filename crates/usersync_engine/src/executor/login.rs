use super::{unexpected, ExecutionResponse, ExecutorContext, OperationExecutor, OperationFailure};
use crate::backend::{CreateUserRequest, ErrorClass, UserResponse};
use crate::executor::subscription::subscription_object;
use crate::operation::{Operation, OperationKind, OperationName, SubscriptionFields};
use async_trait::async_trait;
use std::collections::BTreeMap;
use usersync_core::{IdentityModel, ModelChangeTag, TokenKind};

/// Creates users and attaches external ids to anonymous ones.
///
/// Pending subscription creates of the same user ride along in the create
/// call, so a fresh user and its device subscription appear together.
pub struct LoginUserExecutor {
    context: ExecutorContext,
}

impl LoginUserExecutor {
    /// Creates the executor.
    pub fn new(context: ExecutorContext) -> Self {
        Self { context }
    }

    async fn identify(
        &self,
        operation: &Operation,
        external_id: &str,
        existing_onesignal_id: &str,
        companions: &[Operation],
    ) -> Option<ExecutionResponse> {
        let mut aliases = BTreeMap::new();
        aliases.insert(IdentityModel::EXTERNAL_ID.to_string(), external_id.to_string());

        let result = self
            .context
            .backends
            .identity
            .set_aliases(
                &operation.app_id,
                IdentityModel::ONESIGNAL_ID,
                existing_onesignal_id,
                &aliases,
            )
            .await;

        match result {
            Ok(identity) => {
                let mut translations = BTreeMap::new();
                translations.insert(
                    operation.onesignal_id.clone(),
                    existing_onesignal_id.to_string(),
                );
                self.hydrate_identity(&operation.onesignal_id, &identity);
                tracing::debug!(
                    local = %operation.onesignal_id,
                    onesignal_id = existing_onesignal_id,
                    "identified anonymous user"
                );
                // Subscription creates were not sent; they run next.
                Some(ExecutionResponse::translated(translations).with_unsent(companions.len()))
            }
            Err(error) => match error.classify() {
                // The external id belongs to another user, or the anonymous
                // user is gone: log in by creating instead.
                ErrorClass::Conflict | ErrorClass::Missing => None,
                ErrorClass::Retryable => Some(ExecutionResponse::retry(error.retry_after)),
                ErrorClass::Unauthorized | ErrorClass::Invalid => Some(ExecutionResponse::terminal(
                    OperationFailure::from_backend(&error),
                )),
            },
        }
    }

    async fn create(
        &self,
        operation: &Operation,
        external_id: Option<&str>,
        creates: &[&SubscriptionFields],
    ) -> ExecutionResponse {
        let mut request = CreateUserRequest::default();
        if let Some(external_id) = external_id {
            request
                .identity
                .insert(IdentityModel::EXTERNAL_ID.to_string(), external_id.to_string());
        }
        request.subscriptions = creates
            .iter()
            .map(|fields| subscription_object(fields, false))
            .collect();

        let user = match self
            .context
            .backends
            .users
            .create_user(&operation.app_id, &request)
            .await
        {
            Ok(user) => user,
            Err(error) => {
                return match error.classify() {
                    ErrorClass::Retryable => ExecutionResponse::retry(error.retry_after),
                    _ => ExecutionResponse::terminal(OperationFailure::from_backend(&error)),
                };
            }
        };

        let Some(onesignal_id) = user.onesignal_id().map(str::to_string) else {
            return ExecutionResponse::terminal(OperationFailure::new(
                "create user response carries no onesignal_id",
            ));
        };

        let mut translations = BTreeMap::new();
        if operation.onesignal_id != onesignal_id {
            translations.insert(operation.onesignal_id.clone(), onesignal_id.clone());
        }
        let subscription_ids = match_subscriptions(creates, &user);
        translations.extend(subscription_ids.iter().map(|(k, v)| (k.clone(), v.clone())));

        self.context.new_records.add(&onesignal_id);
        for id in subscription_ids.values() {
            self.context.new_records.add(id);
        }

        if let Some(token) = &user.ryw_token {
            let mut kinds = vec![TokenKind::UserUpdate];
            if !creates.is_empty() {
                kinds.push(TokenKind::SubscriptionUpdate);
            }
            for kind in kinds {
                self.context
                    .consistency
                    .set_token(&onesignal_id, kind, token.clone());
                // Waiters registered before promotion still watch the local id.
                if operation.onesignal_id != onesignal_id {
                    self.context
                        .consistency
                        .set_token(&operation.onesignal_id, kind, token.clone());
                }
            }
        }

        self.hydrate_identity(&operation.onesignal_id, &user.identity);
        self.hydrate_subscriptions(&subscription_ids);

        tracing::info!(
            local = %operation.onesignal_id,
            onesignal_id = %onesignal_id,
            subscriptions = subscription_ids.len(),
            "user created"
        );
        ExecutionResponse::translated(translations)
    }

    fn hydrate_identity(&self, previous_id: &str, identity: &BTreeMap<String, String>) {
        let stores = &self.context.stores;
        if !stores.is_current_user(previous_id) {
            return;
        }
        let Some(onesignal_id) = identity.get(IdentityModel::ONESIGNAL_ID) else {
            return;
        };
        stores.identity.update(ModelChangeTag::Hydrate, |model| {
            for (label, value) in identity {
                model.set_alias(label, Some(value));
            }
        });
        stores
            .properties
            .update(ModelChangeTag::Hydrate, |model| model.set_onesignal_id(onesignal_id));
    }

    fn hydrate_subscriptions(&self, subscription_ids: &BTreeMap<String, String>) {
        let stores = &self.context.stores;
        for (local, promoted) in subscription_ids {
            stores
                .subscriptions
                .update(local, ModelChangeTag::Hydrate, |model| model.set_id(promoted));
            stores.config.update(ModelChangeTag::Hydrate, |config| {
                if config.push_subscription_id() == Some(local.as_str()) {
                    config.set_push_subscription_id(Some(promoted));
                }
            });
        }
    }
}

/// Pairs each requested subscription with the returned one of the same
/// channel and token.
fn match_subscriptions(creates: &[&SubscriptionFields], user: &UserResponse) -> BTreeMap<String, String> {
    let mut taken = vec![false; user.subscriptions.len()];
    let mut ids = BTreeMap::new();
    for fields in creates {
        let found = user.subscriptions.iter().enumerate().find(|(i, s)| {
            !taken[*i] && s.subscription_type == fields.subscription_type && s.token == fields.address
        });
        if let Some((i, subscription)) = found {
            taken[i] = true;
            if let Some(id) = &subscription.id {
                if *id != fields.subscription_id {
                    ids.insert(fields.subscription_id.clone(), id.clone());
                }
            }
        }
    }
    ids
}

#[async_trait]
impl OperationExecutor for LoginUserExecutor {
    fn operations(&self) -> &'static [OperationName] {
        &[OperationName::LoginUser]
    }

    async fn execute(&self, operations: Vec<Operation>) -> ExecutionResponse {
        let Some((first, companions)) = operations.split_first() else {
            return ExecutionResponse::success();
        };
        let OperationKind::LoginUser {
            external_id,
            existing_onesignal_id,
        } = &first.kind
        else {
            return unexpected(first, "LoginUserExecutor");
        };

        if let (Some(external_id), Some(existing)) = (external_id, existing_onesignal_id) {
            if let Some(response) = self.identify(first, external_id, existing, companions).await {
                return response;
            }
        }

        let creates: Vec<&SubscriptionFields> = companions
            .iter()
            .filter_map(|op| match &op.kind {
                OperationKind::CreateSubscription(fields) => Some(fields),
                _ => None,
            })
            .collect();
        self.create(first, external_id.as_deref(), &creates).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendError, MockBackend};
    use crate::executor::testing::{context, make_current};
    use crate::executor::ExecutionResult;
    use std::sync::Arc;
    use usersync_core::id::create_local_id;
    use usersync_core::{SubscriptionModel, SubscriptionType};

    fn push(id: &str) -> SubscriptionFields {
        SubscriptionFields {
            subscription_id: id.to_string(),
            subscription_type: SubscriptionType::Push,
            address: "device-token".into(),
            opted_in: true,
            status: 1,
        }
    }

    #[tokio::test]
    async fn create_translates_user_and_subscription() {
        let backend = Arc::new(MockBackend::new());
        let context = context(backend.clone());
        let local_user = create_local_id();
        let local_sub = create_local_id();
        make_current(&context, &local_user, Some("alice"));
        context.stores.subscriptions.add(
            SubscriptionModel::new(&local_sub, SubscriptionType::Push, "device-token", true, 1),
            ModelChangeTag::NoPropagate,
        );
        context.stores.config.update(ModelChangeTag::NoPropagate, |c| {
            c.set_push_subscription_id(Some(&local_sub))
        });

        let executor = LoginUserExecutor::new(context.clone());
        let response = executor
            .execute(vec![
                Operation::login_user("app", &local_user, Some("alice"), None),
                Operation::create_subscription("app", &local_user, push(&local_sub)),
            ])
            .await;

        let ExecutionResult::SuccessWithIdTranslation(map) = response.result else {
            panic!("expected translation, got {:?}", response.result);
        };
        let user_id = map[&local_user].clone();
        let sub_id = map[&local_sub].clone();
        assert_eq!(backend.call_count("create_user"), 1);

        assert_eq!(context.stores.current_onesignal_id(), Some(user_id.clone()));
        assert_eq!(context.stores.properties.model().onesignal_id(), Some(user_id.as_str()));
        assert!(context.stores.subscriptions.get(&sub_id).is_some());
        assert_eq!(
            context.stores.config.model().push_subscription_id(),
            Some(sub_id.as_str())
        );
        assert!(context.consistency.tokens(&user_id).contains_key(&TokenKind::UserUpdate));
        assert!(context.consistency.tokens(&local_user).contains_key(&TokenKind::SubscriptionUpdate));
        assert!(context.new_records.is_in_missing_retry_window(&user_id));
    }

    #[tokio::test]
    async fn identify_attaches_external_id() {
        let backend = Arc::new(MockBackend::new());
        let anonymous = backend.insert_user(BTreeMap::new());
        let context = context(backend.clone());
        let local_user = create_local_id();
        make_current(&context, &local_user, Some("bob"));

        let response = LoginUserExecutor::new(context.clone())
            .execute(vec![
                Operation::login_user("app", &local_user, Some("bob"), Some(&anonymous)),
                Operation::create_subscription("app", &local_user, push("s")),
            ])
            .await;

        let ExecutionResult::SuccessWithIdTranslation(map) = response.result else {
            panic!("expected translation");
        };
        assert_eq!(map[&local_user], anonymous);
        assert_eq!(response.unsent, 1);
        assert!(response.follow_ups.is_empty());
        assert_eq!(backend.call_count("create_user"), 0);
        assert_eq!(backend.call_count("create_subscription"), 0);
        assert_eq!(context.stores.current_onesignal_id(), Some(anonymous));
        assert_eq!(context.stores.identity.model().external_id(), Some("bob"));
    }

    #[tokio::test]
    async fn identify_conflict_falls_back_to_create() {
        let backend = Arc::new(MockBackend::new());
        let mut carol = BTreeMap::new();
        carol.insert("external_id".to_string(), "carol".to_string());
        let existing_carol = backend.insert_user(carol);
        let anonymous = backend.insert_user(BTreeMap::new());

        let context = context(backend.clone());
        let local_user = create_local_id();
        let response = LoginUserExecutor::new(context)
            .execute(vec![Operation::login_user(
                "app",
                &local_user,
                Some("carol"),
                Some(&anonymous),
            )])
            .await;

        let ExecutionResult::SuccessWithIdTranslation(map) = response.result else {
            panic!("expected translation");
        };
        assert_eq!(map[&local_user], existing_carol);
        assert_eq!(backend.call_count("set_aliases"), 1);
        assert_eq!(backend.call_count("create_user"), 1);
    }

    #[tokio::test]
    async fn server_errors_retry_and_validation_errors_fail() {
        let backend = Arc::new(MockBackend::new());
        let context = context(backend.clone());
        let executor = LoginUserExecutor::new(context);
        let op = Operation::login_user("app", &create_local_id(), None, None);

        backend.fail_next("create_user", BackendError::status(502, None));
        assert_eq!(
            executor.execute(vec![op.clone()]).await.result,
            ExecutionResult::RetryAfter(None)
        );

        backend.fail_next("create_user", BackendError::status(400, None));
        assert!(matches!(
            executor.execute(vec![op]).await.result,
            ExecutionResult::TerminalFailure(_)
        ));
    }

    #[tokio::test]
    async fn stale_user_is_not_hydrated() {
        let backend = Arc::new(MockBackend::new());
        let context = context(backend);
        make_current(&context, "someone-else", None);
        let local_user = create_local_id();

        LoginUserExecutor::new(context.clone())
            .execute(vec![Operation::login_user("app", &local_user, None, None)])
            .await;
        assert_eq!(
            context.stores.current_onesignal_id().as_deref(),
            Some("someone-else")
        );
    }
}

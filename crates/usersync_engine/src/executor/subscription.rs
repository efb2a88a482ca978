use super::{unexpected, ExecutionResponse, ExecutorContext, OperationExecutor};
use crate::backend::{ErrorClass, SubscriptionObject};
use crate::operation::{Operation, OperationKind, OperationName, SubscriptionFields};
use async_trait::async_trait;
use std::collections::BTreeMap;
use usersync_core::{ModelChangeTag, TokenKind};

/// Builds the wire form of a subscription.
pub(crate) fn subscription_object(fields: &SubscriptionFields, include_id: bool) -> SubscriptionObject {
    SubscriptionObject {
        id: include_id.then(|| fields.subscription_id.clone()),
        subscription_type: fields.subscription_type,
        token: fields.address.clone(),
        enabled: fields.opted_in,
        notification_types: fields.status,
    }
}

/// Creates, updates, deletes and transfers subscriptions.
pub struct SubscriptionExecutor {
    context: ExecutorContext,
}

impl SubscriptionExecutor {
    /// Creates the executor.
    pub fn new(context: ExecutorContext) -> Self {
        Self { context }
    }

    async fn create(
        &self,
        operation: &Operation,
        fields: &SubscriptionFields,
        companions: &[Operation],
    ) -> ExecutionResponse {
        if companions
            .iter()
            .any(|op| matches!(op.kind, OperationKind::DeleteSubscription { .. }))
        {
            tracing::debug!(op = %operation, "subscription deleted before it was created");
            return ExecutionResponse::success();
        }

        // Later updates fold into the create; the id stays the create's.
        let latest = last_update(companions).unwrap_or(fields);
        let object = subscription_object(latest, false);

        let created = match self
            .context
            .backends
            .subscriptions
            .create_subscription(&operation.app_id, &operation.onesignal_id, &object)
            .await
        {
            Ok(created) => created,
            Err(error) => {
                tracing::warn!(op = %operation, %error, "create subscription failed");
                return self.context.failure_response(operation, &error);
            }
        };

        if let Some(token) = created.ryw_token {
            self.context.consistency.set_token(
                &operation.onesignal_id,
                TokenKind::SubscriptionUpdate,
                token,
            );
        }
        self.context.new_records.add(&created.id);

        let local = &fields.subscription_id;
        let mut translations = BTreeMap::new();
        if *local != created.id {
            let stores = &self.context.stores;
            stores
                .subscriptions
                .update(local, ModelChangeTag::Hydrate, |model| model.set_id(&created.id));
            stores.config.update(ModelChangeTag::Hydrate, |config| {
                if config.push_subscription_id() == Some(local.as_str()) {
                    config.set_push_subscription_id(Some(&created.id));
                }
            });
            translations.insert(local.clone(), created.id.clone());
        }
        tracing::debug!(local = %local, subscription_id = %created.id, "subscription created");
        ExecutionResponse::translated(translations)
    }

    async fn update(&self, operation: &Operation, operations: &[Operation]) -> ExecutionResponse {
        let Some(fields) = last_update(operations) else {
            return unexpected(operation, "SubscriptionExecutor");
        };
        let result = self
            .context
            .backends
            .subscriptions
            .update_subscription(
                &operation.app_id,
                &fields.subscription_id,
                &subscription_object(fields, true),
            )
            .await;
        match result {
            Ok(response) => {
                if let Some(token) = response.ryw_token {
                    self.context.consistency.set_token(
                        &operation.onesignal_id,
                        TokenKind::SubscriptionUpdate,
                        token,
                    );
                }
                ExecutionResponse::success()
            }
            Err(error) => {
                tracing::warn!(op = %operation, %error, "update subscription failed");
                self.context.failure_response(operation, &error)
            }
        }
    }

    async fn delete(&self, operation: &Operation, subscription_id: &str) -> ExecutionResponse {
        match self
            .context
            .backends
            .subscriptions
            .delete_subscription(&operation.app_id, subscription_id)
            .await
        {
            Ok(()) => ExecutionResponse::success(),
            // Already gone is what we wanted.
            Err(error) if error.classify() == ErrorClass::Missing => {
                tracing::debug!(subscription_id, "subscription already deleted");
                ExecutionResponse::success()
            }
            Err(error) => {
                tracing::warn!(op = %operation, %error, "delete subscription failed");
                self.context.failure_response(operation, &error)
            }
        }
    }

    async fn transfer(&self, operation: &Operation, subscription_id: &str) -> ExecutionResponse {
        match self
            .context
            .backends
            .subscriptions
            .transfer_subscription(&operation.app_id, subscription_id, &operation.onesignal_id)
            .await
        {
            Ok(()) => ExecutionResponse::success(),
            Err(error) => {
                tracing::warn!(op = %operation, %error, "transfer subscription failed");
                self.context.failure_response(operation, &error)
            }
        }
    }
}

fn last_update(operations: &[Operation]) -> Option<&SubscriptionFields> {
    operations.iter().rev().find_map(|op| match &op.kind {
        OperationKind::UpdateSubscription(fields) => Some(fields),
        _ => None,
    })
}

#[async_trait]
impl OperationExecutor for SubscriptionExecutor {
    fn operations(&self) -> &'static [OperationName] {
        &[
            OperationName::CreateSubscription,
            OperationName::UpdateSubscription,
            OperationName::DeleteSubscription,
            OperationName::TransferSubscription,
        ]
    }

    async fn execute(&self, operations: Vec<Operation>) -> ExecutionResponse {
        let Some((first, companions)) = operations.split_first() else {
            return ExecutionResponse::success();
        };
        match &first.kind {
            OperationKind::CreateSubscription(fields) => self.create(first, fields, companions).await,
            OperationKind::UpdateSubscription(fields) => {
                // A later delete supersedes the updates.
                if companions
                    .iter()
                    .any(|op| matches!(op.kind, OperationKind::DeleteSubscription { .. }))
                {
                    return self.delete(first, &fields.subscription_id).await;
                }
                self.update(first, &operations).await
            }
            OperationKind::DeleteSubscription { subscription_id } => {
                self.delete(first, subscription_id).await
            }
            OperationKind::TransferSubscription { subscription_id } => {
                self.transfer(first, subscription_id).await
            }
            _ => unexpected(first, "SubscriptionExecutor"),
        }
    }
}

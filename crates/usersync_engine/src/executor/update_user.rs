use super::{unexpected, ExecutionResponse, ExecutorContext, OperationExecutor};
use crate::backend::UpdateUserRequest;
use crate::operation::{Operation, OperationKind, OperationName};
use async_trait::async_trait;
use usersync_core::TokenKind;

/// Applies tag and property edits in one call per batch.
pub struct UpdateUserExecutor {
    context: ExecutorContext,
}

impl UpdateUserExecutor {
    /// Creates the executor.
    pub fn new(context: ExecutorContext) -> Self {
        Self { context }
    }
}

#[async_trait]
impl OperationExecutor for UpdateUserExecutor {
    fn operations(&self) -> &'static [OperationName] {
        &[
            OperationName::SetTag,
            OperationName::DeleteTag,
            OperationName::SetProperty,
        ]
    }

    async fn execute(&self, operations: Vec<Operation>) -> ExecutionResponse {
        let Some(first) = operations.first() else {
            return ExecutionResponse::success();
        };

        let mut request = UpdateUserRequest::default();
        for operation in &operations {
            match &operation.kind {
                OperationKind::SetTag { key, value } => {
                    request.tags.insert(key.clone(), Some(value.clone()));
                }
                OperationKind::DeleteTag { key } => {
                    request.tags.insert(key.clone(), None);
                }
                OperationKind::SetProperty { property, value } => {
                    request.properties.insert(property.clone(), value.clone());
                }
                _ => return unexpected(operation, "UpdateUserExecutor"),
            }
        }

        match self
            .context
            .backends
            .users
            .update_user(&first.app_id, &first.onesignal_id, &request)
            .await
        {
            Ok(response) => {
                if let Some(token) = response.ryw_token {
                    self.context
                        .consistency
                        .set_token(&first.onesignal_id, TokenKind::UserUpdate, token);
                }
                tracing::debug!(
                    onesignal_id = %first.onesignal_id,
                    tags = request.tags.len(),
                    properties = request.properties.len(),
                    "user updated"
                );
                ExecutionResponse::success()
            }
            Err(error) => {
                tracing::warn!(op = %first, %error, "update user failed");
                self.context.failure_response(first, &error)
            }
        }
    }
}

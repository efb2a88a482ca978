use super::{unexpected, ExecutionResponse, ExecutorContext, OperationExecutor};
use crate::operation::{Operation, OperationKind, OperationName};
use async_trait::async_trait;
use std::collections::BTreeMap;
use usersync_core::IdentityModel;

/// Sets and deletes aliases.
pub struct IdentityExecutor {
    context: ExecutorContext,
}

impl IdentityExecutor {
    /// Creates the executor.
    pub fn new(context: ExecutorContext) -> Self {
        Self { context }
    }
}

#[async_trait]
impl OperationExecutor for IdentityExecutor {
    fn operations(&self) -> &'static [OperationName] {
        &[OperationName::SetAlias, OperationName::DeleteAlias]
    }

    async fn execute(&self, operations: Vec<Operation>) -> ExecutionResponse {
        let Some(first) = operations.first() else {
            return ExecutionResponse::success();
        };

        // Last write per label wins.
        let mut edits: BTreeMap<&str, Option<&str>> = BTreeMap::new();
        for operation in &operations {
            match &operation.kind {
                OperationKind::SetAlias { label, value } => {
                    edits.insert(label, Some(value.as_str()));
                }
                OperationKind::DeleteAlias { label } => {
                    edits.insert(label, None);
                }
                _ => return unexpected(operation, "IdentityExecutor"),
            }
        }

        let sets: BTreeMap<String, String> = edits
            .iter()
            .filter_map(|(label, value)| value.map(|v| (label.to_string(), v.to_string())))
            .collect();
        let identity = &self.context.backends.identity;

        if !sets.is_empty() {
            if let Err(error) = identity
                .set_aliases(&first.app_id, IdentityModel::ONESIGNAL_ID, &first.onesignal_id, &sets)
                .await
            {
                tracing::warn!(op = %first, %error, "set aliases failed");
                return self.context.failure_response(first, &error);
            }
        }

        for label in edits.iter().filter(|(_, v)| v.is_none()).map(|(l, _)| *l) {
            if let Err(error) = identity
                .delete_alias(&first.app_id, &first.onesignal_id, label)
                .await
            {
                tracing::warn!(op = %first, label, %error, "delete alias failed");
                return self.context.failure_response(first, &error);
            }
        }

        ExecutionResponse::success()
    }
}

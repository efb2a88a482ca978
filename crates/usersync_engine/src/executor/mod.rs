//! Operation executors.
//!
//! Each executor owns a family of [`OperationName`]s and turns a batch of
//! them into backend calls. A batch always starts with the operation the
//! queue selected; the rest are companions sharing its comparison key, in
//! queue order.

mod identity;
mod login;
mod refresh;
mod subscription;
mod update_user;

pub use identity::IdentityExecutor;
pub use login::LoginUserExecutor;
pub use refresh::RefreshUserExecutor;
pub use subscription::SubscriptionExecutor;
pub use update_user::UpdateUserExecutor;

use crate::backend::{BackendError, Backends, ErrorClass};
use crate::new_records::NewRecordsState;
use crate::operation::{Operation, OperationName};
use crate::rebuild::RebuildService;
use crate::stores::UserStores;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use usersync_core::ConsistencyManager;

/// Why an operation was dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationFailure {
    /// Human readable reason.
    pub reason: String,
    /// Backend status, if a call was answered.
    pub status: Option<u16>,
    /// Backend payload, if any.
    pub payload: Option<String>,
}

impl OperationFailure {
    /// A failure not caused by a backend answer.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            status: None,
            payload: None,
        }
    }

    /// A failure caused by a backend answer.
    pub fn from_backend(error: &BackendError) -> Self {
        Self {
            reason: error.to_string(),
            status: error.status,
            payload: error.payload.clone(),
        }
    }
}

/// Outcome of one executor call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionResult {
    /// Every operation in the batch was applied.
    Success,
    /// Applied, and the listed local ids were promoted to backend ids.
    SuccessWithIdTranslation(BTreeMap<String, String>),
    /// Not applied; retry after at least the given delay.
    RetryAfter(Option<Duration>),
    /// Not applied and never will be.
    TerminalFailure(OperationFailure),
}

/// An [`ExecutionResult`] plus operations to run next.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResponse {
    /// Outcome of the batch.
    pub result: ExecutionResult,
    /// Operations placed at the front of the queue, in order.
    pub follow_ups: Vec<Operation>,
    /// On success, how many operations at the end of the batch were not
    /// sent. They go back to the front of the queue unresolved.
    pub unsent: usize,
}

impl ExecutionResponse {
    /// A response without follow-ups.
    pub fn new(result: ExecutionResult) -> Self {
        Self {
            result,
            follow_ups: Vec::new(),
            unsent: 0,
        }
    }

    /// Plain success.
    pub fn success() -> Self {
        Self::new(ExecutionResult::Success)
    }

    /// Success with id promotions.
    pub fn translated(translations: BTreeMap<String, String>) -> Self {
        if translations.is_empty() {
            Self::success()
        } else {
            Self::new(ExecutionResult::SuccessWithIdTranslation(translations))
        }
    }

    /// Retry after at least `delay`.
    pub fn retry(delay: Option<Duration>) -> Self {
        Self::new(ExecutionResult::RetryAfter(delay))
    }

    /// Terminal failure.
    pub fn terminal(failure: OperationFailure) -> Self {
        Self::new(ExecutionResult::TerminalFailure(failure))
    }

    /// Marks the last `count` operations of the batch as not sent.
    pub fn with_unsent(mut self, count: usize) -> Self {
        self.unsent = count;
        self
    }

    /// Adds follow-up operations.
    pub fn with_follow_ups(mut self, follow_ups: Vec<Operation>) -> Self {
        self.follow_ups = follow_ups;
        self
    }
}

/// Executes batches of operations against the backend.
#[async_trait]
pub trait OperationExecutor: Send + Sync {
    /// Operation names this executor accepts.
    fn operations(&self) -> &'static [OperationName];

    /// Executes a batch. Read-your-write tokens returned by the backend are
    /// recorded before this returns.
    async fn execute(&self, operations: Vec<Operation>) -> ExecutionResponse;
}

/// Collaborators shared by every executor.
#[derive(Clone)]
pub struct ExecutorContext {
    /// Backend services.
    pub backends: Backends,
    /// User model stores, hydrated from backend responses.
    pub stores: Arc<UserStores>,
    /// Token sink.
    pub consistency: Arc<ConsistencyManager>,
    /// Recently created records.
    pub new_records: Arc<NewRecordsState>,
    /// Rebuild operations for lost users.
    pub rebuild: Arc<RebuildService>,
}

impl ExecutorContext {
    /// Builds every executor.
    pub fn executors(&self) -> Vec<Arc<dyn OperationExecutor>> {
        vec![
            Arc::new(LoginUserExecutor::new(self.clone())),
            Arc::new(IdentityExecutor::new(self.clone())),
            Arc::new(UpdateUserExecutor::new(self.clone())),
            Arc::new(SubscriptionExecutor::new(self.clone())),
            Arc::new(RefreshUserExecutor::new(self.clone())),
        ]
    }

    /// Maps a failed call on an existing user to a response.
    ///
    /// A 404 right after creation is replication lag and retried. A 404 for
    /// the current user otherwise means the backend lost it: the batch fails
    /// and the rebuild operations follow.
    pub(crate) fn failure_response(
        &self,
        operation: &Operation,
        error: &BackendError,
    ) -> ExecutionResponse {
        match error.classify() {
            ErrorClass::Retryable => ExecutionResponse::retry(error.retry_after),
            ErrorClass::Missing => {
                if self.new_records.is_in_missing_retry_window(&operation.onesignal_id) {
                    return ExecutionResponse::retry(error.retry_after);
                }
                let follow_ups = self
                    .rebuild
                    .get_rebuild_operations(&operation.app_id, &operation.onesignal_id)
                    .unwrap_or_default();
                ExecutionResponse::terminal(OperationFailure::from_backend(error))
                    .with_follow_ups(follow_ups)
            }
            ErrorClass::Unauthorized | ErrorClass::Conflict | ErrorClass::Invalid => {
                ExecutionResponse::terminal(OperationFailure::from_backend(error))
            }
        }
    }
}

pub(crate) fn unexpected(operation: &Operation, executor: &str) -> ExecutionResponse {
    tracing::error!(op = %operation, executor, "operation routed to the wrong executor");
    ExecutionResponse::terminal(OperationFailure::new(format!(
        "{} cannot be executed by {executor}",
        operation.name()
    )))
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::backend::MockBackend;
    use usersync_core::{IdentityModel, ModelChangeTag, PropertiesModel};

    pub(crate) fn context(backend: Arc<MockBackend>) -> ExecutorContext {
        let stores = Arc::new(UserStores::in_memory());
        ExecutorContext {
            backends: Backends::from_shared(backend),
            rebuild: Arc::new(RebuildService::new(stores.clone())),
            stores,
            consistency: Arc::new(ConsistencyManager::new()),
            new_records: Arc::new(NewRecordsState::new(Duration::ZERO, Duration::from_secs(60))),
        }
    }

    pub(crate) fn make_current(context: &ExecutorContext, onesignal_id: &str, external_id: Option<&str>) {
        let mut identity = IdentityModel::with_onesignal_id(onesignal_id);
        identity.set_external_id(external_id);
        context
            .stores
            .identity
            .replace(identity, ModelChangeTag::NoPropagate);
        context.stores.properties.replace(
            PropertiesModel::with_onesignal_id(onesignal_id),
            ModelChangeTag::NoPropagate,
        );
    }
}

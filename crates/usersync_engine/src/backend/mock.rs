//! In-process backend for tests.

use super::{
    BackendError, BackendResult, CreateUserRequest, CreatedSubscription, IdentityBackend,
    PropertiesObject, SubscriptionBackend, SubscriptionObject, UpdateUserRequest, UserBackend,
    UserResponse, WriteResponse,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;
use usersync_core::RywToken;

/// A recorded backend call.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendCall {
    /// `create_user`.
    CreateUser {
        /// Aliases sent.
        identity: BTreeMap<String, String>,
        /// Number of subscriptions sent.
        subscriptions: usize,
    },
    /// `update_user`.
    UpdateUser {
        /// Target user.
        onesignal_id: String,
        /// Edits sent.
        request: UpdateUserRequest,
    },
    /// `get_user`.
    GetUser {
        /// Target user.
        onesignal_id: String,
    },
    /// `set_aliases`.
    SetAliases {
        /// Lookup label.
        label: String,
        /// Lookup value.
        value: String,
        /// Aliases sent.
        aliases: BTreeMap<String, String>,
    },
    /// `delete_alias`.
    DeleteAlias {
        /// Target user.
        onesignal_id: String,
        /// Removed label.
        label: String,
    },
    /// `create_subscription`.
    CreateSubscription {
        /// Owner.
        onesignal_id: String,
        /// Token, address or number.
        token: String,
    },
    /// `update_subscription`.
    UpdateSubscription {
        /// Target subscription.
        subscription_id: String,
    },
    /// `delete_subscription`.
    DeleteSubscription {
        /// Target subscription.
        subscription_id: String,
    },
    /// `transfer_subscription`.
    TransferSubscription {
        /// Target subscription.
        subscription_id: String,
        /// New owner.
        onesignal_id: String,
    },
}

impl BackendCall {
    /// Returns the trait method name.
    pub fn name(&self) -> &'static str {
        match self {
            BackendCall::CreateUser { .. } => "create_user",
            BackendCall::UpdateUser { .. } => "update_user",
            BackendCall::GetUser { .. } => "get_user",
            BackendCall::SetAliases { .. } => "set_aliases",
            BackendCall::DeleteAlias { .. } => "delete_alias",
            BackendCall::CreateSubscription { .. } => "create_subscription",
            BackendCall::UpdateSubscription { .. } => "update_subscription",
            BackendCall::DeleteSubscription { .. } => "delete_subscription",
            BackendCall::TransferSubscription { .. } => "transfer_subscription",
        }
    }

    /// Returns every record id the call addressed.
    pub fn addressed_ids(&self) -> Vec<&str> {
        match self {
            BackendCall::CreateUser { .. } => Vec::new(),
            BackendCall::UpdateUser { onesignal_id, .. }
            | BackendCall::GetUser { onesignal_id }
            | BackendCall::DeleteAlias { onesignal_id, .. }
            | BackendCall::CreateSubscription { onesignal_id, .. } => vec![onesignal_id],
            BackendCall::SetAliases { value, .. } => vec![value],
            BackendCall::UpdateSubscription { subscription_id }
            | BackendCall::DeleteSubscription { subscription_id } => vec![subscription_id],
            BackendCall::TransferSubscription {
                subscription_id,
                onesignal_id,
            } => vec![subscription_id, onesignal_id],
        }
    }
}

#[derive(Debug, Clone, Default)]
struct MockUser {
    identity: BTreeMap<String, String>,
    properties: PropertiesObject,
}

#[derive(Debug, Clone)]
struct MockSubscription {
    owner: String,
    object: SubscriptionObject,
}

#[derive(Default)]
struct MockState {
    users: BTreeMap<String, MockUser>,
    subscriptions: BTreeMap<String, MockSubscription>,
    next_id: u64,
    next_token: u64,
    calls: Vec<BackendCall>,
    failures: VecDeque<(&'static str, BackendError)>,
    latency: Duration,
    /// Calls currently sleeping out the latency, per addressed id.
    active: BTreeMap<String, usize>,
    peaks: BTreeMap<String, usize>,
    active_total: usize,
    peak_total: usize,
}

impl MockState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    fn next_token(&mut self) -> RywToken {
        self.next_token += 1;
        RywToken::new(self.next_token.to_string())
    }

    fn find_user(&self, label: &str, value: &str) -> Option<String> {
        self.users
            .iter()
            .find(|(_, user)| user.identity.get(label).map(String::as_str) == Some(value))
            .map(|(id, _)| id.clone())
    }

    fn response(&self, onesignal_id: &str, ryw_token: Option<RywToken>) -> Option<UserResponse> {
        let user = self.users.get(onesignal_id)?;
        let subscriptions = self
            .subscriptions
            .iter()
            .filter(|(_, s)| s.owner == onesignal_id)
            .map(|(_, s)| s.object.clone())
            .collect();
        Some(UserResponse {
            identity: user.identity.clone(),
            properties: user.properties.clone(),
            subscriptions,
            ryw_token,
        })
    }
}

/// A scriptable in-memory backend.
///
/// Behaves like a small server: users and subscriptions get sequential ids
/// (`user-1`, `sub-2`), every write returns an increasing token, and
/// addressing an unknown record fails with 404. Failures can be queued per
/// call name with [`MockBackend::fail_next`]. Every call is recorded, failed
/// ones included.
#[derive(Default)]
pub struct MockBackend {
    state: Mutex<MockState>,
}

impl MockBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next call named `call` fail with `error`.
    pub fn fail_next(&self, call: &'static str, error: BackendError) {
        self.state.lock().failures.push_back((call, error));
    }

    /// Delays every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    /// Returns every recorded call in order.
    pub fn calls(&self) -> Vec<BackendCall> {
        self.state.lock().calls.clone()
    }

    /// Returns the number of recorded calls named `call`.
    pub fn call_count(&self, call: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.name() == call)
            .count()
    }

    /// Returns the most calls that were ever in progress at once.
    ///
    /// Only counted while a latency is set.
    pub fn peak_concurrency(&self) -> usize {
        self.state.lock().peak_total
    }

    /// Returns the most calls addressing `id` that were ever in progress
    /// at once. Only counted while a latency is set.
    pub fn peak_concurrency_for(&self, id: &str) -> usize {
        self.state.lock().peaks.get(id).copied().unwrap_or(0)
    }

    /// Returns a stored user.
    pub fn user(&self, onesignal_id: &str) -> Option<UserResponse> {
        self.state.lock().response(onesignal_id, None)
    }

    /// Returns the number of stored users.
    pub fn user_count(&self) -> usize {
        self.state.lock().users.len()
    }

    /// Stores a user with the given aliases. Returns its id.
    pub fn insert_user(&self, identity: BTreeMap<String, String>) -> String {
        let mut state = self.state.lock();
        let id = state.next_id("user");
        let mut identity = identity;
        identity.insert("onesignal_id".into(), id.clone());
        state.users.insert(
            id.clone(),
            MockUser {
                identity,
                properties: PropertiesObject::default(),
            },
        );
        id
    }

    /// Deletes a stored user and its subscriptions.
    pub fn remove_user(&self, onesignal_id: &str) -> bool {
        let mut state = self.state.lock();
        state.subscriptions.retain(|_, s| s.owner != onesignal_id);
        state.users.remove(onesignal_id).is_some()
    }

    async fn begin(&self, call: BackendCall) -> BackendResult<()> {
        let ids: Vec<String> = call.addressed_ids().into_iter().map(str::to_string).collect();
        let latency = {
            let mut state = self.state.lock();
            let name = call.name();
            state.calls.push(call);
            if let Some(index) = state.failures.iter().position(|(n, _)| *n == name) {
                if let Some((_, error)) = state.failures.remove(index) {
                    return Err(error);
                }
            }
            if !state.latency.is_zero() {
                state.active_total += 1;
                state.peak_total = state.peak_total.max(state.active_total);
                for id in &ids {
                    let active = state.active.entry(id.clone()).or_default();
                    *active += 1;
                    let now = *active;
                    let peak = state.peaks.entry(id.clone()).or_default();
                    *peak = (*peak).max(now);
                }
            }
            state.latency
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
            let mut state = self.state.lock();
            state.active_total -= 1;
            for id in &ids {
                if let Some(active) = state.active.get_mut(id) {
                    *active -= 1;
                }
            }
        }
        Ok(())
    }
}

fn not_found(what: &str, id: &str) -> BackendError {
    BackendError::status(404, Some(format!("{what} {id} not found")))
}

#[async_trait]
impl UserBackend for MockBackend {
    async fn create_user(&self, _app_id: &str, request: &CreateUserRequest) -> BackendResult<UserResponse> {
        self.begin(BackendCall::CreateUser {
            identity: request.identity.clone(),
            subscriptions: request.subscriptions.len(),
        })
        .await?;

        let mut state = self.state.lock();
        let existing = request
            .identity
            .iter()
            .find_map(|(label, value)| state.find_user(label, value));
        let id = match existing {
            Some(id) => id,
            None => {
                let id = state.next_id("user");
                let mut identity = request.identity.clone();
                identity.insert("onesignal_id".into(), id.clone());
                state.users.insert(
                    id.clone(),
                    MockUser {
                        identity,
                        properties: request.properties.clone(),
                    },
                );
                id
            }
        };

        for subscription in &request.subscriptions {
            let sub_id = match &subscription.id {
                Some(sub_id) if state.subscriptions.contains_key(sub_id) => sub_id.clone(),
                _ => state.next_id("sub"),
            };
            let mut object = subscription.clone();
            object.id = Some(sub_id.clone());
            state.subscriptions.insert(
                sub_id,
                MockSubscription {
                    owner: id.clone(),
                    object,
                },
            );
        }

        let token = state.next_token();
        state
            .response(&id, Some(token))
            .ok_or_else(|| not_found("user", &id))
    }

    async fn update_user(
        &self,
        _app_id: &str,
        onesignal_id: &str,
        request: &UpdateUserRequest,
    ) -> BackendResult<WriteResponse> {
        self.begin(BackendCall::UpdateUser {
            onesignal_id: onesignal_id.to_string(),
            request: request.clone(),
        })
        .await?;

        let mut state = self.state.lock();
        let user = state
            .users
            .get_mut(onesignal_id)
            .ok_or_else(|| not_found("user", onesignal_id))?;
        for (key, value) in &request.tags {
            match value {
                Some(value) => user.properties.tags.insert(key.clone(), value.clone()),
                None => user.properties.tags.remove(key),
            };
        }
        for (name, value) in &request.properties {
            let value = value.as_str().map(str::to_string);
            match name.as_str() {
                "language" => user.properties.language = value,
                "timezone_id" => user.properties.timezone_id = value,
                "country" => user.properties.country = value,
                _ => {}
            }
        }
        Ok(WriteResponse {
            ryw_token: Some(state.next_token()),
        })
    }

    async fn get_user(&self, _app_id: &str, onesignal_id: &str) -> BackendResult<UserResponse> {
        self.begin(BackendCall::GetUser {
            onesignal_id: onesignal_id.to_string(),
        })
        .await?;
        self.state
            .lock()
            .response(onesignal_id, None)
            .ok_or_else(|| not_found("user", onesignal_id))
    }
}

#[async_trait]
impl IdentityBackend for MockBackend {
    async fn set_aliases(
        &self,
        _app_id: &str,
        label: &str,
        value: &str,
        aliases: &BTreeMap<String, String>,
    ) -> BackendResult<BTreeMap<String, String>> {
        self.begin(BackendCall::SetAliases {
            label: label.to_string(),
            value: value.to_string(),
            aliases: aliases.clone(),
        })
        .await?;

        let mut state = self.state.lock();
        let id = state
            .find_user(label, value)
            .ok_or_else(|| not_found("user", value))?;
        for (alias_label, alias_value) in aliases {
            if let Some(owner) = state.find_user(alias_label, alias_value) {
                if owner != id {
                    return Err(BackendError::status(
                        409,
                        Some(format!("alias {alias_label} belongs to another user")),
                    ));
                }
            }
        }
        let user = state
            .users
            .get_mut(&id)
            .ok_or_else(|| not_found("user", &id))?;
        user.identity
            .extend(aliases.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(user.identity.clone())
    }

    async fn delete_alias(&self, _app_id: &str, onesignal_id: &str, label: &str) -> BackendResult<()> {
        self.begin(BackendCall::DeleteAlias {
            onesignal_id: onesignal_id.to_string(),
            label: label.to_string(),
        })
        .await?;

        let mut state = self.state.lock();
        let user = state
            .users
            .get_mut(onesignal_id)
            .ok_or_else(|| not_found("user", onesignal_id))?;
        user.identity.remove(label);
        Ok(())
    }
}

#[async_trait]
impl SubscriptionBackend for MockBackend {
    async fn create_subscription(
        &self,
        _app_id: &str,
        onesignal_id: &str,
        subscription: &SubscriptionObject,
    ) -> BackendResult<CreatedSubscription> {
        self.begin(BackendCall::CreateSubscription {
            onesignal_id: onesignal_id.to_string(),
            token: subscription.token.clone(),
        })
        .await?;

        let mut state = self.state.lock();
        if !state.users.contains_key(onesignal_id) {
            return Err(not_found("user", onesignal_id));
        }
        let id = state.next_id("sub");
        let mut object = subscription.clone();
        object.id = Some(id.clone());
        state.subscriptions.insert(
            id.clone(),
            MockSubscription {
                owner: onesignal_id.to_string(),
                object,
            },
        );
        Ok(CreatedSubscription {
            id,
            ryw_token: Some(state.next_token()),
        })
    }

    async fn update_subscription(
        &self,
        _app_id: &str,
        subscription_id: &str,
        subscription: &SubscriptionObject,
    ) -> BackendResult<WriteResponse> {
        self.begin(BackendCall::UpdateSubscription {
            subscription_id: subscription_id.to_string(),
        })
        .await?;

        let mut state = self.state.lock();
        let stored = state
            .subscriptions
            .get_mut(subscription_id)
            .ok_or_else(|| not_found("subscription", subscription_id))?;
        stored.object = SubscriptionObject {
            id: Some(subscription_id.to_string()),
            ..subscription.clone()
        };
        Ok(WriteResponse {
            ryw_token: Some(state.next_token()),
        })
    }

    async fn delete_subscription(&self, _app_id: &str, subscription_id: &str) -> BackendResult<()> {
        self.begin(BackendCall::DeleteSubscription {
            subscription_id: subscription_id.to_string(),
        })
        .await?;

        self.state
            .lock()
            .subscriptions
            .remove(subscription_id)
            .map(|_| ())
            .ok_or_else(|| not_found("subscription", subscription_id))
    }

    async fn transfer_subscription(
        &self,
        _app_id: &str,
        subscription_id: &str,
        onesignal_id: &str,
    ) -> BackendResult<()> {
        self.begin(BackendCall::TransferSubscription {
            subscription_id: subscription_id.to_string(),
            onesignal_id: onesignal_id.to_string(),
        })
        .await?;

        let mut state = self.state.lock();
        if !state.users.contains_key(onesignal_id) {
            return Err(not_found("user", onesignal_id));
        }
        let stored = state
            .subscriptions
            .get_mut(subscription_id)
            .ok_or_else(|| not_found("subscription", subscription_id))?;
        stored.owner = onesignal_id.to_string();
        Ok(())
    }
}

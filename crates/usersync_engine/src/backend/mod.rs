//! Backend boundary.
//!
//! Executors talk to the backend through three traits, one per resource
//! family. [`HttpBackend`] implements all three over JSON; [`MockBackend`]
//! is an in-process stand-in for tests.
//!
//! Every failure is a [`BackendError`]. Its status is mapped to an
//! [`ErrorClass`] by [`BackendError::classify`], the single place the
//! retry policy lives.

mod http;
mod mock;

pub use http::{HttpBackend, HttpClient, HttpMethod, HttpRequest, HttpResponse};
pub use mock::{BackendCall, MockBackend};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use usersync_core::{PropertyValue, RywToken, SubscriptionType};

/// Result type for backend calls.
pub type BackendResult<T> = Result<T, BackendError>;

/// How the queue reacts to a failed backend call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network failure, timeout, rate limiting or server error. Retried.
    Retryable,
    /// The credentials were rejected.
    Unauthorized,
    /// The addressed record does not exist.
    Missing,
    /// The request conflicts with existing state.
    Conflict,
    /// The request was rejected as invalid.
    Invalid,
}

impl ErrorClass {
    /// Returns true if the call should be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorClass::Retryable)
    }
}

/// A failed backend call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendError {
    /// HTTP status, or `None` if no response was received.
    pub status: Option<u16>,
    /// Response body, if any.
    pub payload: Option<String>,
    /// Server-requested delay before retrying.
    pub retry_after: Option<Duration>,
}

impl BackendError {
    /// A call that received no response.
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            status: None,
            payload: Some(message.into()),
            retry_after: None,
        }
    }

    /// A call answered with a non-success status.
    pub fn status(status: u16, payload: Option<String>) -> Self {
        Self {
            status: Some(status),
            payload,
            retry_after: None,
        }
    }

    /// Sets the server-requested retry delay.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    /// Maps the status to an [`ErrorClass`].
    pub fn classify(&self) -> ErrorClass {
        match self.status {
            // 408 is a timeout the server noticed first.
            None | Some(408) | Some(429) => ErrorClass::Retryable,
            Some(500..=599) => ErrorClass::Retryable,
            Some(401) | Some(403) => ErrorClass::Unauthorized,
            Some(404) | Some(410) => ErrorClass::Missing,
            Some(409) => ErrorClass::Conflict,
            Some(_) => ErrorClass::Invalid,
        }
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.status, self.payload.as_deref()) {
            (Some(status), Some(payload)) => write!(f, "backend returned {status}: {payload}"),
            (Some(status), None) => write!(f, "backend returned {status}"),
            (None, Some(message)) => write!(f, "network error: {message}"),
            (None, None) => f.write_str("network error"),
        }
    }
}

impl std::error::Error for BackendError {}

/// A subscription as sent to and returned by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionObject {
    /// Backend id; absent on create requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Channel.
    #[serde(rename = "type")]
    pub subscription_type: SubscriptionType,
    /// Token, address or number.
    pub token: String,
    /// Whether delivery is enabled.
    pub enabled: bool,
    /// Delivery status code.
    pub notification_types: i64,
}

/// Descriptive properties of a user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PropertiesObject {
    /// Tags.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    /// Language code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// IANA timezone id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone_id: Option<String>,
    /// Country code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
}

/// Body of a user create call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateUserRequest {
    /// Aliases to attach, `external_id` included.
    pub identity: BTreeMap<String, String>,
    /// Initial properties.
    #[serde(default)]
    pub properties: PropertiesObject,
    /// Subscriptions to create or move to the user.
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionObject>,
}

/// Body of a user update call.
///
/// A tag mapped to `None` is deleted. A property mapped to null is cleared.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateUserRequest {
    /// Tag edits.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, Option<String>>,
    /// Property edits.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, PropertyValue>,
}

impl UpdateUserRequest {
    /// Returns true if the request carries no edits.
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty() && self.properties.is_empty()
    }
}

/// A user as returned by the backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserResponse {
    /// Aliases, `onesignal_id` included.
    pub identity: BTreeMap<String, String>,
    /// Properties.
    #[serde(default)]
    pub properties: PropertiesObject,
    /// Subscriptions.
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionObject>,
    /// Read-your-write token of the write, if the call wrote.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ryw_token: Option<RywToken>,
}

impl UserResponse {
    /// Returns the backend user id.
    pub fn onesignal_id(&self) -> Option<&str> {
        self.identity.get("onesignal_id").map(String::as_str)
    }
}

/// Acknowledgement of a write.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteResponse {
    /// Read-your-write token, if the backend issued one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ryw_token: Option<RywToken>,
}

/// A subscription create acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedSubscription {
    /// Backend id of the subscription.
    pub id: String,
    /// Read-your-write token, if the backend issued one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ryw_token: Option<RywToken>,
}

/// User resource calls.
#[async_trait]
pub trait UserBackend: Send + Sync {
    /// Creates a user, or returns the user already owning an alias in
    /// `request.identity`.
    async fn create_user(&self, app_id: &str, request: &CreateUserRequest) -> BackendResult<UserResponse>;

    /// Applies tag and property edits.
    async fn update_user(
        &self,
        app_id: &str,
        onesignal_id: &str,
        request: &UpdateUserRequest,
    ) -> BackendResult<WriteResponse>;

    /// Reads a user.
    async fn get_user(&self, app_id: &str, onesignal_id: &str) -> BackendResult<UserResponse>;
}

/// Alias calls.
#[async_trait]
pub trait IdentityBackend: Send + Sync {
    /// Adds aliases to the user owning `label = value`. Returns the user's
    /// full alias set.
    async fn set_aliases(
        &self,
        app_id: &str,
        label: &str,
        value: &str,
        aliases: &BTreeMap<String, String>,
    ) -> BackendResult<BTreeMap<String, String>>;

    /// Removes one alias.
    async fn delete_alias(&self, app_id: &str, onesignal_id: &str, label: &str) -> BackendResult<()>;
}

/// Subscription calls.
#[async_trait]
pub trait SubscriptionBackend: Send + Sync {
    /// Creates a subscription owned by the user.
    async fn create_subscription(
        &self,
        app_id: &str,
        onesignal_id: &str,
        subscription: &SubscriptionObject,
    ) -> BackendResult<CreatedSubscription>;

    /// Updates a subscription.
    async fn update_subscription(
        &self,
        app_id: &str,
        subscription_id: &str,
        subscription: &SubscriptionObject,
    ) -> BackendResult<WriteResponse>;

    /// Deletes a subscription.
    async fn delete_subscription(&self, app_id: &str, subscription_id: &str) -> BackendResult<()>;

    /// Moves a subscription to the user.
    async fn transfer_subscription(
        &self,
        app_id: &str,
        subscription_id: &str,
        onesignal_id: &str,
    ) -> BackendResult<()>;
}

/// The backend services executors call.
#[derive(Clone)]
pub struct Backends {
    /// User calls.
    pub users: Arc<dyn UserBackend>,
    /// Alias calls.
    pub identity: Arc<dyn IdentityBackend>,
    /// Subscription calls.
    pub subscriptions: Arc<dyn SubscriptionBackend>,
}

impl Backends {
    /// Uses one implementation for every family.
    pub fn from_shared<B>(backend: Arc<B>) -> Self
    where
        B: UserBackend + IdentityBackend + SubscriptionBackend + 'static,
    {
        Self {
            users: backend.clone(),
            identity: backend.clone(),
            subscriptions: backend,
        }
    }
}

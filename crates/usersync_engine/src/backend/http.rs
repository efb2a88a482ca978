//! HTTP backend implementation.
//!
//! The actual HTTP client is abstracted via a trait to allow different
//! implementations (reqwest, hyper, a loopback server in tests).

use super::{
    BackendError, BackendResult, CreateUserRequest, CreatedSubscription, IdentityBackend,
    SubscriptionBackend, SubscriptionObject, UpdateUserRequest, UserBackend, UserResponse,
    WriteResponse,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use usersync_core::RywToken;

/// HTTP verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    /// GET
    Get,
    /// POST
    Post,
    /// PATCH
    Patch,
    /// DELETE
    Delete,
}

/// An outgoing request.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    /// Verb.
    pub method: HttpMethod,
    /// Absolute URL.
    pub url: String,
    /// JSON body.
    pub body: Option<Vec<u8>>,
}

/// A received response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Body.
    pub body: Vec<u8>,
    /// Value of the `Retry-After` header, in seconds.
    pub retry_after: Option<u64>,
}

impl HttpResponse {
    /// Creates a response.
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
            retry_after: None,
        }
    }

    fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// HTTP client abstraction.
///
/// `Err` means no response was received (connection failure, timeout).
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends a request.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, String>;
}

/// Backend over a JSON REST API.
pub struct HttpBackend<C: HttpClient> {
    base_url: String,
    client: C,
    last_error: RwLock<Option<BackendError>>,
}

#[derive(serde::Deserialize)]
struct SubscriptionEnvelope {
    subscription: SubscriptionObject,
    #[serde(default)]
    ryw_token: Option<RywToken>,
}

#[derive(serde::Deserialize)]
struct IdentityEnvelope {
    identity: BTreeMap<String, String>,
}

impl<C: HttpClient> HttpBackend<C> {
    /// Creates a backend rooted at `base_url` (e.g. `https://api.example.com`).
    pub fn new(base_url: impl Into<String>, client: C) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            last_error: RwLock::new(None),
        }
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns the most recent failure.
    pub fn last_error(&self) -> Option<BackendError> {
        self.last_error.read().clone()
    }

    async fn call(&self, method: HttpMethod, path: &str, body: Option<Vec<u8>>) -> BackendResult<Vec<u8>> {
        let request = HttpRequest {
            method,
            url: format!("{}{}", self.base_url, path),
            body,
        };
        tracing::debug!(method = ?request.method, url = %request.url, "backend request");

        let result = match self.client.send(request).await {
            Err(message) => Err(BackendError::network(message)),
            Ok(response) if response.is_success() => Ok(response.body),
            Ok(response) => {
                let payload = (!response.body.is_empty())
                    .then(|| String::from_utf8_lossy(&response.body).into_owned());
                let mut error = BackendError::status(response.status, payload);
                if let Some(seconds) = response.retry_after {
                    error = error.with_retry_after(Duration::from_secs(seconds));
                }
                Err(error)
            }
        };

        *self.last_error.write() = result.as_ref().err().cloned();
        result
    }

    async fn call_json<Req, Res>(&self, method: HttpMethod, path: &str, body: Option<&Req>) -> BackendResult<Res>
    where
        Req: Serialize + Sync,
        Res: DeserializeOwned,
    {
        let body = body
            .map(serde_json::to_vec)
            .transpose()
            .map_err(|e| BackendError::network(format!("failed to encode request: {e}")))?;
        let bytes = self.call(method, path, body).await?;
        let bytes = if bytes.is_empty() { b"{}".to_vec() } else { bytes };
        serde_json::from_slice(&bytes).map_err(|e| {
            // A 2xx with a body we cannot read will not improve on retry.
            BackendError::status(200, Some(format!("failed to decode response: {e}")))
        })
    }
}

fn user_path(app_id: &str, label: &str, value: &str) -> String {
    format!("/apps/{app_id}/users/by/{label}/{value}")
}

#[async_trait]
impl<C: HttpClient> UserBackend for HttpBackend<C> {
    async fn create_user(&self, app_id: &str, request: &CreateUserRequest) -> BackendResult<UserResponse> {
        self.call_json(HttpMethod::Post, &format!("/apps/{app_id}/users"), Some(request))
            .await
    }

    async fn update_user(
        &self,
        app_id: &str,
        onesignal_id: &str,
        request: &UpdateUserRequest,
    ) -> BackendResult<WriteResponse> {
        #[derive(Serialize)]
        struct Body<'a> {
            properties: &'a UpdateUserRequest,
        }
        self.call_json(
            HttpMethod::Patch,
            &user_path(app_id, "onesignal_id", onesignal_id),
            Some(&Body { properties: request }),
        )
        .await
    }

    async fn get_user(&self, app_id: &str, onesignal_id: &str) -> BackendResult<UserResponse> {
        self.call_json::<(), _>(HttpMethod::Get, &user_path(app_id, "onesignal_id", onesignal_id), None)
            .await
    }
}

#[async_trait]
impl<C: HttpClient> IdentityBackend for HttpBackend<C> {
    async fn set_aliases(
        &self,
        app_id: &str,
        label: &str,
        value: &str,
        aliases: &BTreeMap<String, String>,
    ) -> BackendResult<BTreeMap<String, String>> {
        #[derive(Serialize)]
        struct Body<'a> {
            identity: &'a BTreeMap<String, String>,
        }
        let envelope: IdentityEnvelope = self
            .call_json(
                HttpMethod::Patch,
                &format!("{}/identity", user_path(app_id, label, value)),
                Some(&Body { identity: aliases }),
            )
            .await?;
        Ok(envelope.identity)
    }

    async fn delete_alias(&self, app_id: &str, onesignal_id: &str, label: &str) -> BackendResult<()> {
        self.call(
            HttpMethod::Delete,
            &format!("{}/identity/{label}", user_path(app_id, "onesignal_id", onesignal_id)),
            None,
        )
        .await
        .map(|_| ())
    }
}

#[async_trait]
impl<C: HttpClient> SubscriptionBackend for HttpBackend<C> {
    async fn create_subscription(
        &self,
        app_id: &str,
        onesignal_id: &str,
        subscription: &SubscriptionObject,
    ) -> BackendResult<CreatedSubscription> {
        #[derive(Serialize)]
        struct Body<'a> {
            subscription: &'a SubscriptionObject,
        }
        let envelope: SubscriptionEnvelope = self
            .call_json(
                HttpMethod::Post,
                &format!("{}/subscriptions", user_path(app_id, "onesignal_id", onesignal_id)),
                Some(&Body { subscription }),
            )
            .await?;
        let id = envelope
            .subscription
            .id
            .ok_or_else(|| BackendError::status(200, Some("created subscription has no id".into())))?;
        Ok(CreatedSubscription {
            id,
            ryw_token: envelope.ryw_token,
        })
    }

    async fn update_subscription(
        &self,
        app_id: &str,
        subscription_id: &str,
        subscription: &SubscriptionObject,
    ) -> BackendResult<WriteResponse> {
        #[derive(Serialize)]
        struct Body<'a> {
            subscription: &'a SubscriptionObject,
        }
        self.call_json(
            HttpMethod::Patch,
            &format!("/apps/{app_id}/subscriptions/{subscription_id}"),
            Some(&Body { subscription }),
        )
        .await
    }

    async fn delete_subscription(&self, app_id: &str, subscription_id: &str) -> BackendResult<()> {
        self.call(
            HttpMethod::Delete,
            &format!("/apps/{app_id}/subscriptions/{subscription_id}"),
            None,
        )
        .await
        .map(|_| ())
    }

    async fn transfer_subscription(
        &self,
        app_id: &str,
        subscription_id: &str,
        onesignal_id: &str,
    ) -> BackendResult<()> {
        let body = serde_json::json!({ "identity": { "onesignal_id": onesignal_id } });
        self.call_json::<_, serde_json::Value>(
            HttpMethod::Patch,
            &format!("/apps/{app_id}/subscriptions/{subscription_id}/owner"),
            Some(&body),
        )
        .await
        .map(|_| ())
    }
}

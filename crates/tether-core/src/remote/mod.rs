//! Authenticated HTTP client for the Tether hub.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::models::{AppId, CommandPayload, ResourceId, ResourceKind, ResourceSnapshot, StoredToken};
use crate::util::{normalize_text_option, unix_timestamp_now};

/// A chunked response body, decoupled from the HTTP client for testability.
pub type ByteStream = Pin<Box<dyn Stream<Item = HubResult<Vec<u8>>> + Send>>;

#[derive(Debug, Error)]
pub enum HubError {
    #[error("Invalid hub configuration: {0}")]
    InvalidConfiguration(String),
    /// The hub is unreachable; read paths skip reconciliation silently and
    /// write paths fall back to the offline queue.
    #[error("Hub unreachable: {0}")]
    Offline(String),
    #[error("Hub HTTP request failed: {0}")]
    Http(reqwest::Error),
    #[error("Hub API error: {0}")]
    Api(String),
    #[error("Invalid hub payload: {0}")]
    InvalidPayload(String),
    #[error("Not authenticated with the hub")]
    Unauthenticated,
}

pub type HubResult<T> = Result<T, HubError>;

impl HubError {
    /// Whether this error means the hub could not be reached at all
    #[must_use]
    pub const fn is_offline(&self) -> bool {
        matches!(self, Self::Offline(_))
    }

    fn from_reqwest(error: reqwest::Error) -> Self {
        if error.is_connect() || error.is_timeout() {
            Self::Offline(error.to_string())
        } else {
            Self::Http(error)
        }
    }
}

/// Supplies the hub bearer token and its silent-renewal hook.
#[async_trait]
pub trait AccessTokenProvider: Send + Sync {
    /// Current bearer token for hub requests
    async fn access_token(&self) -> HubResult<String>;

    /// Renew the session after a 401 and return the fresh token
    async fn start_silent_renew(&self) -> HubResult<String>;
}

/// Canonical resource reads and writes used by the synchronizer.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Fetch the canonical snapshot for a resource
    async fn fetch_snapshot(
        &self,
        app_id: &AppId,
        resource_id: &ResourceId,
        kind: ResourceKind,
    ) -> HubResult<ResourceSnapshot>;

    /// Push a mutation batch for a resource
    async fn push_commands(
        &self,
        app_id: &AppId,
        resource_id: &ResourceId,
        payload: &[CommandPayload],
    ) -> HubResult<()>;
}

/// A token grant returned by the hub's OAuth proxy.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Lifetime in seconds, when the provider issued one
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl TokenGrant {
    /// Convert a grant into a storable token for `provider_id`.
    ///
    /// Falls back to `requested_scopes` when the provider echoed no scope.
    #[must_use]
    pub fn into_stored(self, provider_id: &str, requested_scopes: &[String]) -> StoredToken {
        let now = unix_timestamp_now();
        let scopes = self.scope.map_or_else(
            || requested_scopes.to_vec(),
            |scope| scope.split_whitespace().map(str::to_string).collect(),
        );
        StoredToken {
            provider_id: provider_id.to_string(),
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at: self.expires_in.map(|expires_in| now.saturating_add(expires_in)),
            scopes,
            stored_at: now,
        }
    }
}

impl fmt::Debug for TokenGrant {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("TokenGrant")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("expires_in", &self.expires_in)
            .field("scope", &self.scope)
            .finish()
    }
}

/// Device-flow session details shown to the user while the app polls.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeviceAuthorization {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    /// Window in seconds before the device code expires
    pub expires_in: i64,
    /// Poll interval in seconds
    #[serde(default = "default_device_interval")]
    pub interval: i64,
}

const fn default_device_interval() -> i64 {
    5
}

/// Outcome of a single device-flow poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DevicePoll {
    Pending,
    SlowDown,
    AccessDenied,
    Expired,
    Granted(TokenGrant),
}

/// OAuth proxy endpoints: code exchange, refresh, and the device flow.
#[async_trait]
pub trait TokenBroker: Send + Sync {
    async fn exchange_code(
        &self,
        provider_id: &str,
        code: &str,
        redirect_uri: &str,
    ) -> HubResult<TokenGrant>;

    async fn refresh_token(&self, provider_id: &str, refresh_token: &str) -> HubResult<TokenGrant>;

    async fn start_device_authorization(
        &self,
        provider_id: &str,
        scopes: &[String],
    ) -> HubResult<DeviceAuthorization>;

    async fn poll_device_token(
        &self,
        provider_id: &str,
        device_code: &str,
    ) -> HubResult<DevicePoll>;
}

/// Short-lived credentials for run artifact uploads.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct UploadCredentials {
    pub endpoint: String,
    pub access_token: String,
    #[serde(default)]
    pub expires_in: Option<i64>,
}

impl fmt::Debug for UploadCredentials {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("UploadCredentials")
            .field("endpoint", &self.endpoint)
            .field("access_token", &"[REDACTED]")
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// Execution-facing hub endpoints.
#[async_trait]
pub trait RemoteRunner: Send + Sync {
    /// Fetch short-lived upload credentials for an app (best-effort callers
    /// tolerate failure)
    async fn upload_credentials(&self, app_id: &AppId) -> HubResult<UploadCredentials>;

    /// Invoke an event remotely, returning the streamed response body
    async fn invoke_event(
        &self,
        app_id: &AppId,
        event_id: &ResourceId,
        payload: &Value,
    ) -> HubResult<ByteStream>;
}

/// Authenticated client for the Tether hub API.
#[derive(Clone)]
pub struct HubClient {
    base_url: String,
    client: Client,
    auth: Arc<dyn AccessTokenProvider>,
}

impl HubClient {
    pub fn new(base_url: impl Into<String>, auth: Arc<dyn AccessTokenProvider>) -> HubResult<Self> {
        let base_url = normalize_endpoint(base_url.into())?;
        Ok(Self {
            base_url,
            client: Client::builder().build().map_err(HubError::from_reqwest)?,
            auth,
        })
    }

    /// Perform an authenticated request, renewing the session once on a 401.
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> HubResult<reqwest::Response> {
        let token = self.auth.access_token().await?;
        let response = self.send(method.clone(), path, body, &token).await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            let renewed = self.auth.start_silent_renew().await?;
            let retried = self.send(method, path, body, &renewed).await?;
            return check_response(retried).await;
        }

        check_response(response).await
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        token: &str,
    ) -> HubResult<reqwest::Response> {
        let mut builder = self
            .client
            .request(method, format!("{}{path}", self.base_url))
            .bearer_auth(token)
            .header("Accept", "application/json");
        if let Some(body) = body {
            builder = builder.json(body);
        }
        builder.send().await.map_err(HubError::from_reqwest)
    }
}

#[async_trait]
impl RemoteStore for HubClient {
    async fn fetch_snapshot(
        &self,
        app_id: &AppId,
        resource_id: &ResourceId,
        kind: ResourceKind,
    ) -> HubResult<ResourceSnapshot> {
        let response = self
            .request(
                Method::GET,
                &format!("/apps/{app_id}/resources/{kind}/{resource_id}"),
                None,
            )
            .await?;
        response
            .json::<ResourceSnapshot>()
            .await
            .map_err(HubError::from_reqwest)
    }

    async fn push_commands(
        &self,
        app_id: &AppId,
        resource_id: &ResourceId,
        payload: &[CommandPayload],
    ) -> HubResult<()> {
        let body = serde_json::json!({ "commands": payload });
        self.request(
            Method::POST,
            &format!("/apps/{app_id}/resources/{resource_id}/commands"),
            Some(&body),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl TokenBroker for HubClient {
    async fn exchange_code(
        &self,
        provider_id: &str,
        code: &str,
        redirect_uri: &str,
    ) -> HubResult<TokenGrant> {
        let body = serde_json::json!({ "code": code, "redirect_uri": redirect_uri });
        let response = self
            .request(Method::POST, &format!("/oauth/token/{provider_id}"), Some(&body))
            .await?;
        response
            .json::<TokenGrant>()
            .await
            .map_err(HubError::from_reqwest)
    }

    async fn refresh_token(&self, provider_id: &str, refresh_token: &str) -> HubResult<TokenGrant> {
        let body = serde_json::json!({ "refresh_token": refresh_token });
        let response = self
            .request(
                Method::POST,
                &format!("/oauth/refresh/{provider_id}"),
                Some(&body),
            )
            .await?;
        response
            .json::<TokenGrant>()
            .await
            .map_err(HubError::from_reqwest)
    }

    async fn start_device_authorization(
        &self,
        provider_id: &str,
        scopes: &[String],
    ) -> HubResult<DeviceAuthorization> {
        let body = serde_json::json!({ "scopes": scopes });
        let response = self
            .request(
                Method::POST,
                &format!("/oauth/device/start/{provider_id}"),
                Some(&body),
            )
            .await?;
        response
            .json::<DeviceAuthorization>()
            .await
            .map_err(HubError::from_reqwest)
    }

    async fn poll_device_token(
        &self,
        provider_id: &str,
        device_code: &str,
    ) -> HubResult<DevicePoll> {
        let token = self.auth.access_token().await?;
        let body = serde_json::json!({ "device_code": device_code });
        let response = self
            .send(
                Method::POST,
                &format!("/oauth/device/poll/{provider_id}"),
                Some(&body),
                &token,
            )
            .await?;

        if response.status().is_success() {
            let grant = response
                .json::<TokenGrant>()
                .await
                .map_err(HubError::from_reqwest)?;
            return Ok(DevicePoll::Granted(grant));
        }

        let status = response.status();
        let raw = response.text().await.unwrap_or_default();
        Ok(parse_device_poll_error(status, &raw)?)
    }
}

#[async_trait]
impl RemoteRunner for HubClient {
    async fn upload_credentials(&self, app_id: &AppId) -> HubResult<UploadCredentials> {
        let response = self
            .request(
                Method::GET,
                &format!("/apps/{app_id}/upload-credentials"),
                None,
            )
            .await?;
        response
            .json::<UploadCredentials>()
            .await
            .map_err(HubError::from_reqwest)
    }

    async fn invoke_event(
        &self,
        app_id: &AppId,
        event_id: &ResourceId,
        payload: &Value,
    ) -> HubResult<ByteStream> {
        let body = serde_json::json!({ "payload": payload, "streaming": true });
        let response = self
            .request(
                Method::POST,
                &format!("/apps/{app_id}/events/{event_id}/invoke"),
                Some(&body),
            )
            .await?;

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(HubError::from_reqwest));
        Ok(Box::pin(stream))
    }
}

async fn check_response(response: reqwest::Response) -> HubResult<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }

    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    Err(HubError::Api(parse_api_error(status, &body)))
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    message: Option<String>,
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ApiErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return format!("{} ({})", message.trim(), status.as_u16());
        }
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{} ({})", crate::util::compact_text(trimmed), status.as_u16())
    }
}

fn parse_device_poll_error(status: StatusCode, body: &str) -> HubResult<DevicePoll> {
    let code = serde_json::from_str::<ApiErrorBody>(body)
        .ok()
        .and_then(|payload| payload.error)
        .unwrap_or_default();

    match code.as_str() {
        "authorization_pending" => Ok(DevicePoll::Pending),
        "slow_down" => Ok(DevicePoll::SlowDown),
        "access_denied" => Ok(DevicePoll::AccessDenied),
        "expired_token" => Ok(DevicePoll::Expired),
        _ => Err(HubError::Api(parse_api_error(status, body))),
    }
}

fn normalize_endpoint(raw: String) -> HubResult<String> {
    let endpoint = normalize_text_option(Some(raw)).ok_or_else(|| {
        HubError::InvalidConfiguration("hub base URL must not be empty".to_string())
    })?;
    if crate::util::is_http_url(&endpoint) {
        Ok(endpoint.trim_end_matches('/').to_string())
    } else {
        Err(HubError::InvalidConfiguration(
            "hub base URL must include http:// or https://".to_string(),
        ))
    }
}

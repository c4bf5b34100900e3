//! OAuth provider, token, and consent models

use serde::{Deserialize, Serialize};
use std::fmt;

use super::resource::AppId;
use crate::util::unix_timestamp_now;

/// Tokens within this window of their expiry are treated as expired.
pub const TOKEN_EXPIRY_SKEW_SECONDS: i64 = 60;

/// Pending authorizations older than this are garbage-collected.
pub const PENDING_AUTHORIZATION_TTL_SECONDS: i64 = 10 * 60;

/// A third-party integration a resource declares it needs before it can run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderRequirement {
    /// Provider identifier (e.g. "github", "notion")
    pub provider_id: String,
    /// OAuth scopes the resource needs
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Whether authorization uses the device flow instead of a redirect
    #[serde(default)]
    pub use_device_flow: bool,
}

/// A persisted OAuth token for one provider.
///
/// Possession of a token never implies app consent; both must hold before
/// an execution proceeds without prompting.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredToken {
    pub provider_id: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Expiry (Unix seconds); `None` means the provider issued no expiry
    pub expires_at: Option<i64>,
    pub scopes: Vec<String>,
    /// Storage timestamp (Unix seconds)
    pub stored_at: i64,
}

impl StoredToken {
    /// Whether the token is expired (with skew) and must be refreshed before use
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|expires_at| unix_timestamp_now() + TOKEN_EXPIRY_SKEW_SECONDS >= expires_at)
    }
}

impl fmt::Debug for StoredToken {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("StoredToken")
            .field("provider_id", &self.provider_id)
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .field("scopes", &self.scopes)
            .field("stored_at", &self.stored_at)
            .finish()
    }
}

/// App-scoped user approval for a provider, independent of token possession.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentRecord {
    pub app_id: AppId,
    pub provider_id: String,
    /// Consent timestamp (Unix seconds)
    pub consented_at: i64,
    pub scopes: Vec<String>,
}

/// An authorization attempt awaiting its out-of-band callback.
///
/// Keyed by the opaque `state` nonce; a callback consumes the entry exactly
/// once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingAuthorization {
    pub state: String,
    pub provider_id: String,
    /// Initiation timestamp (Unix seconds)
    pub initiated_at: i64,
}

impl PendingAuthorization {
    /// Whether this entry is past the garbage-collection window
    #[must_use]
    pub const fn is_expired(&self, now_seconds: i64) -> bool {
        now_seconds - self.initiated_at > PENDING_AUTHORIZATION_TTL_SECONDS
    }
}

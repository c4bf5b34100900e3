//! CLI session persistence using the OS keyring.

use std::fmt;

use keyring::Entry;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const KEYRING_SERVICE_NAME: &str = "tether";
const KEYRING_SESSION_USERNAME: &str = "hub_session";

/// A stored hub session (bearer token).
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubSession {
    pub access_token: String,
    /// Storage timestamp (Unix seconds)
    pub stored_at: i64,
}

impl fmt::Debug for HubSession {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("HubSession")
            .field("access_token", &"[REDACTED]")
            .field("stored_at", &self.stored_at)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum SessionStoreError {
    #[error("Secure storage error: {0}")]
    SecureStorage(String),
    #[error("Failed to parse stored session: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type SessionStoreResult<T> = Result<T, SessionStoreError>;

/// CLI session store backed by the OS keyring (`keyring` crate).
#[derive(Debug, Clone)]
pub struct KeyringSessionStore {
    service_name: String,
    username: String,
}

impl Default for KeyringSessionStore {
    fn default() -> Self {
        Self {
            service_name: KEYRING_SERVICE_NAME.to_string(),
            username: KEYRING_SESSION_USERNAME.to_string(),
        }
    }
}

impl KeyringSessionStore {
    fn entry(&self) -> SessionStoreResult<Entry> {
        Entry::new(&self.service_name, &self.username)
            .map_err(|error| SessionStoreError::SecureStorage(error.to_string()))
    }

    pub fn load(&self) -> SessionStoreResult<Option<HubSession>> {
        let entry = self.entry()?;
        match entry.get_password() {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(error) => Err(SessionStoreError::SecureStorage(error.to_string())),
        }
    }

    pub fn save(&self, session: &HubSession) -> SessionStoreResult<()> {
        let serialized = serde_json::to_string(session)?;
        self.entry()?
            .set_password(&serialized)
            .map_err(|error| SessionStoreError::SecureStorage(error.to_string()))
    }

    pub fn clear(&self) -> SessionStoreResult<()> {
        let entry = self.entry()?;
        match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(error) => Err(SessionStoreError::SecureStorage(error.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hub_session_debug_redacts_token() {
        let session = HubSession {
            access_token: "secret".to_string(),
            stored_at: 123,
        };
        let debug = format!("{session:?}");
        assert!(!debug.contains("secret"));
        assert!(debug.contains("[REDACTED]"));
    }
}

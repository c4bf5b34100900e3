//! Bootstrap configuration for client apps.
//!
//! Provides a unified `BootstrapConfig` struct used by desktop and CLI
//! clients to discover the hub API, OAuth redirect endpoint, and feature
//! flags.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::util::{compact_text, is_http_url, normalize_text_option};

const BOOTSTRAP_SCHEMA_VERSION: u32 = 1;
const BOOTSTRAP_HTTP_TIMEOUT_SECS: u64 = 4;

/// Build-provisioned client configuration.
///
/// These values are safe-to-ship public endpoints required to bootstrap hub
/// access. Secret credentials must never be stored here.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BootstrapConfig {
    #[serde(default)]
    pub bootstrap_manifest_url: Option<String>,
    #[serde(default)]
    pub hub_base_url: Option<String>,
    #[serde(default)]
    pub oauth_redirect_uri: Option<String>,
    #[serde(default)]
    pub remote_execution: bool,
}

impl BootstrapConfig {
    /// Returns the hub base URL for authenticated operations.
    pub fn hub_base_url(&self) -> Option<String> {
        normalize_text_option(self.hub_base_url.clone())
    }
}

/// Resolve runtime bootstrap config by fetching the manifest URL.
///
/// If `bootstrap_manifest_url` is set, fetch/parse/validation failures are
/// returned as errors instead of falling back to embedded values.
pub async fn resolve_bootstrap_config(
    fallback: BootstrapConfig,
) -> Result<BootstrapConfig, String> {
    let Some(manifest_url) = normalize_text_option(fallback.bootstrap_manifest_url.clone()) else {
        return Ok(fallback);
    };

    fetch_bootstrap_manifest(&manifest_url).await
}

/// Parse a bootstrap manifest from a raw JSON payload.
///
/// Public for testability — callers can exercise parsing without network access.
pub fn parse_bootstrap_manifest(
    payload: &str,
    manifest_url: &str,
) -> Result<BootstrapConfig, String> {
    let manifest: ManagedBootstrapManifest = serde_json::from_str(payload)
        .map_err(|error| format!("invalid bootstrap manifest JSON: {error}"))?;
    manifest.into_runtime_config(manifest_url)
}

// ---------------------------------------------------------------------------
// Private
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
struct ManagedBootstrapManifest {
    schema_version: u32,
    manifest_version: String,
    hub_base_url: String,
    #[serde(default)]
    oauth_redirect_uri: Option<String>,
    feature_flags: ManagedFeatureFlags,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
struct ManagedFeatureFlags {
    remote_execution: bool,
}

impl ManagedBootstrapManifest {
    fn into_runtime_config(self, manifest_url: &str) -> Result<BootstrapConfig, String> {
        if self.schema_version != BOOTSTRAP_SCHEMA_VERSION {
            return Err(format!(
                "unsupported bootstrap schema_version {} (expected {})",
                self.schema_version, BOOTSTRAP_SCHEMA_VERSION
            ));
        }
        if self.manifest_version.trim().is_empty() {
            return Err("bootstrap manifest_version must not be empty".to_string());
        }

        let hub_base_url = normalize_required_http_url(self.hub_base_url, "hub_base_url")?;
        let oauth_redirect_uri = normalize_text_option(self.oauth_redirect_uri);

        Ok(BootstrapConfig {
            bootstrap_manifest_url: Some(manifest_url.to_string()),
            hub_base_url: Some(hub_base_url),
            oauth_redirect_uri,
            remote_execution: self.feature_flags.remote_execution,
        })
    }
}

async fn fetch_bootstrap_manifest(url: &str) -> Result<BootstrapConfig, String> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(BOOTSTRAP_HTTP_TIMEOUT_SECS))
        .build()
        .map_err(|error| format!("failed to build bootstrap HTTP client: {error}"))?;

    let response = client
        .get(url)
        .header(reqwest::header::ACCEPT, "application/json")
        .send()
        .await
        .map_err(|error| format!("bootstrap request failed: {error}"))?;

    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|error| format!("failed to read bootstrap error response body: {error}"))?;
        return Err(format!(
            "bootstrap endpoint returned HTTP {status}: {}",
            compact_text(&body)
        ));
    }

    let body = response
        .text()
        .await
        .map_err(|error| format!("failed to read bootstrap response body: {error}"))?;
    parse_bootstrap_manifest(&body, url)
}

fn normalize_required_http_url(raw: String, field: &str) -> Result<String, String> {
    let value = normalize_text_option(Some(raw))
        .ok_or_else(|| format!("bootstrap field '{field}' is required"))?;
    if is_http_url(&value) {
        Ok(value.trim_end_matches('/').to_string())
    } else {
        Err(format!(
            "bootstrap field '{field}' must include http:// or https://"
        ))
    }
}

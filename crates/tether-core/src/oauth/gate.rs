//! Authorization gate run before every execution attempt.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::db::OAuthRepository;
use crate::models::{
    AppId, ConsentRecord, PendingAuthorization, ProviderRequirement, StoredToken,
    PENDING_AUTHORIZATION_TTL_SECONDS,
};
use crate::remote::{DeviceAuthorization, HubError, TokenBroker};
use crate::util::unix_timestamp_now;

use super::device::{run_device_flow, DeviceFlowError};

#[derive(Debug, Error)]
pub enum GateError {
    /// One or more providers never reached a satisfied state; execution is
    /// blocked entirely. Never retried automatically.
    #[error("Authorization required for providers: {}", providers.join(", "))]
    AuthorizationRequired { providers: Vec<String> },
    #[error("No authorization dialog session is active")]
    NoActiveSession,
    #[error("Unknown or already-consumed authorization state")]
    UnknownState,
    #[error(transparent)]
    Device(#[from] DeviceFlowError),
    #[error(transparent)]
    Store(#[from] crate::error::Error),
    #[error(transparent)]
    Hub(#[from] HubError),
}

pub type GateResult<T> = Result<T, GateError>;

/// Gate outcome for one execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Satisfied,
    AwaitingConsent,
    AwaitingAuthorization,
}

/// Partition of an attempt's required providers.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GateReport {
    /// Valid token and app consent both present
    pub satisfied: Vec<ProviderRequirement>,
    /// Valid token, but the app was never approved for the provider
    pub needs_consent: Vec<ProviderRequirement>,
    /// No usable token at all
    pub needs_authorization: Vec<ProviderRequirement>,
}

impl GateReport {
    /// Whether every required provider may be used silently
    #[must_use]
    pub fn is_satisfied(&self) -> bool {
        self.needs_consent.is_empty() && self.needs_authorization.is_empty()
    }

    /// Resulting gate state for this attempt
    #[must_use]
    pub fn state(&self) -> GateState {
        if !self.needs_authorization.is_empty() {
            GateState::AwaitingAuthorization
        } else if !self.needs_consent.is_empty() {
            GateState::AwaitingConsent
        } else {
            GateState::Satisfied
        }
    }

    /// Provider ids still blocking execution
    #[must_use]
    pub fn missing_providers(&self) -> Vec<String> {
        self.needs_consent
            .iter()
            .chain(&self.needs_authorization)
            .map(|requirement| requirement.provider_id.clone())
            .collect()
    }
}

/// Endpoint details for building a redirect authorization URL.
#[derive(Debug, Clone)]
pub struct AuthorizeEndpoint {
    pub auth_url: String,
    pub client_id: String,
    pub redirect_uri: String,
}

/// A started redirect authorization: send the user to `url`, then resolve
/// the callback with `state`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationRequest {
    pub state: String,
    pub url: String,
}

/// Checks provider requirements, silently refreshing expired tokens, and
/// drives the consent/authorization escalation paths.
pub struct OAuthGate<B: TokenBroker> {
    repo: Arc<dyn OAuthRepository>,
    broker: Arc<B>,
    // Providers in play while an authorization dialog is open, so an
    // out-of-band callback can resolve which provider it belongs to.
    session: Mutex<Option<HashMap<String, ProviderRequirement>>>,
}

impl<B: TokenBroker> OAuthGate<B> {
    pub fn new(repo: Arc<dyn OAuthRepository>, broker: Arc<B>) -> Self {
        Self {
            repo,
            broker,
            session: Mutex::new(None),
        }
    }

    /// Classify every required provider for an execution attempt.
    ///
    /// `skip_consent_check` is set on re-invocation after the caller already
    /// drove the consent dialog for this attempt, so the user is not
    /// prompted twice.
    pub async fn check(
        &self,
        app_id: &AppId,
        requirements: &[ProviderRequirement],
        skip_consent_check: bool,
    ) -> GateResult<GateReport> {
        let mut report = GateReport::default();

        for requirement in requirements {
            let token = self.valid_token(requirement).await?;
            let has_consent = skip_consent_check
                || self
                    .repo
                    .get_consent(app_id, &requirement.provider_id)
                    .await?
                    .is_some();

            match (token.is_some(), has_consent) {
                (true, true) => report.satisfied.push(requirement.clone()),
                (true, false) => report.needs_consent.push(requirement.clone()),
                (false, _) => report.needs_authorization.push(requirement.clone()),
            }
        }

        Ok(report)
    }

    /// Run `check` and fail with a typed error unless every provider is
    /// satisfied. Partial authorization is never accepted.
    pub async fn require_satisfied(
        &self,
        app_id: &AppId,
        requirements: &[ProviderRequirement],
        skip_consent_check: bool,
    ) -> GateResult<GateReport> {
        let report = self.check(app_id, requirements, skip_consent_check).await?;
        if report.is_satisfied() {
            Ok(report)
        } else {
            Err(GateError::AuthorizationRequired {
                providers: report.missing_providers(),
            })
        }
    }

    /// Stored tokens for the given providers, keyed by provider id.
    pub async fn tokens_for(
        &self,
        requirements: &[ProviderRequirement],
    ) -> GateResult<HashMap<String, StoredToken>> {
        let mut tokens = HashMap::new();
        for requirement in requirements {
            if let Some(token) = self.valid_token(requirement).await? {
                tokens.insert(requirement.provider_id.clone(), token);
            }
        }
        Ok(tokens)
    }

    /// Record the user's app-scoped approval of a provider.
    pub async fn record_consent(
        &self,
        app_id: &AppId,
        requirement: &ProviderRequirement,
    ) -> GateResult<()> {
        self.repo
            .put_consent(&ConsentRecord {
                app_id: *app_id,
                provider_id: requirement.provider_id.clone(),
                consented_at: unix_timestamp_now(),
                scopes: requirement.scopes.clone(),
            })
            .await?;
        Ok(())
    }

    /// Cache the providers in play while an authorization dialog is open.
    pub fn open_dialog_session(&self, requirements: &[ProviderRequirement]) {
        let providers = requirements
            .iter()
            .map(|requirement| (requirement.provider_id.clone(), requirement.clone()))
            .collect();
        *self.session.lock().expect("gate session mutex poisoned") = Some(providers);
    }

    /// Clear the dialog session cache.
    pub fn close_dialog_session(&self) {
        *self.session.lock().expect("gate session mutex poisoned") = None;
    }

    /// Reset all process-scoped gate state (logout / profile switch).
    pub fn reset(&self) {
        self.close_dialog_session();
    }

    fn session_provider(&self, provider_id: &str) -> Option<ProviderRequirement> {
        self.session
            .lock()
            .expect("gate session mutex poisoned")
            .as_ref()
            .and_then(|providers| providers.get(provider_id).cloned())
    }

    /// Begin a redirect authorization for a provider.
    ///
    /// Persists a pending entry keyed by a fresh state nonce and returns the
    /// URL to open. Stale pending entries are garbage-collected first.
    pub async fn begin_authorization(
        &self,
        requirement: &ProviderRequirement,
        endpoint: &AuthorizeEndpoint,
    ) -> GateResult<AuthorizationRequest> {
        self.gc_pending().await?;

        let state = Uuid::now_v7().to_string();
        self.repo
            .insert_pending(&PendingAuthorization {
                state: state.clone(),
                provider_id: requirement.provider_id.clone(),
                initiated_at: unix_timestamp_now(),
            })
            .await?;

        let url = format!(
            "{}?response_type=code&client_id={}&redirect_uri={}&scope={}&state={}",
            endpoint.auth_url,
            urlencoding::encode(&endpoint.client_id),
            urlencoding::encode(&endpoint.redirect_uri),
            urlencoding::encode(&requirement.scopes.join(" ")),
            urlencoding::encode(&state),
        );

        Ok(AuthorizationRequest { state, url })
    }

    /// Resolve a redirect callback.
    ///
    /// The pending entry is consumed exactly once; a replayed or unknown
    /// state fails. The resulting token is stored for the provider.
    pub async fn complete_authorization(
        &self,
        state: &str,
        code: &str,
        redirect_uri: &str,
    ) -> GateResult<StoredToken> {
        self.gc_pending().await?;

        let pending = self
            .repo
            .consume_pending(state)
            .await?
            .ok_or(GateError::UnknownState)?;
        let requirement = self
            .session_provider(&pending.provider_id)
            .ok_or(GateError::NoActiveSession)?;

        let grant = self
            .broker
            .exchange_code(&pending.provider_id, code, redirect_uri)
            .await?;
        let token = grant.into_stored(&pending.provider_id, &requirement.scopes);
        self.repo.put_token(&token).await?;
        Ok(token)
    }

    /// Run the device flow for a provider and store the resulting token.
    pub async fn authorize_device(
        &self,
        requirement: &ProviderRequirement,
        abort: &CancellationToken,
        on_user_code: impl FnOnce(&DeviceAuthorization) + Send,
    ) -> GateResult<StoredToken> {
        let token = run_device_flow(self.broker.as_ref(), requirement, abort, on_user_code).await?;
        self.repo.put_token(&token).await?;
        Ok(token)
    }

    /// Drop pending authorizations past their ten-minute window.
    pub async fn gc_pending(&self) -> GateResult<usize> {
        let cutoff = unix_timestamp_now() - PENDING_AUTHORIZATION_TTL_SECONDS;
        let removed = self.repo.gc_pending(cutoff).await?;
        if removed > 0 {
            tracing::debug!(removed, "garbage-collected stale pending authorizations");
        }
        Ok(removed)
    }

    async fn valid_token(
        &self,
        requirement: &ProviderRequirement,
    ) -> GateResult<Option<StoredToken>> {
        let Some(token) = self.repo.get_token(&requirement.provider_id).await? else {
            return Ok(None);
        };

        if !token.is_expired() {
            return Ok(Some(token));
        }

        let Some(refresh_token) = token.refresh_token.clone() else {
            // expired and unrefreshable: as good as missing
            return Ok(None);
        };

        match self
            .broker
            .refresh_token(&requirement.provider_id, &refresh_token)
            .await
        {
            Ok(grant) => {
                let mut refreshed = grant.into_stored(&requirement.provider_id, &token.scopes);
                // providers that rotate refresh tokens send a new one;
                // otherwise the old one stays valid
                if refreshed.refresh_token.is_none() {
                    refreshed.refresh_token = Some(refresh_token);
                }
                self.repo.put_token(&refreshed).await?;
                Ok(Some(refreshed))
            }
            Err(error) => {
                tracing::warn!(
                    %error,
                    provider_id = %requirement.provider_id,
                    "silent token refresh failed"
                );
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Database, LibSqlOAuthRepository};
    use crate::models::TOKEN_EXPIRY_SKEW_SECONDS;
    use crate::remote::{DevicePoll, HubResult, TokenGrant};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeBroker {
        refreshes: AtomicUsize,
        exchanges: AtomicUsize,
        fail_refresh: bool,
    }

    #[async_trait]
    impl TokenBroker for FakeBroker {
        async fn exchange_code(
            &self,
            _provider_id: &str,
            code: &str,
            _redirect_uri: &str,
        ) -> HubResult<TokenGrant> {
            self.exchanges.fetch_add(1, Ordering::SeqCst);
            Ok(TokenGrant {
                access_token: format!("exchanged-{code}"),
                refresh_token: Some("fresh-refresh".to_string()),
                expires_in: Some(3600),
                scope: None,
            })
        }

        async fn refresh_token(
            &self,
            _provider_id: &str,
            _refresh_token: &str,
        ) -> HubResult<TokenGrant> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            if self.fail_refresh {
                return Err(HubError::Api("refresh rejected (400)".to_string()));
            }
            Ok(TokenGrant {
                access_token: "refreshed".to_string(),
                refresh_token: None,
                expires_in: Some(3600),
                scope: None,
            })
        }

        async fn start_device_authorization(
            &self,
            _provider_id: &str,
            _scopes: &[String],
        ) -> HubResult<DeviceAuthorization> {
            Ok(DeviceAuthorization {
                device_code: "device".to_string(),
                user_code: "CODE".to_string(),
                verification_uri: "https://example.com".to_string(),
                expires_in: 600,
                interval: 1,
            })
        }

        async fn poll_device_token(
            &self,
            _provider_id: &str,
            _device_code: &str,
        ) -> HubResult<DevicePoll> {
            Ok(DevicePoll::Granted(TokenGrant {
                access_token: "device-grant".to_string(),
                refresh_token: None,
                expires_in: Some(3600),
                scope: None,
            }))
        }
    }

    async fn gate(broker: FakeBroker) -> (Database, OAuthGate<FakeBroker>) {
        let db = Database::open_in_memory().await.unwrap();
        let repo = Arc::new(LibSqlOAuthRepository::new(db.connection()));
        (db, OAuthGate::new(repo, Arc::new(broker)))
    }

    fn requirement(provider: &str) -> ProviderRequirement {
        ProviderRequirement {
            provider_id: provider.to_string(),
            scopes: vec!["repo".to_string()],
            use_device_flow: false,
        }
    }

    fn stored(provider: &str, expires_at: Option<i64>, refresh: Option<&str>) -> StoredToken {
        StoredToken {
            provider_id: provider.to_string(),
            access_token: "stored".to_string(),
            refresh_token: refresh.map(str::to_string),
            expires_at,
            scopes: vec!["repo".to_string()],
            stored_at: unix_timestamp_now(),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn provider_without_token_needs_authorization() {
        let (_db, gate) = gate(FakeBroker::default()).await;
        let app = AppId::new();

        let report = gate
            .check(&app, &[requirement("github")], false)
            .await
            .unwrap();
        assert_eq!(report.needs_authorization.len(), 1);
        assert_eq!(report.state(), GateState::AwaitingAuthorization);

        let error = gate
            .require_satisfied(&app, &[requirement("github")], false)
            .await
            .unwrap_err();
        match error {
            GateError::AuthorizationRequired { providers } => {
                assert_eq!(providers, vec!["github"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn token_without_consent_needs_dialog() {
        let (db, gate) = gate(FakeBroker::default()).await;
        let repo = LibSqlOAuthRepository::new(db.connection());
        let app = AppId::new();

        repo.put_token(&stored("github", Some(unix_timestamp_now() + 3600), None))
            .await
            .unwrap();

        // a silent execution would technically succeed, but consent is
        // app-scoped and missing
        let report = gate
            .check(&app, &[requirement("github")], false)
            .await
            .unwrap();
        assert_eq!(report.needs_consent.len(), 1);
        assert!(report.satisfied.is_empty());
        assert_eq!(report.state(), GateState::AwaitingConsent);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn consented_provider_with_token_is_satisfied() {
        let (db, gate) = gate(FakeBroker::default()).await;
        let repo = LibSqlOAuthRepository::new(db.connection());
        let app = AppId::new();

        repo.put_token(&stored("github", Some(unix_timestamp_now() + 3600), None))
            .await
            .unwrap();
        gate.record_consent(&app, &requirement("github")).await.unwrap();

        let report = gate
            .require_satisfied(&app, &[requirement("github")], false)
            .await
            .unwrap();
        assert_eq!(report.satisfied.len(), 1);
        assert_eq!(report.state(), GateState::Satisfied);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn skip_consent_check_suppresses_second_prompt() {
        let (db, gate) = gate(FakeBroker::default()).await;
        let repo = LibSqlOAuthRepository::new(db.connection());
        let app = AppId::new();

        repo.put_token(&stored("github", Some(unix_timestamp_now() + 3600), None))
            .await
            .unwrap();

        let report = gate
            .check(&app, &[requirement("github")], true)
            .await
            .unwrap();
        assert!(report.is_satisfied());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn expired_token_with_refresh_is_silently_renewed() {
        let (db, gate) = gate(FakeBroker::default()).await;
        let repo = LibSqlOAuthRepository::new(db.connection());
        let app = AppId::new();

        let expired_at = unix_timestamp_now() + TOKEN_EXPIRY_SKEW_SECONDS - 10;
        repo.put_token(&stored("github", Some(expired_at), Some("keep-me")))
            .await
            .unwrap();
        gate.record_consent(&app, &requirement("github")).await.unwrap();

        let report = gate
            .check(&app, &[requirement("github")], false)
            .await
            .unwrap();
        assert!(report.is_satisfied());
        assert_eq!(gate.broker.refreshes.load(Ordering::SeqCst), 1);

        // rotated token persisted, original refresh token retained
        let persisted = repo.get_token("github").await.unwrap().unwrap();
        assert_eq!(persisted.access_token, "refreshed");
        assert_eq!(persisted.refresh_token.as_deref(), Some("keep-me"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn expired_token_without_refresh_is_missing() {
        let (db, gate) = gate(FakeBroker::default()).await;
        let repo = LibSqlOAuthRepository::new(db.connection());
        let app = AppId::new();

        repo.put_token(&stored("github", Some(unix_timestamp_now() - 100), None))
            .await
            .unwrap();

        let report = gate
            .check(&app, &[requirement("github")], false)
            .await
            .unwrap();
        assert_eq!(report.needs_authorization.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_refresh_degrades_to_missing() {
        let broker = FakeBroker {
            fail_refresh: true,
            ..FakeBroker::default()
        };
        let (db, gate) = gate(broker).await;
        let repo = LibSqlOAuthRepository::new(db.connection());
        let app = AppId::new();

        repo.put_token(&stored("github", Some(unix_timestamp_now() - 100), Some("dead")))
            .await
            .unwrap();

        let report = gate
            .check(&app, &[requirement("github")], false)
            .await
            .unwrap();
        assert_eq!(report.needs_authorization.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn partial_authorization_blocks_execution() {
        let (db, gate) = gate(FakeBroker::default()).await;
        let repo = LibSqlOAuthRepository::new(db.connection());
        let app = AppId::new();

        repo.put_token(&stored("github", Some(unix_timestamp_now() + 3600), None))
            .await
            .unwrap();
        gate.record_consent(&app, &requirement("github")).await.unwrap();

        let requirements = [requirement("github"), requirement("notion")];
        let error = gate
            .require_satisfied(&app, &requirements, false)
            .await
            .unwrap_err();
        match error {
            GateError::AuthorizationRequired { providers } => {
                assert_eq!(providers, vec!["notion"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn redirect_authorization_round_trip() {
        let (db, gate) = gate(FakeBroker::default()).await;
        let repo = LibSqlOAuthRepository::new(db.connection());

        let github = requirement("github");
        gate.open_dialog_session(std::slice::from_ref(&github));

        let endpoint = AuthorizeEndpoint {
            auth_url: "https://github.com/login/oauth/authorize".to_string(),
            client_id: "client".to_string(),
            redirect_uri: "tether://oauth/callback".to_string(),
        };
        let request = gate.begin_authorization(&github, &endpoint).await.unwrap();
        assert!(request.url.contains("state="));
        assert!(request.url.contains("scope=repo"));

        let token = gate
            .complete_authorization(&request.state, "auth-code", &endpoint.redirect_uri)
            .await
            .unwrap();
        assert_eq!(token.access_token, "exchanged-auth-code");

        // persisted for later checks
        assert!(repo.get_token("github").await.unwrap().is_some());

        // exactly-once: a replayed callback fails
        let replay = gate
            .complete_authorization(&request.state, "auth-code", &endpoint.redirect_uri)
            .await;
        assert!(matches!(replay, Err(GateError::UnknownState)));

        gate.close_dialog_session();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn callback_without_session_fails() {
        let (_db, gate) = gate(FakeBroker::default()).await;
        let github = requirement("github");

        let endpoint = AuthorizeEndpoint {
            auth_url: "https://github.com/login/oauth/authorize".to_string(),
            client_id: "client".to_string(),
            redirect_uri: "tether://oauth/callback".to_string(),
        };
        let request = gate.begin_authorization(&github, &endpoint).await.unwrap();

        // no dialog session: the callback cannot resolve its provider
        let result = gate
            .complete_authorization(&request.state, "code", &endpoint.redirect_uri)
            .await;
        assert!(matches!(result, Err(GateError::NoActiveSession)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn device_authorization_stores_token() {
        let (db, gate) = gate(FakeBroker::default()).await;
        let repo = LibSqlOAuthRepository::new(db.connection());

        let mut github = requirement("github");
        github.use_device_flow = true;

        let token = gate
            .authorize_device(&github, &CancellationToken::new(), |_| {})
            .await
            .unwrap();
        assert_eq!(token.access_token, "device-grant");
        assert!(repo.get_token("github").await.unwrap().is_some());
    }
}

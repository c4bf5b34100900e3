//! OAuth token, consent, and pending-authorization storage

use async_trait::async_trait;
use libsql::{params, Connection};

use crate::error::Result;
use crate::models::{AppId, ConsentRecord, PendingAuthorization, StoredToken};

/// Trait for durable OAuth state.
///
/// Tokens are provider-scoped; consents are app-scoped. The two are
/// independent: holding a token for a provider says nothing about whether a
/// given app may use it.
#[async_trait]
pub trait OAuthRepository: Send + Sync {
    /// Get the stored token for a provider
    async fn get_token(&self, provider_id: &str) -> Result<Option<StoredToken>>;

    /// Insert or replace the token for a provider
    async fn put_token(&self, token: &StoredToken) -> Result<()>;

    /// Remove the token for a provider
    async fn delete_token(&self, provider_id: &str) -> Result<()>;

    /// Get the consent record for an app/provider pair
    async fn get_consent(&self, app_id: &AppId, provider_id: &str)
        -> Result<Option<ConsentRecord>>;

    /// Insert or replace a consent record
    async fn put_consent(&self, consent: &ConsentRecord) -> Result<()>;

    /// Revoke consent for an app/provider pair
    async fn revoke_consent(&self, app_id: &AppId, provider_id: &str) -> Result<()>;

    /// Store an in-flight authorization attempt keyed by state nonce
    async fn insert_pending(&self, pending: &PendingAuthorization) -> Result<()>;

    /// Consume a pending authorization exactly once.
    ///
    /// Returns `None` when the nonce is unknown or was already consumed.
    async fn consume_pending(&self, state: &str) -> Result<Option<PendingAuthorization>>;

    /// Delete pending authorizations initiated before the cutoff (Unix seconds)
    async fn gc_pending(&self, cutoff_seconds: i64) -> Result<usize>;
}

/// libSQL implementation of `OAuthRepository`
#[derive(Clone)]
pub struct LibSqlOAuthRepository {
    conn: Connection,
}

impl LibSqlOAuthRepository {
    /// Create a new repository with the given connection
    pub fn new(conn: &Connection) -> Self {
        Self { conn: conn.clone() }
    }
}

fn join_scopes(scopes: &[String]) -> String {
    scopes.join(" ")
}

fn split_scopes(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_string).collect()
}

#[async_trait]
impl OAuthRepository for LibSqlOAuthRepository {
    async fn get_token(&self, provider_id: &str) -> Result<Option<StoredToken>> {
        let mut rows = self
            .conn
            .query(
                "SELECT provider_id, access_token, refresh_token, expires_at, scopes, stored_at
                 FROM oauth_tokens WHERE provider_id = ?",
                params![provider_id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => {
                let scopes: String = row.get(4)?;
                Ok(Some(StoredToken {
                    provider_id: row.get(0)?,
                    access_token: row.get(1)?,
                    refresh_token: row.get(2)?,
                    expires_at: row.get(3)?,
                    scopes: split_scopes(&scopes),
                    stored_at: row.get(5)?,
                }))
            }
            None => Ok(None),
        }
    }

    async fn put_token(&self, token: &StoredToken) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO oauth_tokens
                     (provider_id, access_token, refresh_token, expires_at, scopes, stored_at)
                 VALUES (?, ?, ?, ?, ?, ?)
                 ON CONFLICT(provider_id) DO UPDATE SET
                     access_token = excluded.access_token,
                     refresh_token = excluded.refresh_token,
                     expires_at = excluded.expires_at,
                     scopes = excluded.scopes,
                     stored_at = excluded.stored_at",
                params![
                    token.provider_id.as_str(),
                    token.access_token.as_str(),
                    token.refresh_token.clone(),
                    token.expires_at,
                    join_scopes(&token.scopes),
                    token.stored_at,
                ],
            )
            .await?;
        Ok(())
    }

    async fn delete_token(&self, provider_id: &str) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM oauth_tokens WHERE provider_id = ?",
                params![provider_id],
            )
            .await?;
        Ok(())
    }

    async fn get_consent(
        &self,
        app_id: &AppId,
        provider_id: &str,
    ) -> Result<Option<ConsentRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT app_id, provider_id, consented_at, scopes
                 FROM consents WHERE app_id = ? AND provider_id = ?",
                params![app_id.as_str(), provider_id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => {
                let app: String = row.get(0)?;
                let scopes: String = row.get(3)?;
                Ok(Some(ConsentRecord {
                    app_id: app
                        .parse()
                        .map_err(|_| crate::error::Error::Database(format!("invalid app id: {app}")))?,
                    provider_id: row.get(1)?,
                    consented_at: row.get(2)?,
                    scopes: split_scopes(&scopes),
                }))
            }
            None => Ok(None),
        }
    }

    async fn put_consent(&self, consent: &ConsentRecord) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO consents (app_id, provider_id, consented_at, scopes)
                 VALUES (?, ?, ?, ?)
                 ON CONFLICT(app_id, provider_id) DO UPDATE SET
                     consented_at = excluded.consented_at,
                     scopes = excluded.scopes",
                params![
                    consent.app_id.as_str(),
                    consent.provider_id.as_str(),
                    consent.consented_at,
                    join_scopes(&consent.scopes),
                ],
            )
            .await?;
        Ok(())
    }

    async fn revoke_consent(&self, app_id: &AppId, provider_id: &str) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM consents WHERE app_id = ? AND provider_id = ?",
                params![app_id.as_str(), provider_id],
            )
            .await?;
        Ok(())
    }

    async fn insert_pending(&self, pending: &PendingAuthorization) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO pending_authorizations (state, provider_id, initiated_at)
                 VALUES (?, ?, ?)",
                params![
                    pending.state.as_str(),
                    pending.provider_id.as_str(),
                    pending.initiated_at,
                ],
            )
            .await?;
        Ok(())
    }

    async fn consume_pending(&self, state: &str) -> Result<Option<PendingAuthorization>> {
        let mut rows = self
            .conn
            .query(
                "DELETE FROM pending_authorizations WHERE state = ?
                 RETURNING state, provider_id, initiated_at",
                params![state],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(PendingAuthorization {
                state: row.get(0)?,
                provider_id: row.get(1)?,
                initiated_at: row.get(2)?,
            })),
            None => Ok(None),
        }
    }

    async fn gc_pending(&self, cutoff_seconds: i64) -> Result<usize> {
        let removed = self
            .conn
            .execute(
                "DELETE FROM pending_authorizations WHERE initiated_at < ?",
                params![cutoff_seconds],
            )
            .await?;
        Ok(usize::try_from(removed).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::util::unix_timestamp_now;
    use pretty_assertions::assert_eq;

    async fn repo() -> (Database, LibSqlOAuthRepository) {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlOAuthRepository::new(db.connection());
        (db, repo)
    }

    fn token(provider: &str) -> StoredToken {
        StoredToken {
            provider_id: provider.to_string(),
            access_token: "access".to_string(),
            refresh_token: Some("refresh".to_string()),
            expires_at: Some(unix_timestamp_now() + 3600),
            scopes: vec!["repo".to_string(), "user".to_string()],
            stored_at: unix_timestamp_now(),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn token_round_trip_preserves_scopes() {
        let (_db, repo) = repo().await;
        let stored = token("github");
        repo.put_token(&stored).await.unwrap();

        let loaded = repo.get_token("github").await.unwrap().unwrap();
        assert_eq!(loaded, stored);
        assert!(repo.get_token("notion").await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn put_token_replaces_existing() {
        let (_db, repo) = repo().await;
        repo.put_token(&token("github")).await.unwrap();

        let mut updated = token("github");
        updated.access_token = "rotated".to_string();
        repo.put_token(&updated).await.unwrap();

        let loaded = repo.get_token("github").await.unwrap().unwrap();
        assert_eq!(loaded.access_token, "rotated");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn consent_is_app_scoped() {
        let (_db, repo) = repo().await;
        let app_a = AppId::new();
        let app_b = AppId::new();

        repo.put_consent(&ConsentRecord {
            app_id: app_a,
            provider_id: "github".to_string(),
            consented_at: unix_timestamp_now(),
            scopes: vec!["repo".to_string()],
        })
        .await
        .unwrap();

        assert!(repo.get_consent(&app_a, "github").await.unwrap().is_some());
        assert!(repo.get_consent(&app_b, "github").await.unwrap().is_none());

        repo.revoke_consent(&app_a, "github").await.unwrap();
        assert!(repo.get_consent(&app_a, "github").await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pending_authorization_consumed_exactly_once() {
        let (_db, repo) = repo().await;
        let pending = PendingAuthorization {
            state: "nonce-1".to_string(),
            provider_id: "github".to_string(),
            initiated_at: unix_timestamp_now(),
        };
        repo.insert_pending(&pending).await.unwrap();

        let consumed = repo.consume_pending("nonce-1").await.unwrap();
        assert_eq!(consumed, Some(pending));
        assert!(repo.consume_pending("nonce-1").await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn gc_pending_removes_only_old_entries() {
        let (_db, repo) = repo().await;
        let now = unix_timestamp_now();

        repo.insert_pending(&PendingAuthorization {
            state: "old".to_string(),
            provider_id: "github".to_string(),
            initiated_at: now - 3600,
        })
        .await
        .unwrap();
        repo.insert_pending(&PendingAuthorization {
            state: "fresh".to_string(),
            provider_id: "github".to_string(),
            initiated_at: now,
        })
        .await
        .unwrap();

        let removed = repo.gc_pending(now - 600).await.unwrap();
        assert_eq!(removed, 1);
        assert!(repo.consume_pending("old").await.unwrap().is_none());
        assert!(repo.consume_pending("fresh").await.unwrap().is_some());
    }
}

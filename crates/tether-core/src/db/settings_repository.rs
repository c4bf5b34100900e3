//! Per-app settings storage

use async_trait::async_trait;
use libsql::{params, Connection};

use crate::error::Result;
use crate::models::AppId;

/// Trait for per-app local settings.
///
/// An app marked offline is local-only: its resources never reconcile with
/// the hub, regardless of available credentials.
#[async_trait]
pub trait AppSettingsRepository: Send + Sync {
    /// Whether the app is in local-only mode
    async fn is_offline(&self, app_id: &AppId) -> Result<bool>;

    /// Set the app's local-only flag
    async fn set_offline(&self, app_id: &AppId, offline: bool) -> Result<()>;
}

/// libSQL implementation of `AppSettingsRepository`
#[derive(Clone)]
pub struct LibSqlAppSettingsRepository {
    conn: Connection,
}

impl LibSqlAppSettingsRepository {
    /// Create a new repository with the given connection
    pub fn new(conn: &Connection) -> Self {
        Self { conn: conn.clone() }
    }
}

#[async_trait]
impl AppSettingsRepository for LibSqlAppSettingsRepository {
    async fn is_offline(&self, app_id: &AppId) -> Result<bool> {
        let mut rows = self
            .conn
            .query(
                "SELECT offline FROM app_settings WHERE app_id = ?",
                params![app_id.as_str()],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(row.get::<i32>(0)? != 0),
            None => Ok(false),
        }
    }

    async fn set_offline(&self, app_id: &AppId, offline: bool) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO app_settings (app_id, offline) VALUES (?, ?)
                 ON CONFLICT(app_id) DO UPDATE SET offline = excluded.offline",
                params![app_id.as_str(), i32::from(offline)],
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[tokio::test(flavor = "multi_thread")]
    async fn offline_flag_defaults_to_false_and_round_trips() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlAppSettingsRepository::new(db.connection());
        let app = AppId::new();

        assert!(!repo.is_offline(&app).await.unwrap());

        repo.set_offline(&app, true).await.unwrap();
        assert!(repo.is_offline(&app).await.unwrap());

        repo.set_offline(&app, false).await.unwrap();
        assert!(!repo.is_offline(&app).await.unwrap());
    }
}

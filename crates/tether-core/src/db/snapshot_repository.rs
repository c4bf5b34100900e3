//! Resource snapshot repository implementation

use async_trait::async_trait;
use libsql::{params, Connection};

use crate::error::{Error, Result};
use crate::models::{AppId, ResourceId, ResourceSnapshot, SyncConflict};

/// Trait for the durable resource snapshot cache
#[async_trait]
pub trait SnapshotRepository: Send + Sync {
    /// Get a cached snapshot by resource ID
    async fn get(&self, id: &ResourceId) -> Result<Option<ResourceSnapshot>>;

    /// Insert or overwrite a snapshot
    async fn put(&self, snapshot: &ResourceSnapshot) -> Result<()>;

    /// Remove a snapshot from the cache
    async fn delete(&self, id: &ResourceId) -> Result<()>;

    /// List all cached snapshots for an app, newest first
    async fn list_by_app(&self, app_id: &AppId) -> Result<Vec<ResourceSnapshot>>;

    /// Record a conflict resolved by overwriting diverged local state
    async fn record_conflict(
        &self,
        resource_id: &ResourceId,
        local_updated_at: i64,
        remote_updated_at: i64,
        strategy: &str,
    ) -> Result<()>;

    /// List recorded conflicts for a resource, newest first
    async fn list_conflicts(&self, resource_id: &ResourceId) -> Result<Vec<SyncConflict>>;
}

/// libSQL implementation of `SnapshotRepository`
#[derive(Clone)]
pub struct LibSqlSnapshotRepository {
    conn: Connection,
}

impl LibSqlSnapshotRepository {
    /// Create a new repository with the given connection
    pub fn new(conn: &Connection) -> Self {
        Self { conn: conn.clone() }
    }

    fn parse_snapshot(row: &libsql::Row) -> Result<ResourceSnapshot> {
        let id: String = row.get(0)?;
        let app_id: String = row.get(1)?;
        let kind: String = row.get(2)?;
        let version: Option<String> = row.get(3)?;
        let updated_at: i64 = row.get(4)?;
        let body: String = row.get(5)?;

        Ok(ResourceSnapshot {
            id: id
                .parse()
                .map_err(|_| Error::Database(format!("invalid resource id: {id}")))?,
            app_id: app_id
                .parse()
                .map_err(|_| Error::Database(format!("invalid app id: {app_id}")))?,
            kind: kind.parse().map_err(Error::Database)?,
            version: version.as_deref().map(str::parse).transpose().map_err(Error::Database)?,
            updated_at,
            body: serde_json::from_str(&body)?,
        })
    }
}

#[async_trait]
impl SnapshotRepository for LibSqlSnapshotRepository {
    async fn get(&self, id: &ResourceId) -> Result<Option<ResourceSnapshot>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, app_id, kind, version, updated_at, body
                 FROM snapshots WHERE id = ?",
                params![id.as_str()],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(Self::parse_snapshot(&row)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, snapshot: &ResourceSnapshot) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO snapshots (id, app_id, kind, version, updated_at, body)
                 VALUES (?, ?, ?, ?, ?, ?)
                 ON CONFLICT(id) DO UPDATE SET
                     app_id = excluded.app_id,
                     kind = excluded.kind,
                     version = excluded.version,
                     updated_at = excluded.updated_at,
                     body = excluded.body",
                params![
                    snapshot.id.as_str(),
                    snapshot.app_id.as_str(),
                    snapshot.kind.as_str(),
                    snapshot.version.map(|version| version.to_string()),
                    snapshot.updated_at,
                    serde_json::to_string(&snapshot.body)?,
                ],
            )
            .await?;
        Ok(())
    }

    async fn delete(&self, id: &ResourceId) -> Result<()> {
        self.conn
            .execute("DELETE FROM snapshots WHERE id = ?", params![id.as_str()])
            .await?;
        Ok(())
    }

    async fn list_by_app(&self, app_id: &AppId) -> Result<Vec<ResourceSnapshot>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, app_id, kind, version, updated_at, body
                 FROM snapshots WHERE app_id = ?
                 ORDER BY updated_at DESC",
                params![app_id.as_str()],
            )
            .await?;

        let mut snapshots = Vec::new();
        while let Some(row) = rows.next().await? {
            snapshots.push(Self::parse_snapshot(&row)?);
        }
        Ok(snapshots)
    }

    async fn record_conflict(
        &self,
        resource_id: &ResourceId,
        local_updated_at: i64,
        remote_updated_at: i64,
        strategy: &str,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO sync_conflicts
                     (resource_id, local_updated_at, remote_updated_at, resolved_at, strategy)
                 VALUES (?, ?, ?, ?, ?)",
                params![
                    resource_id.as_str(),
                    local_updated_at,
                    remote_updated_at,
                    crate::util::unix_timestamp_millis_now(),
                    strategy,
                ],
            )
            .await?;
        Ok(())
    }

    async fn list_conflicts(&self, resource_id: &ResourceId) -> Result<Vec<SyncConflict>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, resource_id, local_updated_at, remote_updated_at, resolved_at, strategy
                 FROM sync_conflicts WHERE resource_id = ?
                 ORDER BY resolved_at DESC",
                params![resource_id.as_str()],
            )
            .await?;

        let mut conflicts = Vec::new();
        while let Some(row) = rows.next().await? {
            conflicts.push(SyncConflict {
                id: row.get(0)?,
                resource_id: row.get(1)?,
                local_updated_at: row.get(2)?,
                remote_updated_at: row.get(3)?,
                resolved_at: row.get(4)?,
                strategy: row.get(5)?,
            });
        }
        Ok(conflicts)
    }
}

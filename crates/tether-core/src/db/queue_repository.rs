//! Offline command queue repository implementation

use async_trait::async_trait;
use libsql::{params, Connection};

use crate::error::{Error, Result};
use crate::models::{AppId, CommandId, OfflineCommand, ResourceId};

/// Trait for the durable offline mutation queue.
///
/// The queue is strictly FIFO per `(app_id, resource_id)` pair: appends go
/// to the tail, replay reads from the head.
#[async_trait]
pub trait CommandQueueRepository: Send + Sync {
    /// Append a command batch to the queue
    async fn enqueue(&self, command: &OfflineCommand) -> Result<()>;

    /// List queued commands for a resource, oldest first
    async fn list_by_key(
        &self,
        app_id: &AppId,
        resource_id: &ResourceId,
    ) -> Result<Vec<OfflineCommand>>;

    /// Remove a command from the queue
    async fn delete(&self, command_id: &CommandId) -> Result<()>;

    /// Number of queued commands for a resource
    async fn len(&self, app_id: &AppId, resource_id: &ResourceId) -> Result<usize>;
}

/// libSQL implementation of `CommandQueueRepository`
#[derive(Clone)]
pub struct LibSqlCommandQueueRepository {
    conn: Connection,
}

impl LibSqlCommandQueueRepository {
    /// Create a new repository with the given connection
    pub fn new(conn: &Connection) -> Self {
        Self { conn: conn.clone() }
    }

    fn parse_command(row: &libsql::Row) -> Result<OfflineCommand> {
        let id: String = row.get(0)?;
        let app_id: String = row.get(1)?;
        let resource_id: String = row.get(2)?;
        let payload: String = row.get(3)?;
        let created_at: i64 = row.get(4)?;

        Ok(OfflineCommand {
            command_id: id
                .parse()
                .map_err(|_| Error::Database(format!("invalid command id: {id}")))?,
            app_id: app_id
                .parse()
                .map_err(|_| Error::Database(format!("invalid app id: {app_id}")))?,
            resource_id: resource_id
                .parse()
                .map_err(|_| Error::Database(format!("invalid resource id: {resource_id}")))?,
            payload: serde_json::from_str(&payload)?,
            created_at,
        })
    }
}

#[async_trait]
impl CommandQueueRepository for LibSqlCommandQueueRepository {
    async fn enqueue(&self, command: &OfflineCommand) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO offline_commands (id, app_id, resource_id, payload, created_at)
                 VALUES (?, ?, ?, ?, ?)",
                params![
                    command.command_id.as_str(),
                    command.app_id.as_str(),
                    command.resource_id.as_str(),
                    serde_json::to_string(&command.payload)?,
                    command.created_at,
                ],
            )
            .await?;
        Ok(())
    }

    async fn list_by_key(
        &self,
        app_id: &AppId,
        resource_id: &ResourceId,
    ) -> Result<Vec<OfflineCommand>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, app_id, resource_id, payload, created_at
                 FROM offline_commands
                 WHERE app_id = ? AND resource_id = ?
                 ORDER BY created_at ASC",
                params![app_id.as_str(), resource_id.as_str()],
            )
            .await?;

        let mut commands = Vec::new();
        while let Some(row) = rows.next().await? {
            commands.push(Self::parse_command(&row)?);
        }
        Ok(commands)
    }

    async fn delete(&self, command_id: &CommandId) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM offline_commands WHERE id = ?",
                params![command_id.as_str()],
            )
            .await?;
        Ok(())
    }

    async fn len(&self, app_id: &AppId, resource_id: &ResourceId) -> Result<usize> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM offline_commands WHERE app_id = ? AND resource_id = ?",
                params![app_id.as_str(), resource_id.as_str()],
            )
            .await?;

        let count: i64 = match rows.next().await? {
            Some(row) => row.get(0)?,
            None => 0,
        };
        Ok(usize::try_from(count).unwrap_or(0))
    }
}

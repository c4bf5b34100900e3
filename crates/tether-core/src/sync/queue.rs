//! Optimistic command execution and offline replay.

use std::sync::Arc;

use crate::db::{CommandQueueRepository, SnapshotRepository};
use crate::error::Error;
use crate::events::{EngineEvent, EventBus};
use crate::models::{AppId, CommandPayload, OfflineCommand, ResourceId, ResourceSnapshot};
use crate::remote::RemoteStore;
use crate::util::unix_timestamp_millis_now;

use super::SyncResult;

/// Result of one replay pass over a resource's queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushOutcome {
    /// Commands successfully delivered to the hub
    pub replayed: usize,
    /// Stale commands discarded without transmission
    pub dropped: usize,
}

/// Applies mutations locally first and falls back to the durable queue when
/// the hub push fails.
pub struct CommandQueue<R: RemoteStore> {
    snapshots: Arc<dyn SnapshotRepository>,
    repo: Arc<dyn CommandQueueRepository>,
    remote: Arc<R>,
    bus: EventBus,
}

impl<R: RemoteStore> CommandQueue<R> {
    pub fn new(
        snapshots: Arc<dyn SnapshotRepository>,
        repo: Arc<dyn CommandQueueRepository>,
        remote: Arc<R>,
        bus: EventBus,
    ) -> Self {
        Self {
            snapshots,
            repo,
            remote,
            bus,
        }
    }

    /// Execute a single mutation against a resource.
    pub async fn execute_command(
        &self,
        app_id: &AppId,
        resource_id: &ResourceId,
        payload: CommandPayload,
    ) -> SyncResult<ResourceSnapshot> {
        self.execute_commands(app_id, resource_id, vec![payload]).await
    }

    /// Execute a mutation batch against a resource.
    ///
    /// The local snapshot is updated first, so the caller's next read sees
    /// the mutation even with no network. A failed hub push of any kind
    /// queues the batch for later replay; the operation still succeeds.
    pub async fn execute_commands(
        &self,
        app_id: &AppId,
        resource_id: &ResourceId,
        payloads: Vec<CommandPayload>,
    ) -> SyncResult<ResourceSnapshot> {
        let mut snapshot = self
            .snapshots
            .get(resource_id)
            .await?
            .ok_or_else(|| Error::NotFound(resource_id.to_string()))?;

        for payload in &payloads {
            payload.apply(&mut snapshot.body);
        }
        snapshot.updated_at = unix_timestamp_millis_now();
        self.snapshots.put(&snapshot).await?;

        if let Err(error) = self
            .remote
            .push_commands(app_id, resource_id, &payloads)
            .await
        {
            tracing::warn!(%error, %resource_id, "hub push failed; queueing commands for replay");
            self.repo
                .enqueue(&OfflineCommand::new(*app_id, *resource_id, payloads))
                .await?;
        }

        Ok(snapshot)
    }

    /// Replay queued commands for a resource, oldest first.
    ///
    /// Stale commands (older than seven days) are removed without being
    /// sent. A failed push stops the pass and leaves the failed command and
    /// everything behind it queued for the next reconciliation.
    pub async fn flush_due(
        &self,
        app_id: &AppId,
        resource_id: &ResourceId,
    ) -> SyncResult<FlushOutcome> {
        let commands = self.repo.list_by_key(app_id, resource_id).await?;
        let now = unix_timestamp_millis_now();
        let mut outcome = FlushOutcome::default();

        for command in commands {
            if command.is_stale(now) {
                tracing::info!(
                    command_id = %command.command_id,
                    "dropping stale offline command without replay"
                );
                self.repo.delete(&command.command_id).await?;
                outcome.dropped += 1;
                continue;
            }

            match self
                .remote
                .push_commands(&command.app_id, &command.resource_id, &command.payload)
                .await
            {
                Ok(()) => {
                    self.repo.delete(&command.command_id).await?;
                    outcome.replayed += 1;
                }
                Err(error) => {
                    tracing::warn!(
                        %error,
                        command_id = %command.command_id,
                        "replay failed; leaving remaining commands queued"
                    );
                    break;
                }
            }
        }

        if outcome.replayed > 0 || outcome.dropped > 0 {
            self.bus.publish(EngineEvent::QueueFlushed {
                app_id: *app_id,
                resource_id: *resource_id,
                replayed: outcome.replayed,
                dropped: outcome.dropped,
            });
        }

        Ok(outcome)
    }

    /// Number of commands still queued for a resource
    pub async fn pending(&self, app_id: &AppId, resource_id: &ResourceId) -> SyncResult<usize> {
        Ok(self.repo.len(app_id, resource_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Database, LibSqlCommandQueueRepository, LibSqlSnapshotRepository};
    use crate::models::{ResourceKind, COMMAND_MAX_AGE_MS};
    use crate::sync::testing::RecordingRemote;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    async fn setup(remote: RecordingRemote) -> (Database, CommandQueue<RecordingRemote>) {
        let db = Database::open_in_memory().await.unwrap();
        let queue = CommandQueue::new(
            Arc::new(LibSqlSnapshotRepository::new(db.connection())),
            Arc::new(LibSqlCommandQueueRepository::new(db.connection())),
            Arc::new(remote),
            EventBus::new(),
        );
        (db, queue)
    }

    async fn seed_board(db: &Database) -> ResourceSnapshot {
        let repo = LibSqlSnapshotRepository::new(db.connection());
        let snapshot = ResourceSnapshot::new(
            AppId::new(),
            ResourceKind::Board,
            json!({"name": "Inbox", "nodes": {}}),
        );
        repo.put(&snapshot).await.unwrap();
        snapshot
    }

    fn rename(name: &str) -> CommandPayload {
        CommandPayload::Rename {
            name: name.to_string(),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn local_write_survives_remote_failure() {
        let (db, queue) = setup(RecordingRemote::offline()).await;
        let board = seed_board(&db).await;

        let updated = queue
            .execute_command(&board.app_id, &board.id, rename("Renamed"))
            .await
            .unwrap();
        assert_eq!(updated.body["name"], "Renamed");

        // the mutation is immediately readable locally
        let repo = LibSqlSnapshotRepository::new(db.connection());
        let local = repo.get(&board.id).await.unwrap().unwrap();
        assert_eq!(local.body["name"], "Renamed");

        // and queued for replay
        assert_eq!(queue.pending(&board.app_id, &board.id).await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn successful_push_does_not_enqueue() {
        let (db, queue) = setup(RecordingRemote::new()).await;
        let board = seed_board(&db).await;

        queue
            .execute_command(&board.app_id, &board.id, rename("Online"))
            .await
            .unwrap();
        assert_eq!(queue.pending(&board.app_id, &board.id).await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn execute_on_missing_resource_fails() {
        let (_db, queue) = setup(RecordingRemote::new()).await;
        let result = queue
            .execute_command(&AppId::new(), &ResourceId::new(), rename("nope"))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn flush_replays_in_creation_order() {
        let remote = RecordingRemote::offline();
        let (db, queue) = setup(remote.clone()).await;
        let board = seed_board(&db).await;

        queue
            .execute_command(&board.app_id, &board.id, rename("first"))
            .await
            .unwrap();
        queue
            .execute_command(&board.app_id, &board.id, rename("second"))
            .await
            .unwrap();

        remote.set_online(true);
        let outcome = queue.flush_due(&board.app_id, &board.id).await.unwrap();
        assert_eq!(outcome, FlushOutcome { replayed: 2, dropped: 0 });
        assert_eq!(queue.pending(&board.app_id, &board.id).await.unwrap(), 0);

        let pushed = remote.pushed_payloads();
        assert_eq!(pushed.len(), 2);
        assert_eq!(pushed[0], vec![rename("first")]);
        assert_eq!(pushed[1], vec![rename("second")]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn flush_stops_on_failure_and_keeps_remainder() {
        let remote = RecordingRemote::offline();
        let (db, queue) = setup(remote.clone()).await;
        let board = seed_board(&db).await;

        queue
            .execute_command(&board.app_id, &board.id, rename("first"))
            .await
            .unwrap();
        queue
            .execute_command(&board.app_id, &board.id, rename("second"))
            .await
            .unwrap();

        // still offline: nothing replays, everything stays queued
        let outcome = queue.flush_due(&board.app_id, &board.id).await.unwrap();
        assert_eq!(outcome, FlushOutcome::default());
        assert_eq!(queue.pending(&board.app_id, &board.id).await.unwrap(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stale_commands_are_dropped_not_sent() {
        let remote = RecordingRemote::new();
        let (db, queue) = setup(remote.clone()).await;
        let board = seed_board(&db).await;

        let queue_repo = LibSqlCommandQueueRepository::new(db.connection());
        let mut stale = OfflineCommand::new(board.app_id, board.id, vec![rename("ancient")]);
        stale.created_at = unix_timestamp_millis_now() - COMMAND_MAX_AGE_MS - 1_000;
        queue_repo.enqueue(&stale).await.unwrap();

        let fresh = OfflineCommand::new(board.app_id, board.id, vec![rename("fresh")]);
        queue_repo.enqueue(&fresh).await.unwrap();

        let outcome = queue.flush_due(&board.app_id, &board.id).await.unwrap();
        assert_eq!(outcome, FlushOutcome { replayed: 1, dropped: 1 });
        assert_eq!(queue.pending(&board.app_id, &board.id).await.unwrap(), 0);

        let pushed = remote.pushed_payloads();
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0], vec![rename("fresh")]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn flush_publishes_queue_flushed_event() {
        let remote = RecordingRemote::offline();
        let (db, queue) = setup(remote.clone()).await;
        let board = seed_board(&db).await;
        let mut subscription = queue.bus.subscribe();

        queue
            .execute_command(&board.app_id, &board.id, rename("queued"))
            .await
            .unwrap();

        remote.set_online(true);
        queue.flush_due(&board.app_id, &board.id).await.unwrap();

        let event = subscription.recv().await.unwrap();
        assert_eq!(
            event,
            EngineEvent::QueueFlushed {
                app_id: board.app_id,
                resource_id: board.id,
                replayed: 1,
                dropped: 0,
            }
        );
    }
}

//! Read-through resource cache with background reconciliation.

use std::sync::Arc;

use crate::db::{AppSettingsRepository, SnapshotRepository};
use crate::error::Result;
use crate::events::{EngineEvent, EventBus};
use crate::models::{AppId, ResourceId, ResourceKind, ResourceSnapshot, Version};
use crate::remote::RemoteStore;

use super::diff::values_equal;
use super::queue::CommandQueue;
use super::task::{CompletionHandle, TaskKey, TaskTracker};
use super::SyncResult;

/// Identity of one cached resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotKey {
    pub app_id: AppId,
    pub resource_id: ResourceId,
    pub kind: ResourceKind,
}

impl SnapshotKey {
    #[must_use]
    pub const fn new(app_id: AppId, resource_id: ResourceId, kind: ResourceKind) -> Self {
        Self {
            app_id,
            resource_id,
            kind,
        }
    }

    fn task_args(&self) -> String {
        format!("{}/{}/{}", self.app_id, self.kind, self.resource_id)
    }
}

/// Per-read options.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions {
    /// Explicit immutable revision; pinned reads never reconcile and the
    /// cached snapshot is never overwritten on their behalf
    pub pinned: Option<Version>,
    /// Whether the caller holds an authenticated session; without one no
    /// background refresh is scheduled
    pub background_refresh: bool,
}

impl ReadOptions {
    /// Options for an authenticated caller with no pinned version
    #[must_use]
    pub const fn fresh() -> Self {
        Self {
            pinned: None,
            background_refresh: true,
        }
    }
}

/// What a read returned.
pub struct ReadOutcome {
    /// The local snapshot, possibly stale, possibly absent
    pub snapshot: Option<ResourceSnapshot>,
    /// Handle onto the scheduled (or joined) background reconciliation, when
    /// one is in flight for this key
    pub reconciliation: Option<CompletionHandle>,
}

/// Serves reads from the local store and reconciles against the hub in the
/// background, at most once per key at a time.
pub struct Synchronizer<R: RemoteStore + 'static> {
    snapshots: Arc<dyn SnapshotRepository>,
    settings: Arc<dyn AppSettingsRepository>,
    queue: Arc<CommandQueue<R>>,
    remote: Arc<R>,
    tasks: TaskTracker,
    bus: EventBus,
}

impl<R: RemoteStore + 'static> Synchronizer<R> {
    pub fn new(
        snapshots: Arc<dyn SnapshotRepository>,
        settings: Arc<dyn AppSettingsRepository>,
        queue: Arc<CommandQueue<R>>,
        remote: Arc<R>,
        bus: EventBus,
    ) -> Self {
        Self {
            snapshots,
            settings,
            queue,
            remote,
            tasks: TaskTracker::new(),
            bus,
        }
    }

    /// Read a resource.
    ///
    /// The local snapshot is returned immediately; the caller is never
    /// blocked on network I/O. When eligible, a background reconciliation is
    /// scheduled for the key; a second read for the same key while one is in
    /// flight joins it instead of issuing a duplicate remote call.
    pub async fn read(&self, key: SnapshotKey, options: ReadOptions) -> Result<ReadOutcome> {
        let snapshot = self.snapshots.get(&key.resource_id).await?;

        // Pinned reads are immutable artifacts: no reconciliation, ever.
        if options.pinned.is_some() {
            return Ok(ReadOutcome {
                snapshot,
                reconciliation: None,
            });
        }

        if !options.background_refresh {
            return Ok(ReadOutcome {
                snapshot,
                reconciliation: None,
            });
        }

        // Offline apps are local-only regardless of available credentials.
        if self.settings.is_offline(&key.app_id).await? {
            return Ok(ReadOutcome {
                snapshot,
                reconciliation: None,
            });
        }

        let reconciliation = Some(self.schedule_reconcile(key));
        Ok(ReadOutcome {
            snapshot,
            reconciliation,
        })
    }

    /// Number of reconciliation tasks currently in flight
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.tasks.in_flight()
    }

    fn schedule_reconcile(&self, key: SnapshotKey) -> CompletionHandle {
        let task_key = TaskKey::new("reconcile_snapshot", key.task_args());
        let snapshots = Arc::clone(&self.snapshots);
        let queue = Arc::clone(&self.queue);
        let remote = Arc::clone(&self.remote);
        let bus = self.bus.clone();

        let (handle, started) = self.tasks.spawn(task_key, async move {
            // Errors never escape the task: the synchronous caller already
            // holds a valid (possibly stale) local value.
            if let Err(error) = reconcile(&snapshots, &queue, &remote, &bus, key).await {
                tracing::warn!(%error, resource_id = %key.resource_id, "background reconciliation failed");
            }
        });

        if !started {
            tracing::debug!(
                resource_id = %key.resource_id,
                "reconciliation already in flight; joining existing task"
            );
        }
        handle
    }
}

async fn reconcile<R: RemoteStore>(
    snapshots: &Arc<dyn SnapshotRepository>,
    queue: &CommandQueue<R>,
    remote: &Arc<R>,
    bus: &EventBus,
    key: SnapshotKey,
) -> SyncResult<()> {
    // Deliver pending local mutations before pulling the canonical state,
    // so the fetch reflects them.
    queue.flush_due(&key.app_id, &key.resource_id).await?;

    let remote_snapshot = match remote
        .fetch_snapshot(&key.app_id, &key.resource_id, key.kind)
        .await
    {
        Ok(snapshot) => snapshot,
        Err(error) if error.is_offline() => {
            tracing::debug!(resource_id = %key.resource_id, "hub unreachable; skipping reconciliation");
            bus.publish(EngineEvent::SyncStateChanged(crate::state::SyncState::Offline));
            return Ok(());
        }
        Err(error) => return Err(error.into()),
    };

    let local = snapshots.get(&key.resource_id).await?;

    // A locally cached pinned artifact is immutable.
    if local.as_ref().is_some_and(|snapshot| snapshot.version.is_some()) {
        tracing::debug!(resource_id = %key.resource_id, "local snapshot is pinned; not overwriting");
        return Ok(());
    }

    let changed = match &local {
        Some(local) => !values_equal(&local.body, &remote_snapshot.body),
        None => true,
    };

    if changed {
        if let Some(local) = &local {
            snapshots
                .record_conflict(
                    &key.resource_id,
                    local.updated_at,
                    remote_snapshot.updated_at,
                    "remote-wins",
                )
                .await?;
        }
        snapshots.put(&remote_snapshot).await?;
    }

    bus.publish(EngineEvent::SnapshotReconciled {
        resource_id: key.resource_id,
        changed,
    });
    bus.publish(EngineEvent::SyncStateChanged(crate::state::SyncState::Synced));
    Ok(())
}

//! Local-first synchronization engine: read-through caching, background
//! reconciliation, and the offline command queue.

mod diff;
mod queue;
mod synchronizer;
mod task;

pub use diff::{diff_paths, values_equal};
pub use queue::{CommandQueue, FlushOutcome};
pub use synchronizer::{ReadOptions, ReadOutcome, SnapshotKey, Synchronizer};
pub use task::{CompletionHandle, TaskKey, TaskTracker};

use thiserror::Error;

/// Errors surfaced by the sync engine's write paths.
///
/// Read paths absorb remote failures; only local-store errors escape them.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] crate::error::Error),
    #[error(transparent)]
    Hub(#[from] crate::remote::HubError),
}

pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
pub(crate) mod testing {
    //! Shared in-memory remote fake for sync tests.

    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::models::{AppId, CommandPayload, ResourceId, ResourceKind, ResourceSnapshot};
    use crate::remote::{HubError, HubResult, RemoteStore};

    #[derive(Default)]
    struct RemoteState {
        online: bool,
        snapshot: Option<ResourceSnapshot>,
        fetches: usize,
        pushes: Vec<Vec<CommandPayload>>,
        fetch_delay: Option<Duration>,
    }

    /// Scriptable `RemoteStore` that records every call.
    #[derive(Clone)]
    pub struct RecordingRemote {
        state: Arc<Mutex<RemoteState>>,
    }

    impl RecordingRemote {
        pub fn new() -> Self {
            Self {
                state: Arc::new(Mutex::new(RemoteState {
                    online: true,
                    ..RemoteState::default()
                })),
            }
        }

        pub fn offline() -> Self {
            Self {
                state: Arc::new(Mutex::new(RemoteState::default())),
            }
        }

        pub fn set_online(&self, online: bool) {
            self.state.lock().unwrap().online = online;
        }

        pub fn set_snapshot(&self, snapshot: ResourceSnapshot) {
            self.state.lock().unwrap().snapshot = Some(snapshot);
        }

        pub fn set_fetch_delay(&self, delay: Duration) {
            self.state.lock().unwrap().fetch_delay = Some(delay);
        }

        pub fn fetch_count(&self) -> usize {
            self.state.lock().unwrap().fetches
        }

        pub fn pushed_payloads(&self) -> Vec<Vec<CommandPayload>> {
            self.state.lock().unwrap().pushes.clone()
        }
    }

    #[async_trait]
    impl RemoteStore for RecordingRemote {
        async fn fetch_snapshot(
            &self,
            _app_id: &AppId,
            resource_id: &ResourceId,
            _kind: ResourceKind,
        ) -> HubResult<ResourceSnapshot> {
            let delay = {
                let mut state = self.state.lock().unwrap();
                state.fetches += 1;
                if !state.online {
                    return Err(HubError::Offline("remote fake is offline".to_string()));
                }
                state.fetch_delay
            };
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            self.state
                .lock()
                .unwrap()
                .snapshot
                .clone()
                .ok_or_else(|| HubError::Api(format!("no remote snapshot for {resource_id}")))
        }

        async fn push_commands(
            &self,
            _app_id: &AppId,
            _resource_id: &ResourceId,
            payload: &[CommandPayload],
        ) -> HubResult<()> {
            let mut state = self.state.lock().unwrap();
            if !state.online {
                return Err(HubError::Offline("remote fake is offline".to_string()));
            }
            state.pushes.push(payload.to_vec());
            Ok(())
        }
    }
}

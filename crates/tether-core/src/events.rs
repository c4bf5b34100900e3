//! Typed publish/subscribe channel for engine notifications.
//!
//! Replaces ad-hoc callback-listener registries: consumers hold an explicit
//! `Subscription` handle and stop receiving when they drop it.

use tokio::sync::broadcast;

use crate::models::{AppId, ResourceId};
use crate::state::SyncState;

const CHANNEL_CAPACITY: usize = 256;

/// Notifications published by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// Background reconciliation finished for a resource
    SnapshotReconciled {
        resource_id: ResourceId,
        changed: bool,
    },
    /// Queued offline commands were replayed for a resource
    QueueFlushed {
        app_id: AppId,
        resource_id: ResourceId,
        replayed: usize,
        dropped: usize,
    },
    /// An OAuth redirect callback arrived out-of-band
    OAuthCallback { state: String, code: String },
    /// The engine's connectivity state changed
    SyncStateChanged(SyncState),
}

/// Broadcast channel for `EngineEvent`s.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    ///
    /// Publishing with no subscribers is a no-op.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to engine events. Dropping the handle unsubscribes.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// An explicit subscription handle.
#[derive(Debug)]
pub struct Subscription {
    receiver: broadcast::Receiver<EngineEvent>,
}

impl Subscription {
    /// Receive the next event.
    ///
    /// Returns `None` when the bus is gone or the subscriber lagged past the
    /// channel capacity and missed messages beyond recovery.
    pub async fn recv(&mut self) -> Option<EngineEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "event subscriber lagged; dropping missed events");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

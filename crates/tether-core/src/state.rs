//! Shared cross-platform state types.

/// Unified sync state surfaced to UI consumers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    Offline,
    Syncing,
    Synced,
    Error,
}

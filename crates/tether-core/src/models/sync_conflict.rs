//! Sync conflict model

use serde::{Deserialize, Serialize};

/// Recorded sync conflict resolved by strategy (remote-wins)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConflict {
    /// Conflict row identifier
    pub id: i64,
    /// Resource involved in the conflict
    pub resource_id: String,
    /// Local snapshot's timestamp when the conflict occurred
    pub local_updated_at: i64,
    /// Remote snapshot's timestamp that overwrote it
    pub remote_updated_at: i64,
    /// Resolution timestamp (unix ms)
    pub resolved_at: i64,
    /// Resolution strategy name
    pub strategy: String,
}

//! Offline mutation commands

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::resource::{AppId, ResourceId};

/// Commands older than this are dropped on replay instead of transmitted.
pub const COMMAND_MAX_AGE_MS: i64 = 7 * 24 * 60 * 60 * 1000;

/// A unique identifier for a queued command, using UUID v7 (time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommandId(Uuid);

impl CommandId {
    /// Create a new unique command ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for CommandId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CommandId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// A single mutation applied to a resource document.
///
/// Payloads are applied locally first; the same payloads are pushed to the
/// hub, or queued for replay when the push fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandPayload {
    UpsertNode { node_id: String, node: Value },
    RemoveNode { node_id: String },
    UpsertVariable { variable_id: String, variable: Value },
    RemoveVariable { variable_id: String },
    Rename { name: String },
    UpsertMeta { meta: Value },
}

impl CommandPayload {
    /// Apply this mutation to a resource document in place.
    ///
    /// Missing intermediate objects are created; removal of an absent entry
    /// is a no-op.
    pub fn apply(&self, body: &mut Value) {
        if !body.is_object() {
            *body = Value::Object(Map::new());
        }
        let root = body.as_object_mut().expect("body coerced to object above");

        match self {
            Self::UpsertNode { node_id, node } => {
                section_mut(root, "nodes").insert(node_id.clone(), node.clone());
            }
            Self::RemoveNode { node_id } => {
                section_mut(root, "nodes").remove(node_id);
            }
            Self::UpsertVariable {
                variable_id,
                variable,
            } => {
                section_mut(root, "variables").insert(variable_id.clone(), variable.clone());
            }
            Self::RemoveVariable { variable_id } => {
                section_mut(root, "variables").remove(variable_id);
            }
            Self::Rename { name } => {
                root.insert("name".to_string(), Value::String(name.clone()));
            }
            Self::UpsertMeta { meta } => {
                root.insert("meta".to_string(), meta.clone());
            }
        }
    }
}

fn section_mut<'a>(root: &'a mut Map<String, Value>, key: &str) -> &'a mut Map<String, Value> {
    let entry = root
        .entry(key.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !entry.is_object() {
        *entry = Value::Object(Map::new());
    }
    entry.as_object_mut().expect("entry coerced to object above")
}

/// A mutation batch queued while the hub was unreachable.
///
/// Batches for the same `(app_id, resource_id)` pair replay in strict
/// creation order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineCommand {
    /// Unique identifier
    pub command_id: CommandId,
    /// App the target resource belongs to
    pub app_id: AppId,
    /// Target resource
    pub resource_id: ResourceId,
    /// Ordered mutation payloads
    pub payload: Vec<CommandPayload>,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
}

impl OfflineCommand {
    /// Create a new queued command batch
    #[must_use]
    pub fn new(app_id: AppId, resource_id: ResourceId, payload: Vec<CommandPayload>) -> Self {
        Self {
            command_id: CommandId::new(),
            app_id,
            resource_id,
            payload,
            created_at: crate::util::unix_timestamp_millis_now(),
        }
    }

    /// Whether this command is past the replay staleness threshold
    #[must_use]
    pub const fn is_stale(&self, now_ms: i64) -> bool {
        now_ms - self.created_at > COMMAND_MAX_AGE_MS
    }
}

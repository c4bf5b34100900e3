//! Workflow run events and metadata

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single event streamed while a workflow run executes.
///
/// The first event of any run is `RunInitiated`, carrying the run id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    RunInitiated {
        run_id: String,
    },
    Log {
        level: String,
        message: String,
    },
    Progress {
        percent: i32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        step: Option<String>,
    },
    Output {
        payload: Value,
    },
    Completed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    Failed {
        message: String,
    },
}

impl RunEvent {
    /// Whether this event terminates the run's event stream
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed { .. })
    }
}

/// Final status of a workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Completed,
    Failed,
    Cancelled,
}

/// Summary returned once a run's event stream closes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMeta {
    pub run_id: String,
    pub status: RunStatus,
    /// Start timestamp (Unix ms)
    pub started_at: i64,
    /// Completion timestamp (Unix ms)
    pub completed_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

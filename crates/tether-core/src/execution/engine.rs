//! Seam to the native workflow engine.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::models::{AppId, ResourceId, RunEvent, StoredToken};
use crate::remote::UploadCredentials;

use super::ExecutionResult;

/// Everything a local run needs: the event to fire, its payload, and the
/// credentials/tokens passed alongside.
#[derive(Debug, Clone)]
pub struct EngineInvocation {
    pub app_id: AppId,
    pub event_id: ResourceId,
    pub payload: Value,
    pub access_token: Option<String>,
    /// Third-party tokens keyed by provider id
    pub oauth_tokens: HashMap<String, StoredToken>,
    pub upload_credentials: Option<UploadCredentials>,
}

/// Opaque event source for local execution.
///
/// The engine emits ordered event batches; the first batch contains the
/// `run_initiated` event carrying the run identifier. The channel closing
/// ends the run.
#[async_trait]
pub trait NativeEngine: Send + Sync {
    async fn invoke(
        &self,
        invocation: EngineInvocation,
    ) -> ExecutionResult<mpsc::Receiver<Vec<RunEvent>>>;
}

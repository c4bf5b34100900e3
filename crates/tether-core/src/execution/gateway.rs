//! OAuth-gated execution with streamed run events.

use std::sync::Arc;

use futures::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::db::SnapshotRepository;
use crate::error::Error;
use crate::models::{ProviderRequirement, ResourceSnapshot, RunEvent, RunMeta, RunStatus};
use crate::oauth::OAuthGate;
use crate::remote::{AccessTokenProvider, RemoteRunner, TokenBroker};
use crate::sync::SnapshotKey;
use crate::util::unix_timestamp_millis_now;

use super::engine::{EngineInvocation, NativeEngine};
use super::stream::FrameBuffer;
use super::{ExecutionError, ExecutionResult};

/// Where a run executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Invoke the native engine in-process
    Local,
    /// Streamed HTTP call against the hub
    Remote,
}

/// Per-run options.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionOptions {
    pub mode: ExecutionMode,
    /// Set on re-invocation after the caller already drove the consent
    /// dialog for this attempt
    pub skip_consent_check: bool,
}

impl ExecutionOptions {
    #[must_use]
    pub const fn local() -> Self {
        Self {
            mode: ExecutionMode::Local,
            skip_consent_check: false,
        }
    }

    #[must_use]
    pub const fn remote() -> Self {
        Self {
            mode: ExecutionMode::Remote,
            skip_consent_check: false,
        }
    }
}

/// Runs workflow events after the OAuth gate clears them, relaying the run's
/// event stream back to the caller.
pub struct ExecutionGateway<B: TokenBroker, R: RemoteRunner> {
    snapshots: Arc<dyn SnapshotRepository>,
    gate: Arc<OAuthGate<B>>,
    remote: Arc<R>,
    engine: Arc<dyn NativeEngine>,
    auth: Arc<dyn AccessTokenProvider>,
}

impl<B: TokenBroker, R: RemoteRunner> ExecutionGateway<B, R> {
    pub fn new(
        snapshots: Arc<dyn SnapshotRepository>,
        gate: Arc<OAuthGate<B>>,
        remote: Arc<R>,
        engine: Arc<dyn NativeEngine>,
        auth: Arc<dyn AccessTokenProvider>,
    ) -> Self {
        Self {
            snapshots,
            gate,
            remote,
            engine,
            auth,
        }
    }

    /// Execute the event resource identified by `key`.
    ///
    /// The run identifier is surfaced via `on_run_id` exactly once; every
    /// event is forwarded verbatim to `on_event` until the stream closes.
    pub async fn execute(
        &self,
        key: SnapshotKey,
        payload: Value,
        options: ExecutionOptions,
        on_run_id: impl FnMut(&str) + Send,
        on_event: impl FnMut(&RunEvent) + Send,
    ) -> ExecutionResult<RunMeta> {
        let snapshot = self
            .snapshots
            .get(&key.resource_id)
            .await?
            .ok_or_else(|| Error::NotFound(key.resource_id.to_string()))?;

        let requirements = required_providers(&snapshot);
        let report = self
            .gate
            .require_satisfied(&key.app_id, &requirements, options.skip_consent_check)
            .await?;

        // Best-effort: most runs can proceed without upload credentials.
        let upload_credentials = match self.remote.upload_credentials(&key.app_id).await {
            Ok(credentials) => Some(credentials),
            Err(error) => {
                tracing::warn!(%error, "upload-credential pre-fetch failed; continuing without");
                None
            }
        };

        let mut relay = EventRelay::new(on_run_id, on_event);

        match options.mode {
            ExecutionMode::Local => {
                let oauth_tokens = self.gate.tokens_for(&report.satisfied).await?;
                let invocation = EngineInvocation {
                    app_id: key.app_id,
                    event_id: key.resource_id,
                    payload,
                    access_token: self.auth.access_token().await.ok(),
                    oauth_tokens,
                    upload_credentials,
                };

                let mut events = self.engine.invoke(invocation).await?;
                while let Some(batch) = events.recv().await {
                    relay.deliver_batch(batch);
                    if relay.is_closed() {
                        break;
                    }
                }
            }
            ExecutionMode::Remote => {
                let mut stream = self
                    .remote
                    .invoke_event(&key.app_id, &key.resource_id, &payload)
                    .await?;
                let cancel = CancellationToken::new();
                let mut frames = FrameBuffer::new();

                loop {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        chunk = stream.next() => match chunk {
                            None => break,
                            Some(Err(error)) => return Err(error.into()),
                            Some(Ok(bytes)) => {
                                for frame in frames.push(&bytes) {
                                    relay.deliver(frame.into_run_event()?);
                                }
                                // A completion or error record terminates the
                                // stream even if more bytes are pending.
                                if relay.is_closed() {
                                    cancel.cancel();
                                }
                            }
                        }
                    }
                }
                drop(stream);
            }
        }

        relay.finish()
    }
}

/// Providers a resource declares through its integrations list.
fn required_providers(snapshot: &ResourceSnapshot) -> Vec<ProviderRequirement> {
    snapshot
        .body
        .get("integrations")
        .cloned()
        .and_then(|raw| serde_json::from_value(raw).ok())
        .unwrap_or_default()
}

/// Forwards run events to the caller with exactly-once run-id delivery and
/// idempotent shutdown.
struct EventRelay<FR, FE>
where
    FR: FnMut(&str),
    FE: FnMut(&RunEvent),
{
    on_run_id: FR,
    on_event: FE,
    run_id: Option<String>,
    closed: bool,
    status: Option<RunStatus>,
    error: Option<String>,
    started_at: i64,
}

impl<FR, FE> EventRelay<FR, FE>
where
    FR: FnMut(&str),
    FE: FnMut(&RunEvent),
{
    fn new(on_run_id: FR, on_event: FE) -> Self {
        Self {
            on_run_id,
            on_event,
            run_id: None,
            closed: false,
            status: None,
            error: None,
            started_at: unix_timestamp_millis_now(),
        }
    }

    fn deliver(&mut self, event: RunEvent) {
        if self.closed {
            tracing::debug!("dropping run event received after stream close");
            return;
        }

        if let RunEvent::RunInitiated { run_id } = &event {
            // later batches may redeliver the run id; surface it once
            if self.run_id.is_none() {
                (self.on_run_id)(run_id);
                self.run_id = Some(run_id.clone());
            }
        }

        (self.on_event)(&event);

        match &event {
            RunEvent::Completed { .. } => {
                self.status = Some(RunStatus::Completed);
                self.closed = true;
            }
            RunEvent::Failed { message } => {
                self.status = Some(RunStatus::Failed);
                self.error = Some(message.clone());
                self.closed = true;
            }
            _ => {}
        }
    }

    fn deliver_batch(&mut self, batch: Vec<RunEvent>) {
        for event in batch {
            self.deliver(event);
        }
    }

    const fn is_closed(&self) -> bool {
        self.closed
    }

    fn finish(self) -> ExecutionResult<RunMeta> {
        let run_id = self.run_id.ok_or(ExecutionError::MissingRunId)?;
        Ok(RunMeta {
            run_id,
            status: self.status.unwrap_or(RunStatus::Completed),
            started_at: self.started_at,
            completed_at: unix_timestamp_millis_now(),
            error: self.error,
        })
    }
}

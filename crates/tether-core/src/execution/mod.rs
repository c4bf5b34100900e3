//! Execution gateway: OAuth-gated workflow runs with streamed events.

mod engine;
mod gateway;
mod stream;

pub use engine::{EngineInvocation, NativeEngine};
pub use gateway::{ExecutionGateway, ExecutionMode, ExecutionOptions};
pub use stream::{FrameBuffer, SseFrame, StreamError};

use thiserror::Error;

use crate::oauth::GateError;

#[derive(Debug, Error)]
pub enum ExecutionError {
    /// One or more providers are unauthorized; carries exactly the
    /// providers still missing
    #[error("Authorization required for providers: {}", providers.join(", "))]
    AuthorizationRequired { providers: Vec<String> },
    #[error(transparent)]
    Gate(GateError),
    #[error(transparent)]
    Hub(#[from] crate::remote::HubError),
    #[error(transparent)]
    Store(#[from] crate::error::Error),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error("Engine error: {0}")]
    Engine(String),
    #[error("Run stream ended without a run identifier")]
    MissingRunId,
}

pub type ExecutionResult<T> = Result<T, ExecutionError>;

impl From<GateError> for ExecutionError {
    fn from(error: GateError) -> Self {
        match error {
            GateError::AuthorizationRequired { providers } => {
                Self::AuthorizationRequired { providers }
            }
            other => Self::Gate(other),
        }
    }
}

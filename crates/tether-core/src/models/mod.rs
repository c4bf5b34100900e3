//! Shared data models for the Tether engine

mod command;
mod oauth;
mod resource;
mod run;
mod sync_conflict;

pub use command::{CommandId, CommandPayload, OfflineCommand, COMMAND_MAX_AGE_MS};
pub use oauth::{
    ConsentRecord, PendingAuthorization, ProviderRequirement, StoredToken,
    PENDING_AUTHORIZATION_TTL_SECONDS, TOKEN_EXPIRY_SKEW_SECONDS,
};
pub use resource::{AppId, ResourceId, ResourceKind, ResourceSnapshot, Version};
pub use run::{RunEvent, RunMeta, RunStatus};
pub use sync_conflict::SyncConflict;

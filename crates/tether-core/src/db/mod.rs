//! Local database layer for Tether

mod connection;
mod migrations;
mod oauth_repository;
mod queue_repository;
mod settings_repository;
mod snapshot_repository;

pub use connection::Database;
pub use oauth_repository::{LibSqlOAuthRepository, OAuthRepository};
pub use queue_repository::{CommandQueueRepository, LibSqlCommandQueueRepository};
pub use settings_repository::{AppSettingsRepository, LibSqlAppSettingsRepository};
pub use snapshot_repository::{LibSqlSnapshotRepository, SnapshotRepository};

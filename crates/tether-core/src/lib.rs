//! tether-core - Core library for Tether
//!
//! This crate contains the shared models, local store, sync engine, OAuth
//! gate, and execution gateway used by all Tether interfaces (desktop, CLI).

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod execution;
pub mod models;
pub mod oauth;
pub mod remote;
pub mod state;
pub mod sync;
pub mod util;

pub use error::{Error, Result};
pub use models::{AppId, ResourceId, ResourceKind, ResourceSnapshot};
pub use state::SyncState;

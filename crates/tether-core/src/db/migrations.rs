//! Database migrations

use crate::error::Result;
use libsql::Connection;

/// Current schema version
const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations
pub async fn run(conn: &Connection) -> Result<()> {
    let version = get_version(conn).await?;

    if version < 1 {
        migrate_v1(conn).await?;
    }
    if version < 2 {
        migrate_v2(conn).await?;
    }

    Ok(())
}

/// Get the current schema version
async fn get_version(conn: &Connection) -> Result<i32> {
    // Check if schema_version table exists
    let mut rows = conn
        .query(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
            (),
        )
        .await?;

    let exists: bool = if let Some(row) = rows.next().await? {
        row.get::<i32>(0)? != 0
    } else {
        false
    };

    if !exists {
        return Ok(0);
    }

    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_version", ())
        .await?;

    let version: i32 = if let Some(row) = rows.next().await? {
        row.get(0)?
    } else {
        0
    };

    Ok(version)
}

async fn apply(conn: &Connection, statements: &[&str]) -> Result<()> {
    // libsql doesn't have execute_batch, so we run each statement separately
    // inside a transaction for atomicity
    conn.execute("BEGIN TRANSACTION", ()).await?;

    for stmt in statements {
        if let Err(e) = conn.execute(stmt, ()).await {
            conn.execute("ROLLBACK", ()).await.ok();
            return Err(e.into());
        }
    }

    if let Err(e) = conn.execute("COMMIT", ()).await {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(e.into());
    }

    Ok(())
}

/// Migration to version 1: Initial schema
async fn migrate_v1(conn: &Connection) -> Result<()> {
    let statements = [
        // Schema version tracking
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        )",
        // Cached resource snapshots
        "CREATE TABLE IF NOT EXISTS snapshots (
            id TEXT PRIMARY KEY,
            app_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            version TEXT,
            updated_at INTEGER NOT NULL,
            body TEXT NOT NULL
        )",
        "CREATE INDEX IF NOT EXISTS idx_snapshots_app ON snapshots(app_id)",
        "CREATE INDEX IF NOT EXISTS idx_snapshots_updated ON snapshots(updated_at DESC)",
        // Offline mutation queue
        "CREATE TABLE IF NOT EXISTS offline_commands (
            id TEXT PRIMARY KEY,
            app_id TEXT NOT NULL,
            resource_id TEXT NOT NULL,
            payload TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )",
        "CREATE INDEX IF NOT EXISTS idx_offline_commands_key
            ON offline_commands(app_id, resource_id, created_at)",
        // OAuth tokens (one per provider)
        "CREATE TABLE IF NOT EXISTS oauth_tokens (
            provider_id TEXT PRIMARY KEY,
            access_token TEXT NOT NULL,
            refresh_token TEXT,
            expires_at INTEGER,
            scopes TEXT NOT NULL,
            stored_at INTEGER NOT NULL
        )",
        // App-scoped provider consents
        "CREATE TABLE IF NOT EXISTS consents (
            app_id TEXT NOT NULL,
            provider_id TEXT NOT NULL,
            consented_at INTEGER NOT NULL,
            scopes TEXT NOT NULL,
            PRIMARY KEY (app_id, provider_id)
        )",
        // In-flight authorization attempts keyed by state nonce
        "CREATE TABLE IF NOT EXISTS pending_authorizations (
            state TEXT PRIMARY KEY,
            provider_id TEXT NOT NULL,
            initiated_at INTEGER NOT NULL
        )",
        // Per-app settings (local only)
        "CREATE TABLE IF NOT EXISTS app_settings (
            app_id TEXT PRIMARY KEY,
            offline INTEGER NOT NULL DEFAULT 0
        )",
        // Record migration version
        "INSERT INTO schema_version (version) VALUES (1)",
    ];

    apply(conn, &statements).await?;
    tracing::info!("Migrated database to version 1");
    Ok(())
}

/// Migration to version 2: conflict logging support
async fn migrate_v2(conn: &Connection) -> Result<()> {
    let statements = [
        "CREATE TABLE IF NOT EXISTS sync_conflicts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            resource_id TEXT NOT NULL,
            local_updated_at INTEGER NOT NULL,
            remote_updated_at INTEGER NOT NULL,
            resolved_at INTEGER NOT NULL,
            strategy TEXT NOT NULL
        )",
        "CREATE INDEX IF NOT EXISTS idx_sync_conflicts_resource_id
            ON sync_conflicts(resource_id)",
        "CREATE INDEX IF NOT EXISTS idx_sync_conflicts_resolved_at
            ON sync_conflicts(resolved_at DESC)",
        "INSERT INTO schema_version (version) VALUES (2)",
    ];

    apply(conn, &statements).await?;
    tracing::info!("Migrated database to version {CURRENT_VERSION}");
    Ok(())
}

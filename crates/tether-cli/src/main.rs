//! Tether CLI - local-first access to workspace resources
//!
//! Reads are served from the local cache and reconciled against the hub in
//! the background; mutations apply locally first and replay once the hub is
//! reachable again.

mod session_store;

use std::env;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::aot::Generator;
use clap_complete::{generate, shells};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use session_store::{HubSession, KeyringSessionStore, SessionStoreError};
use tether_core::db::{
    AppSettingsRepository, CommandQueueRepository, Database, LibSqlAppSettingsRepository,
    LibSqlCommandQueueRepository, LibSqlOAuthRepository, LibSqlSnapshotRepository,
    SnapshotRepository,
};
use tether_core::events::EventBus;
use tether_core::execution::{
    EngineInvocation, ExecutionError, ExecutionGateway, ExecutionOptions, NativeEngine,
};
use tether_core::models::{
    AppId, CommandPayload, ProviderRequirement, ResourceId, ResourceKind, RunEvent, Version,
};
use tether_core::oauth::{GateError, OAuthGate};
use tether_core::remote::{AccessTokenProvider, HubClient, HubError, HubResult};
use tether_core::sync::{CommandQueue, ReadOptions, SnapshotKey, SyncError, Synchronizer};

const DEFAULT_HUB_URL: &str = "https://hub.tether.app";

#[derive(Parser)]
#[command(name = "tether")]
#[command(about = "Local-first client for the Tether workflow hub")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Optional path to the local database file
    #[arg(long, value_name = "PATH")]
    db_path: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show a resource from the local cache (reconciles in the background)
    Get {
        /// App ID
        app: String,
        /// Resource ID
        id: String,
        /// Resource kind
        #[arg(long, default_value = "board")]
        kind: String,
        /// Pin an exact version (disables reconciliation)
        #[arg(long)]
        pin: Option<String>,
    },
    /// Rename a resource (works offline)
    Rename {
        /// App ID
        app: String,
        /// Resource ID
        id: String,
        /// New name
        name: String,
    },
    /// Inspect or flush the offline command queue
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
    /// Connect a third-party provider via the device flow
    Connect {
        /// Provider ID (e.g. github)
        provider: String,
        /// Requested scopes
        #[arg(long, value_delimiter = ',')]
        scopes: Vec<String>,
        /// Also record consent for this app
        #[arg(long)]
        app: Option<String>,
    },
    /// Invoke an event and stream its run
    Run {
        /// App ID
        app: String,
        /// Event resource ID
        id: String,
        /// JSON payload
        #[arg(long)]
        payload: Option<String>,
        /// Skip the consent check (after the consent dialog already ran)
        #[arg(long)]
        skip_consent_check: bool,
    },
    /// Toggle an app's local-only mode
    Offline {
        /// App ID
        app: String,
        /// Clear the flag instead of setting it
        #[arg(long)]
        clear: bool,
    },
    /// Store a hub bearer token in the OS keyring
    Login {
        /// Bearer token (personal access token)
        token: String,
    },
    /// Remove the stored hub session
    Logout,
    /// Generate shell completion scripts
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
        /// Optional output path (stdout when omitted)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum QueueAction {
    /// List queued commands for a resource
    List {
        /// App ID
        app: String,
        /// Resource ID
        id: String,
    },
    /// Replay queued commands now
    Flush {
        /// App ID
        app: String,
        /// Resource ID
        id: String,
    },
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Core(#[from] tether_core::Error),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Gate(#[from] GateError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error(transparent)]
    Hub(#[from] HubError),
    #[error(transparent)]
    SessionStore(#[from] SessionStoreError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid ID '{0}'")]
    InvalidId(String),
    #[error("Invalid resource kind '{0}'")]
    InvalidKind(String),
    #[error("Invalid version '{0}' (expected major.minor.patch)")]
    InvalidVersion(String),
    #[error("Invalid JSON payload: {0}")]
    InvalidPayload(String),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tether=info".parse().expect("static directive parses")),
        )
        .init();

    let cli = Cli::parse();
    let db_path = resolve_db_path(cli.db_path);

    match cli.command {
        Commands::Get { app, id, kind, pin } => {
            run_get(&app, &id, &kind, pin.as_deref(), &db_path).await?;
        }
        Commands::Rename { app, id, name } => run_rename(&app, &id, &name, &db_path).await?,
        Commands::Queue { action } => match action {
            QueueAction::List { app, id } => run_queue_list(&app, &id, &db_path).await?,
            QueueAction::Flush { app, id } => run_queue_flush(&app, &id, &db_path).await?,
        },
        Commands::Connect {
            provider,
            scopes,
            app,
        } => run_connect(&provider, scopes, app.as_deref(), &db_path).await?,
        Commands::Run {
            app,
            id,
            payload,
            skip_consent_check,
        } => run_invoke(&app, &id, payload.as_deref(), skip_consent_check, &db_path).await?,
        Commands::Offline { app, clear } => run_offline(&app, clear, &db_path).await?,
        Commands::Login { token } => run_login(&token)?,
        Commands::Logout => run_logout()?,
        Commands::Completions { shell, output } => run_completions(shell, output.as_deref())?,
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Engine wiring
// ---------------------------------------------------------------------------

/// Bearer-token source for hub calls: env override first, then the keyring.
#[derive(Clone)]
struct CliAuth {
    store: KeyringSessionStore,
}

impl CliAuth {
    fn has_token(&self) -> bool {
        if env::var("TETHER_TOKEN").is_ok_and(|token| !token.trim().is_empty()) {
            return true;
        }
        matches!(self.store.load(), Ok(Some(_)))
    }
}

#[async_trait]
impl AccessTokenProvider for CliAuth {
    async fn access_token(&self) -> HubResult<String> {
        if let Ok(token) = env::var("TETHER_TOKEN") {
            let token = token.trim().to_string();
            if !token.is_empty() {
                return Ok(token);
            }
        }
        match self.store.load() {
            Ok(Some(session)) => Ok(session.access_token),
            _ => Err(HubError::Unauthenticated),
        }
    }

    async fn start_silent_renew(&self) -> HubResult<String> {
        // CLI sessions are long-lived personal access tokens; there is
        // nothing to renew. Re-login instead.
        Err(HubError::Unauthenticated)
    }
}

/// Local execution needs the desktop engine; the CLI only runs remotely.
struct UnavailableEngine;

#[async_trait]
impl NativeEngine for UnavailableEngine {
    async fn invoke(
        &self,
        _invocation: EngineInvocation,
    ) -> tether_core::execution::ExecutionResult<tokio::sync::mpsc::Receiver<Vec<RunEvent>>> {
        Err(ExecutionError::Engine(
            "local execution requires the desktop engine".to_string(),
        ))
    }
}

struct EngineContext {
    // keeps the underlying database alive for the cloned connections
    _db: Database,
    settings: Arc<dyn AppSettingsRepository>,
    queue_repo: Arc<dyn CommandQueueRepository>,
    queue: Arc<CommandQueue<HubClient>>,
    synchronizer: Synchronizer<HubClient>,
    gate: Arc<OAuthGate<HubClient>>,
    gateway: ExecutionGateway<HubClient, HubClient>,
    has_session: bool,
}

async fn open_engine(db_path: &Path) -> Result<EngineContext, CliError> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db = Database::open(db_path).await?;
    let snapshots: Arc<dyn SnapshotRepository> =
        Arc::new(LibSqlSnapshotRepository::new(db.connection()));
    let settings: Arc<dyn AppSettingsRepository> =
        Arc::new(LibSqlAppSettingsRepository::new(db.connection()));
    let queue_repo: Arc<dyn CommandQueueRepository> =
        Arc::new(LibSqlCommandQueueRepository::new(db.connection()));
    let oauth_repo = Arc::new(LibSqlOAuthRepository::new(db.connection()));

    let auth = Arc::new(CliAuth {
        store: KeyringSessionStore::default(),
    });
    let has_session = auth.has_token();
    let hub = Arc::new(HubClient::new(
        hub_base_url(),
        Arc::clone(&auth) as Arc<dyn AccessTokenProvider>,
    )?);

    let bus = EventBus::new();
    let queue = Arc::new(CommandQueue::new(
        Arc::clone(&snapshots),
        Arc::clone(&queue_repo),
        Arc::clone(&hub),
        bus.clone(),
    ));
    let synchronizer = Synchronizer::new(
        Arc::clone(&snapshots),
        Arc::clone(&settings),
        Arc::clone(&queue),
        Arc::clone(&hub),
        bus,
    );
    let gate = Arc::new(OAuthGate::new(oauth_repo, Arc::clone(&hub)));
    let gateway = ExecutionGateway::new(
        Arc::clone(&snapshots),
        Arc::clone(&gate),
        Arc::clone(&hub),
        Arc::new(UnavailableEngine),
        auth,
    );

    Ok(EngineContext {
        _db: db,
        settings,
        queue_repo,
        queue,
        synchronizer,
        gate,
        gateway,
        has_session,
    })
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn run_get(
    app: &str,
    id: &str,
    kind: &str,
    pin: Option<&str>,
    db_path: &Path,
) -> Result<(), CliError> {
    let engine = open_engine(db_path).await?;
    let key = parse_key(app, id, kind)?;
    let pinned = pin
        .map(str::parse::<Version>)
        .transpose()
        .map_err(|_| CliError::InvalidVersion(pin.unwrap_or_default().to_string()))?;

    let options = ReadOptions {
        pinned,
        background_refresh: engine.has_session,
    };
    let outcome = engine.synchronizer.read(key, options).await?;

    match &outcome.snapshot {
        Some(snapshot) => println!("{}", serde_json::to_string_pretty(snapshot)?),
        None => println!("(not cached locally)"),
    }

    // Wait for the background reconciliation and show the result when the
    // hub had a newer snapshot.
    if let Some(handle) = outcome.reconciliation {
        handle.wait().await;
        let refreshed = engine.synchronizer.read(key, ReadOptions::default()).await?;
        if refreshed.snapshot != outcome.snapshot {
            if let Some(snapshot) = refreshed.snapshot {
                println!("(updated from hub)");
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            }
        }
    }

    Ok(())
}

async fn run_rename(app: &str, id: &str, name: &str, db_path: &Path) -> Result<(), CliError> {
    let engine = open_engine(db_path).await?;
    let (app_id, resource_id) = (parse_app_id(app)?, parse_resource_id(id)?);

    let snapshot = engine
        .queue
        .execute_command(
            &app_id,
            &resource_id,
            CommandPayload::Rename {
                name: name.to_string(),
            },
        )
        .await?;

    println!("{}", snapshot.body["name"].as_str().unwrap_or(name));
    let pending = engine.queue.pending(&app_id, &resource_id).await?;
    if pending > 0 {
        println!("({pending} command(s) queued for replay)");
    }
    Ok(())
}

async fn run_queue_list(app: &str, id: &str, db_path: &Path) -> Result<(), CliError> {
    let engine = open_engine(db_path).await?;
    let (app_id, resource_id) = (parse_app_id(app)?, parse_resource_id(id)?);

    let commands = engine.queue_repo.list_by_key(&app_id, &resource_id).await?;
    if commands.is_empty() {
        println!("(queue is empty)");
        return Ok(());
    }

    for command in commands {
        println!(
            "{}  {}  {}",
            command.command_id,
            command.created_at,
            serde_json::to_string(&command.payload)?
        );
    }
    Ok(())
}

async fn run_queue_flush(app: &str, id: &str, db_path: &Path) -> Result<(), CliError> {
    let engine = open_engine(db_path).await?;
    let (app_id, resource_id) = (parse_app_id(app)?, parse_resource_id(id)?);

    let outcome = engine.queue.flush_due(&app_id, &resource_id).await?;
    println!("replayed: {}, dropped: {}", outcome.replayed, outcome.dropped);

    let pending = engine.queue.pending(&app_id, &resource_id).await?;
    if pending > 0 {
        println!("({pending} command(s) still queued)");
    }
    Ok(())
}

async fn run_connect(
    provider: &str,
    scopes: Vec<String>,
    app: Option<&str>,
    db_path: &Path,
) -> Result<(), CliError> {
    let engine = open_engine(db_path).await?;
    let requirement = ProviderRequirement {
        provider_id: provider.to_string(),
        scopes,
        use_device_flow: true,
    };

    let abort = CancellationToken::new();
    let ctrl_c_abort = abort.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c_abort.cancel();
        }
    });

    let token = engine
        .gate
        .authorize_device(&requirement, &abort, |authorization| {
            println!(
                "Visit {} and enter code {}",
                authorization.verification_uri, authorization.user_code
            );
        })
        .await?;
    println!("Connected {provider} (scopes: {})", token.scopes.join(" "));

    if let Some(app) = app {
        let app_id = parse_app_id(app)?;
        engine.gate.record_consent(&app_id, &requirement).await?;
        println!("Recorded consent for app {app_id}");
    }
    Ok(())
}

async fn run_invoke(
    app: &str,
    id: &str,
    payload: Option<&str>,
    skip_consent_check: bool,
    db_path: &Path,
) -> Result<(), CliError> {
    let engine = open_engine(db_path).await?;
    let key = parse_key(app, id, "event")?;
    let payload = parse_payload(payload)?;

    let options = ExecutionOptions {
        skip_consent_check,
        ..ExecutionOptions::remote()
    };

    let meta = engine
        .gateway
        .execute(
            key,
            payload,
            options,
            |run_id| println!("run: {run_id}"),
            |event| {
                if let Ok(line) = serde_json::to_string(event) {
                    println!("{line}");
                }
            },
        )
        .await?;

    println!(
        "{} ({} ms)",
        serde_json::to_string(&meta.status)?,
        meta.completed_at - meta.started_at
    );
    Ok(())
}

async fn run_offline(app: &str, clear: bool, db_path: &Path) -> Result<(), CliError> {
    let engine = open_engine(db_path).await?;
    let app_id = parse_app_id(app)?;

    engine.settings.set_offline(&app_id, !clear).await?;
    if clear {
        println!("App {app_id} will reconcile with the hub again");
    } else {
        println!("App {app_id} is now local-only");
    }
    Ok(())
}

fn run_login(token: &str) -> Result<(), CliError> {
    let token = token.trim();
    if token.is_empty() {
        return Err(CliError::InvalidPayload("token must not be empty".to_string()));
    }

    let store = KeyringSessionStore::default();
    store.save(&HubSession {
        access_token: token.to_string(),
        stored_at: tether_core::util::unix_timestamp_now(),
    })?;
    println!("Session stored");
    Ok(())
}

fn run_logout() -> Result<(), CliError> {
    KeyringSessionStore::default().clear()?;
    println!("Session cleared");
    Ok(())
}

fn run_completions(shell: CompletionShell, output_path: Option<&Path>) -> Result<(), CliError> {
    let mut command = Cli::command();
    let mut buffer = Vec::new();

    match shell {
        CompletionShell::Bash => generate_for_shell(shells::Bash, &mut command, &mut buffer),
        CompletionShell::Zsh => generate_for_shell(shells::Zsh, &mut command, &mut buffer),
        CompletionShell::Fish => generate_for_shell(shells::Fish, &mut command, &mut buffer),
    }

    if let Some(path) = output_path {
        std::fs::write(path, &buffer)?;
        println!("{}", path.display());
    } else {
        io::stdout().write_all(&buffer)?;
    }

    Ok(())
}

fn generate_for_shell<G: Generator>(
    generator: G,
    command: &mut clap::Command,
    buffer: &mut Vec<u8>,
) {
    generate(generator, command, "tether", buffer);
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_app_id(raw: &str) -> Result<AppId, CliError> {
    raw.trim()
        .parse()
        .map_err(|_| CliError::InvalidId(raw.to_string()))
}

fn parse_resource_id(raw: &str) -> Result<ResourceId, CliError> {
    raw.trim()
        .parse()
        .map_err(|_| CliError::InvalidId(raw.to_string()))
}

fn parse_kind(raw: &str) -> Result<ResourceKind, CliError> {
    raw.trim()
        .parse()
        .map_err(|_| CliError::InvalidKind(raw.to_string()))
}

fn parse_key(app: &str, id: &str, kind: &str) -> Result<SnapshotKey, CliError> {
    Ok(SnapshotKey::new(
        parse_app_id(app)?,
        parse_resource_id(id)?,
        parse_kind(kind)?,
    ))
}

fn parse_payload(raw: Option<&str>) -> Result<Value, CliError> {
    match raw {
        None => Ok(Value::Null),
        Some(raw) => {
            serde_json::from_str(raw).map_err(|error| CliError::InvalidPayload(error.to_string()))
        }
    }
}

fn hub_base_url() -> String {
    env::var("TETHER_HUB_URL")
        .ok()
        .map(|url| url.trim().to_string())
        .filter(|url| !url.is_empty())
        .unwrap_or_else(|| DEFAULT_HUB_URL.to_string())
}

fn resolve_db_path(cli_db_path: Option<PathBuf>) -> PathBuf {
    cli_db_path
        .or_else(|| env::var_os("TETHER_DB_PATH").map(PathBuf::from))
        .unwrap_or_else(default_db_path)
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tether")
        .join("tether.db")
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};

    use serde_json::json;
    use tether_core::db::{Database, LibSqlSnapshotRepository, SnapshotRepository};
    use tether_core::models::{AppId, ResourceKind, ResourceSnapshot};

    use super::{
        default_db_path, open_engine, parse_key, parse_payload, run_offline, run_queue_flush,
        run_rename, CliError,
    };

    #[test]
    fn default_db_path_is_defined() {
        assert!(default_db_path().ends_with("tether/tether.db"));
    }

    #[test]
    fn parse_key_accepts_valid_ids_and_kinds() {
        let app = AppId::new().to_string();
        let id = tether_core::models::ResourceId::new().to_string();

        let key = parse_key(&app, &id, "template").unwrap();
        assert_eq!(key.kind, ResourceKind::Template);

        assert!(matches!(
            parse_key("not-a-uuid", &id, "board"),
            Err(CliError::InvalidId(_))
        ));
        assert!(matches!(
            parse_key(&app, &id, "widget"),
            Err(CliError::InvalidKind(_))
        ));
    }

    #[test]
    fn parse_payload_defaults_to_null() {
        assert_eq!(parse_payload(None).unwrap(), serde_json::Value::Null);
        assert_eq!(
            parse_payload(Some(r#"{"a": 1}"#)).unwrap(),
            json!({"a": 1})
        );
        assert!(matches!(
            parse_payload(Some("{broken")),
            Err(CliError::InvalidPayload(_))
        ));
    }

    async fn seed_snapshot(db_path: &PathBuf) -> ResourceSnapshot {
        let db = Database::open(db_path).await.unwrap();
        let repo = LibSqlSnapshotRepository::new(db.connection());
        let snapshot = ResourceSnapshot::new(
            AppId::new(),
            ResourceKind::Board,
            json!({"name": "Inbox", "nodes": {}}),
        );
        repo.put(&snapshot).await.unwrap();
        snapshot
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rename_applies_locally_and_queues_without_a_session() {
        let db_path = unique_test_db_path();
        let snapshot = seed_snapshot(&db_path).await;

        run_rename(
            &snapshot.app_id.to_string(),
            &snapshot.id.to_string(),
            "Renamed offline",
            &db_path,
        )
        .await
        .unwrap();

        let engine = open_engine(&db_path).await.unwrap();
        let db = Database::open(&db_path).await.unwrap();
        let repo = LibSqlSnapshotRepository::new(db.connection());
        let cached = repo.get(&snapshot.id).await.unwrap().unwrap();
        assert_eq!(cached.body["name"], "Renamed offline");
        assert_eq!(
            engine.queue.pending(&snapshot.app_id, &snapshot.id).await.unwrap(),
            1
        );

        cleanup_db_files(&db_path);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn queue_flush_without_hub_keeps_commands() {
        let db_path = unique_test_db_path();
        let snapshot = seed_snapshot(&db_path).await;

        run_rename(
            &snapshot.app_id.to_string(),
            &snapshot.id.to_string(),
            "Still queued",
            &db_path,
        )
        .await
        .unwrap();

        run_queue_flush(
            &snapshot.app_id.to_string(),
            &snapshot.id.to_string(),
            &db_path,
        )
        .await
        .unwrap();

        let engine = open_engine(&db_path).await.unwrap();
        assert_eq!(
            engine.queue.pending(&snapshot.app_id, &snapshot.id).await.unwrap(),
            1
        );

        cleanup_db_files(&db_path);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn offline_flag_round_trips_through_command() {
        let db_path = unique_test_db_path();
        let app = AppId::new();

        run_offline(&app.to_string(), false, &db_path).await.unwrap();
        let engine = open_engine(&db_path).await.unwrap();
        assert!(engine.settings.is_offline(&app).await.unwrap());
        drop(engine);

        run_offline(&app.to_string(), true, &db_path).await.unwrap();
        let engine = open_engine(&db_path).await.unwrap();
        assert!(!engine.settings.is_offline(&app).await.unwrap());

        cleanup_db_files(&db_path);
    }

    fn unique_test_db_path() -> PathBuf {
        static NEXT_TEST_DB_ID: AtomicU64 = AtomicU64::new(0);

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |duration| duration.as_nanos());
        let sequence = NEXT_TEST_DB_ID.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!("tether-cli-test-{timestamp}-{sequence}.db"))
    }

    fn cleanup_db_files(path: &PathBuf) {
        let _ = std::fs::remove_file(path);
        let _ = std::fs::remove_file(path.with_extension("db-shm"));
        let _ = std::fs::remove_file(path.with_extension("db-wal"));
    }
}

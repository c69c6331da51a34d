//! syncline - command-line driver for the offline sync engine.
//!
//! Records mutations into the durable queue and replays them against a REST
//! backend on demand (`sync`) or whenever the backend becomes reachable
//! (`watch`).

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use syncline_core::{
    ActionType, FileStore, HttpHealthCheck, LogNotifier, OfflineEngine, PendingAction, RequestExecutor,
    RestClient, SyncConfig, SyncError, SyncOutcome, SyncReport,
};

// ============================================================================
// Constants
// ============================================================================

/// How often `watch` checks the backend for reachability
const HEALTH_CHECK_INTERVAL_SECS: u64 = 5;

const LOG_FILE_PREFIX: &str = "syncline.log";

#[derive(Parser, Debug)]
#[command(name = "syncline")]
#[command(about = "Queue mutations offline and replay them when the backend is reachable")]
#[command(version, propagate_version = true)]
struct Cli {
    /// Backend base URL (overrides base_url in the config file)
    #[arg(long, env = "SYNCLINE_BASE_URL", global = true)]
    base_url: Option<String>,

    /// Bearer token sent with every request
    #[arg(long, env = "SYNCLINE_TOKEN", global = true, hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
enum Command {
    /// Queue a mutation for the next sync
    Enqueue {
        /// Kind of mutation
        #[arg(value_enum)]
        kind: ActionKind,

        /// Resource path, e.g. "todos"
        resource: String,

        /// JSON body; updates and deletes must carry an "id"
        #[arg(value_parser = parse_payload)]
        payload: Value,
    },

    /// Show pending actions
    #[command(alias = "ls")]
    List,

    /// Replay the queue now
    Sync,

    /// Show queue and backend status
    Status,

    /// Sync whenever the backend is reachable
    Watch,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum ActionKind {
    Create,
    Update,
    Delete,
}

impl From<ActionKind> for ActionType {
    fn from(kind: ActionKind) -> Self {
        match kind {
            ActionKind::Create => ActionType::Create,
            ActionKind::Update => ActionType::Update,
            ActionKind::Delete => ActionType::Delete,
        }
    }
}

fn parse_payload(raw: &str) -> Result<Value, String> {
    serde_json::from_str(raw).map_err(|e| format!("payload is not valid JSON: {}", e))
}

/// Flag and environment values win over the config file.
fn apply_overrides(config: &mut SyncConfig, base_url: Option<String>, token: Option<String>) {
    if let Some(url) = base_url.filter(|u| !u.is_empty()) {
        config.base_url = Some(url);
    }
    if let Some(token) = token.filter(|t| !t.is_empty()) {
        config.auth_token = Some(token);
    }
}

/// Initialize the tracing subscriber: stderr plus a daily log file.
///
/// Use RUST_LOG to control the level (e.g. RUST_LOG=syncline_core=debug).
fn init_tracing(log_dir: &Path) -> WorkerGuard {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(fmt::layer().with_writer(file_writer).with_ansi(false))
        .with(filter)
        .init();
    guard
}

/// Stand-in used when no backend is configured. Every request fails as a
/// network error, so queued actions stay queued.
struct Unconfigured;

#[async_trait]
impl RequestExecutor for Unconfigured {
    async fn execute(&self, _action: &PendingAction) -> Result<Value, SyncError> {
        Err(SyncError::Network("no base_url configured".to_string()))
    }

    async fn fetch(&self, _resource: &str) -> Result<Value, SyncError> {
        Err(SyncError::Network("no base_url configured".to_string()))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let command = cli.command;

    let mut config = SyncConfig::load()?;
    apply_overrides(&mut config, cli.base_url, cli.token);

    let storage_dir = config.storage_dir()?;
    std::fs::create_dir_all(&storage_dir)
        .with_context(|| format!("Failed to create storage directory: {}", storage_dir.display()))?;
    let _log_guard = init_tracing(&storage_dir);
    info!(command = ?command, "syncline starting");

    let executor: Arc<dyn RequestExecutor> = match config.base_url {
        Some(_) => Arc::new(RestClient::from_config(&config)?),
        None => Arc::new(Unconfigured),
    };
    let engine = OfflineEngine::open(
        config.clone(),
        Arc::new(FileStore::new(storage_dir.clone())),
        executor,
        Arc::new(LogNotifier),
    )
    .await;

    match command {
        Command::Enqueue {
            kind,
            resource,
            payload,
        } => {
            let id = engine.enqueue(kind.into(), &resource, payload).await;
            println!("{}", id);
        }
        Command::List => print_pending(&engine.pending().await),
        Command::Sync => {
            require_backend(&config)?;
            engine.set_online(true);
            match engine.sync_now().await {
                SyncOutcome::Completed(report) => print_report(&report),
                other => eprintln!("Sync did not run: {:?}", other),
            }
        }
        Command::Status => {
            println!("Pending:  {}", engine.pending_count());
            println!("Backend:  {}", config.base_url.as_deref().unwrap_or("(not configured)"));
            println!("Storage:  {}", storage_dir.display());
        }
        Command::Watch => {
            let base_url = require_backend(&config)?;
            watch(&engine, base_url).await?;
        }
    }

    engine.stop().await;
    if engine.is_degraded() {
        eprintln!("Warning: storage was unavailable, changes from this run were not saved");
    }
    Ok(())
}

fn require_backend(config: &SyncConfig) -> Result<&str> {
    config
        .base_url
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("No backend configured. Set base_url in the config file or SYNCLINE_BASE_URL."))
}

async fn watch(engine: &OfflineEngine, base_url: &str) -> Result<()> {
    let health = HttpHealthCheck::spawn(base_url, Duration::from_secs(HEALTH_CHECK_INTERVAL_SECS))?;
    let mut completions = engine.completions();
    let mut state = engine.state();
    engine.start(&health);

    eprintln!("Watching {} (Ctrl-C to stop)", base_url);
    eprintln!("{}", engine.current_state().status_message());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                eprintln!("Stopping");
                break;
            }
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = state.borrow_and_update().clone();
                eprintln!("{}", current.status_message());
            }
            report = completions.recv() => match report {
                Ok(report) => print_report(&report),
                Err(RecvError::Lagged(skipped)) => eprintln!("Missed {} sync reports", skipped),
                Err(RecvError::Closed) => break,
            },
        }
    }
    Ok(())
}

fn print_pending(actions: &[PendingAction]) {
    if actions.is_empty() {
        println!("No pending actions");
        return;
    }
    for action in actions {
        println!(
            "{}  {:<6} {:<16} retries={}  {}",
            action.id,
            action.action_type,
            action.resource,
            action.retry_count,
            action.payload
        );
    }
}

fn print_report(report: &SyncReport) {
    println!(
        "Synced {}/{} actions ({} retrying, {} rejected, {} dropped), {} pending",
        report.succeeded,
        report.attempted,
        report.retrying,
        report.rejected,
        report.exhausted,
        report.pending_count
    );
}

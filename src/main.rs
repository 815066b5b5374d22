//! `pos-sync`: operator CLI for the sync engine.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;

use pos_sync::{EntityKey, MergeRegistry, SyncConfig, SyncEngine};

#[derive(Debug, Parser)]
#[command(
    name = "pos-sync",
    version = concat!(env!("CARGO_PKG_VERSION"), " (", env!("BUILD_GIT_SHA"), ")"),
    about = "Offline-first POS sync engine"
)]
struct Cli {
    /// Directory holding the sync database and logs.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one sync cycle now and print its report.
    Run,
    /// Print the current sync status.
    Status,
    /// Keep syncing in the background until interrupted.
    Daemon,
    /// Requeue a terminally failed mutation.
    Retry { id: i64 },
    /// List conflict audit records, newest first.
    Conflicts {
        #[arg(long, requires = "entity_id")]
        entity_type: Option<String>,
        #[arg(long, requires = "entity_type")]
        entity_id: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("failed to encode output")?
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = SyncConfig::from_env().context("invalid sync configuration")?;
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    // One-shot commands trigger cycles explicitly.
    if !matches!(cli.command, Command::Daemon) {
        config.auto_sync = false;
    }

    let _log_guard = pos_sync::logging::init(&config.log_dir(), config.log_json);
    info!(
        "Starting pos-sync v{} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_GIT_SHA")
    );

    let engine = SyncEngine::open(&config, MergeRegistry::new())
        .with_context(|| format!("failed to open sync engine in {}", config.data_dir.display()))?;

    let outcome = run_command(&engine, cli.command).await;
    engine.shutdown().await;
    outcome
}

async fn run_command(engine: &SyncEngine, command: Command) -> Result<()> {
    match command {
        Command::Run => {
            let report = engine.run_now().await.context("sync cycle failed")?;
            print_json(&report)
        }
        Command::Status => print_json(&engine.status().context("failed to read sync status")?),
        Command::Daemon => {
            info!("Sync daemon running; press Ctrl+C to stop");
            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for shutdown signal")?;
            info!("Shutdown requested");
            Ok(())
        }
        Command::Retry { id } => {
            engine
                .retry(id)
                .with_context(|| format!("failed to requeue mutation {id}"))?;
            print_json(&serde_json::json!({ "requeued": id }))
        }
        Command::Conflicts {
            entity_type,
            entity_id,
            limit,
        } => {
            let key = entity_type.zip(entity_id).map(|(t, id)| EntityKey::new(t, id));
            let records = engine
                .conflicts(key.as_ref(), limit)
                .context("failed to read conflict records")?;
            print_json(&records)
        }
    }
}

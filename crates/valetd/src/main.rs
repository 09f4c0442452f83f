//! valetd — the Valet placement daemon.
//!
//! Assembles the engine from a `valet.toml`:
//! - State store (redb)
//! - File-backed inventory collaborator
//! - Event polling loop
//! - Inventory refresh loop
//!
//! # Usage
//!
//! ```text
//! valetd run --config /etc/valet/valet.toml
//! valetd place --config /etc/valet/valet.toml --request request.json
//! ```

mod file_inventory;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;
use valet_core::{LoggingConfig, ValetConfig};
use valet_engine::{AppRequest, Engine, Inventory, Reply, run_event_loop, run_inventory_refresh};
use valet_state::StateStore;

use crate::file_inventory::FileInventory;

#[derive(Parser)]
#[command(name = "valetd", about = "Valet placement daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the event and inventory loops until interrupted.
    Run {
        /// Path to valet.toml.
        #[arg(long, default_value = "/etc/valet/valet.toml")]
        config: PathBuf,
    },
    /// Handle one JSON request against the current state and print the reply.
    Place {
        #[arg(long, default_value = "/etc/valet/valet.toml")]
        config: PathBuf,

        /// Path to the request JSON.
        #[arg(long)]
        request: PathBuf,
    },
}

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run { config } => {
            let config = load_config(&config)?;
            init_logging(&config.logging);
            run(config).await
        }
        Command::Place { config, request } => {
            let config = load_config(&config)?;
            init_logging(&config.logging);
            place(config, &request).await
        }
    }
}

fn load_config(path: &Path) -> anyhow::Result<ValetConfig> {
    ValetConfig::from_file(path).with_context(|| format!("loading config {}", path.display()))
}

/// Open the store and build an engine loaded with the current inventory.
async fn start_engine(config: &ValetConfig) -> anyhow::Result<(Engine, Arc<dyn Inventory>)> {
    if let Some(dir) = config.store.path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let store = StateStore::open(&config.store.path)?;
    let engine = Engine::new(config, Arc::new(store));

    let inventory: Arc<dyn Inventory> = Arc::new(FileInventory::new(&config.inventory.path));
    engine.refresh_inventory(inventory.as_ref()).await?;
    Ok((engine, inventory))
}

async fn run(config: ValetConfig) -> anyhow::Result<()> {
    info!(datacenter = %config.engine.datacenter, "valet daemon starting");
    let (engine, inventory) = start_engine(&config).await?;

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    let events_handle = tokio::spawn(run_event_loop(
        engine.clone(),
        Duration::from_secs(config.engine.event_interval_secs),
        shutdown_rx.clone(),
    ));
    let refresh_handle = tokio::spawn(run_inventory_refresh(
        engine,
        inventory,
        Duration::from_secs(config.engine.refresh_interval_secs),
        shutdown_rx,
    ));
    info!(
        event_interval = config.engine.event_interval_secs,
        refresh_interval = config.engine.refresh_interval_secs,
        "background loops started"
    );

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = events_handle.await;
    let _ = refresh_handle.await;

    info!("valet daemon stopped");
    Ok(())
}

async fn place(config: ValetConfig, request_path: &Path) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(request_path)
        .with_context(|| format!("reading request {}", request_path.display()))?;
    let request: AppRequest = serde_json::from_str(&content)?;

    let (engine, _) = start_engine(&config).await?;
    engine.process_events().await?;
    let reply = Reply::from_result(engine.handle(&request).await);
    println!("{}", serde_json::to_string_pretty(&reply)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_run_and_place() {
        let cli = Cli::try_parse_from(["valetd", "run", "--config", "/tmp/valet.toml"]).unwrap();
        match cli.command {
            Command::Run { config } => assert_eq!(config, PathBuf::from("/tmp/valet.toml")),
            _ => panic!("expected run"),
        }

        let cli = Cli::try_parse_from(["valetd", "place", "--request", "r.json"]).unwrap();
        match cli.command {
            Command::Place { config, request } => {
                assert_eq!(config, PathBuf::from("/etc/valet/valet.toml"));
                assert_eq!(request, PathBuf::from("r.json"));
            }
            _ => panic!("expected place"),
        }

        assert!(Cli::try_parse_from(["valetd", "place"]).is_err());
    }

    #[tokio::test]
    async fn engine_starts_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let inventory = dir.path().join("inventory.toml");
        std::fs::write(
            &inventory,
            r#"
[[hosts]]
name = "h1"
vcpus = 8
memory_mb = 8192
local_gb = 100

[[flavors]]
id = "1"
name = "small"
vcpus = 1
memory_mb = 1024
disk_gb = 10
"#,
        )
        .unwrap();

        let mut config = ValetConfig::default();
        config.store.path = dir.path().join("state").join("valet.redb");
        config.inventory.path = inventory;

        let (engine, _) = start_engine(&config).await.unwrap();
        let request: AppRequest = serde_json::from_value(serde_json::json!({
            "action": "create",
            "stack_id": "s1",
            "resources": {"a": {"type": "OS::Nova::Server", "properties": {"flavor": "small"}}}
        }))
        .unwrap();
        let reply = Reply::from_result(engine.handle(&request).await);
        assert!(reply.is_success());
        assert_eq!(
            serde_json::to_value(&reply).unwrap()["placements"]["a"],
            "h1"
        );
    }
}

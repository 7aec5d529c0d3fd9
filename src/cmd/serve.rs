//! Orchestrator server commands: `gantry serve` and `gantry init-db`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use gantry::config::{self, CliOverrides, GantryToml};
use gantry::db::BoardStore;
use gantry::server::start_server;

pub async fn cmd_serve(
    port: Option<u16>,
    db_path: Option<PathBuf>,
    budget_secs: Option<u64>,
    heartbeat_secs: Option<u64>,
    sweep_secs: Option<u64>,
    stale_secs: Option<u64>,
    dev: bool,
) -> Result<()> {
    // `.env` first so the environment layer sees it.
    dotenvy::dotenv().ok();
    init_tracing();

    let cwd = std::env::current_dir().context("Failed to resolve working directory")?;
    let toml = GantryToml::load_or_default(&cwd)?;
    let config = config::resolve(
        toml,
        CliOverrides {
            port,
            db_path,
            invocation_budget_secs: budget_secs,
            heartbeat_secs,
            sweep_interval_secs: sweep_secs,
            stale_after_secs: stale_secs,
            dev,
        },
    )?;

    start_server(config).await
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("gantry=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

pub fn cmd_init_db(db_path: &Path) -> Result<()> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    BoardStore::new(db_path)?;
    println!("Migration database initialized at {}", db_path.display());
    Ok(())
}

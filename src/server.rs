use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::api::{self, AppState};
use crate::db::{BoardStore, DbHandle};
use crate::events::HEARTBEAT_INTERVAL;
use crate::gates::ApprovalGate;
use crate::orchestrator::recovery::{DEFAULT_STALE_AFTER, DEFAULT_SWEEP_INTERVAL};
use crate::orchestrator::{Orchestrator, Reconciler};
use crate::pipeline::{DEFAULT_INVOCATION_BUDGET, PipelineRunner};

/// Configuration for the orchestrator server.
#[derive(Debug)]
pub struct ServerConfig {
    pub port: u16,
    pub db_path: std::path::PathBuf,
    pub invocation_budget: Duration,
    pub heartbeat: Duration,
    pub sweep_interval: Duration,
    pub stale_after: Duration,
    pub dev_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 4090,
            db_path: std::path::PathBuf::from(".gantry/gantry.db"),
            invocation_budget: DEFAULT_INVOCATION_BUDGET,
            heartbeat: HEARTBEAT_INTERVAL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            stale_after: DEFAULT_STALE_AFTER,
            dev_mode: false,
        }
    }
}

/// Build the application router with the API mounted on shared state.
pub fn build_router(state: Arc<AppState>) -> Router {
    api::api_router().with_state(state)
}

/// Start the orchestrator server.
pub async fn start_server(config: ServerConfig) -> Result<()> {
    // Ensure parent directory exists for the database
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }

    let store =
        BoardStore::new(&config.db_path).context("Failed to initialize migration database")?;
    let db = DbHandle::new(store);
    let runner = PipelineRunner::new(db.clone(), config.invocation_budget);

    let state = Arc::new(AppState {
        db: db.clone(),
        runner: runner.clone(),
        orchestrator: Orchestrator::new(db.clone()),
        gate: ApprovalGate::new(db.clone(), runner.clone()),
        heartbeat: config.heartbeat,
    });

    // The first sweep runs immediately, so jobs interrupted by a previous
    // process death are re-enqueued before the first request lands.
    Reconciler::new(db, runner, config.sweep_interval, config.stale_after).spawn();

    tracing::info!(
        budget_secs = config.invocation_budget.as_secs(),
        sweep_secs = config.sweep_interval.as_secs(),
        stale_secs = config.stale_after.as_secs(),
        "pipeline engine ready"
    );

    let mut app = build_router(state);

    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if config.dev_mode { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    println!("Gantry running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    println!("Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    println!("\nShutting down...");
}

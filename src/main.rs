use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "gantry")]
#[command(version, about = "Board migration and gated pipeline orchestrator")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the orchestrator HTTP server
    Serve {
        /// Port to serve on
        #[arg(short, long)]
        port: Option<u16>,

        /// Database path
        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Wall-clock budget for one pipeline invocation, in seconds
        #[arg(long)]
        budget_secs: Option<u64>,

        /// Interval between progress-stream heartbeats, in seconds
        #[arg(long)]
        heartbeat_secs: Option<u64>,

        /// Interval between reconciliation sweeps, in seconds
        #[arg(long)]
        sweep_secs: Option<u64>,

        /// Seconds of silence after which a running job is presumed lost
        #[arg(long)]
        stale_secs: Option<u64>,

        /// Development mode: bind all interfaces, allow any origin
        #[arg(long)]
        dev: bool,
    },
    /// Create the migration database and exit
    InitDb {
        /// Database path
        #[arg(long, default_value = ".gantry/gantry.db")]
        db_path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            port,
            db_path,
            budget_secs,
            heartbeat_secs,
            sweep_secs,
            stale_secs,
            dev,
        } => {
            cmd::cmd_serve(
                port,
                db_path,
                budget_secs,
                heartbeat_secs,
                sweep_secs,
                stale_secs,
                dev,
            )
            .await?;
        }
        Commands::InitDb { db_path } => {
            cmd::cmd_init_db(&db_path)?;
        }
    }

    Ok(())
}

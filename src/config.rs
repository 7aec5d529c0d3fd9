//! Layered runtime configuration for the gantry server.
//!
//! Settings come from `gantry.toml` in the working directory, with
//! per-setting precedence: CLI flag → `GANTRY_*` environment variable →
//! file → built-in default.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! port = 4090
//! db_path = ".gantry/gantry.db"
//! dev_mode = false
//!
//! [pipeline]
//! invocation_budget_secs = 300
//! heartbeat_secs = 25
//!
//! [reconciler]
//! sweep_interval_secs = 30
//! stale_after_secs = 300
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::events::HEARTBEAT_INTERVAL;
use crate::orchestrator::recovery::{DEFAULT_STALE_AFTER, DEFAULT_SWEEP_INTERVAL};
use crate::pipeline::DEFAULT_INVOCATION_BUDGET;
use crate::server::ServerConfig;

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    /// Port to serve on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Database location
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Bind on all interfaces and allow any origin
    #[serde(default)]
    pub dev_mode: bool,
}

fn default_port() -> u16 {
    4090
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".gantry/gantry.db")
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            db_path: default_db_path(),
            dev_mode: false,
        }
    }
}

/// Pipeline engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    /// Wall-clock budget for one pipeline invocation, in seconds
    #[serde(default = "default_invocation_budget_secs")]
    pub invocation_budget_secs: u64,
    /// Interval between heartbeat frames on open progress streams, in seconds
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
}

fn default_invocation_budget_secs() -> u64 {
    DEFAULT_INVOCATION_BUDGET.as_secs()
}

fn default_heartbeat_secs() -> u64 {
    HEARTBEAT_INTERVAL.as_secs()
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            invocation_budget_secs: default_invocation_budget_secs(),
            heartbeat_secs: default_heartbeat_secs(),
        }
    }
}

/// Reconciliation sweep settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerSection {
    /// Seconds between sweeps over the job table
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Seconds of silence after which a running job is presumed lost
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

fn default_sweep_interval_secs() -> u64 {
    DEFAULT_SWEEP_INTERVAL.as_secs()
}

fn default_stale_after_secs() -> u64 {
    DEFAULT_STALE_AFTER.as_secs()
}

impl Default for ReconcilerSection {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval_secs(),
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

/// The complete gantry.toml configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GantryToml {
    /// HTTP server settings
    #[serde(default)]
    pub server: ServerSection,
    /// Pipeline engine settings
    #[serde(default)]
    pub pipeline: PipelineSection,
    /// Reconciliation sweep settings
    #[serde(default)]
    pub reconciler: ReconcilerSection,
}

impl GantryToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse gantry.toml")
    }

    /// Load configuration from `gantry.toml` in the given directory.
    /// Returns default configuration if the file doesn't exist.
    pub fn load_or_default(dir: &Path) -> Result<Self> {
        let config_path = dir.join("gantry.toml");
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize gantry.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }
}

/// CLI overrides for `gantry serve`. `None` falls through to the
/// environment and file layers.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub port: Option<u16>,
    pub db_path: Option<PathBuf>,
    pub invocation_budget_secs: Option<u64>,
    pub heartbeat_secs: Option<u64>,
    pub sweep_interval_secs: Option<u64>,
    pub stale_after_secs: Option<u64>,
    pub dev: bool,
}

/// Merge the configuration layers into a runnable server config.
pub fn resolve(toml: GantryToml, cli: CliOverrides) -> Result<ServerConfig> {
    let port = match cli.port {
        Some(port) => port,
        None => env_parse("GANTRY_PORT")?.unwrap_or(toml.server.port),
    };
    let db_path = cli
        .db_path
        .or_else(|| std::env::var("GANTRY_DB_PATH").ok().map(PathBuf::from))
        .unwrap_or(toml.server.db_path);
    let budget_secs = match cli.invocation_budget_secs {
        Some(secs) => secs,
        None => env_parse("GANTRY_BUDGET_SECS")?.unwrap_or(toml.pipeline.invocation_budget_secs),
    };
    let heartbeat_secs = match cli.heartbeat_secs {
        Some(secs) => secs,
        None => env_parse("GANTRY_HEARTBEAT_SECS")?.unwrap_or(toml.pipeline.heartbeat_secs),
    };
    let sweep_secs = match cli.sweep_interval_secs {
        Some(secs) => secs,
        None => env_parse("GANTRY_SWEEP_SECS")?.unwrap_or(toml.reconciler.sweep_interval_secs),
    };
    let stale_secs = match cli.stale_after_secs {
        Some(secs) => secs,
        None => env_parse("GANTRY_STALE_SECS")?.unwrap_or(toml.reconciler.stale_after_secs),
    };
    let dev_mode = cli.dev || env_flag("GANTRY_DEV_MODE") || toml.server.dev_mode;

    Ok(ServerConfig {
        port,
        db_path,
        invocation_budget: Duration::from_secs(budget_secs),
        heartbeat: Duration::from_secs(heartbeat_secs),
        sweep_interval: Duration::from_secs(sweep_secs),
        stale_after: Duration::from_secs(stale_secs),
        dev_mode,
    })
}

/// Parse an environment variable if set. A set-but-unparseable value is
/// an error, not a silent fallthrough to the next layer.
fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow!("Invalid {}: {}", name, e)),
        Err(_) => Ok(None),
    }
}

fn env_flag(name: &str) -> bool {
    match std::env::var(name) {
        Ok(val) => val != "false" && val != "0" && !val.is_empty(),
        Err(_) => false,
    }
}

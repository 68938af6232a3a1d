//! # sync-sim
//!
//! Simulator and inspection tool for the Linkwise sync engine.
//!
//! ## Commands
//!
//! - `simulate`: Push synthetic operations through the engine over a mock link
//! - `pending`: List operations persisted in a SQLite pending store
//! - `schedule`: Show the power level and update intervals for a device state
//!
//! ## Example
//!
//! ```bash
//! # Forty operations on a half-charged device, one in five sends dropped
//! sync-sim simulate --ops 40 --battery 0.5 --drop-rate 0.2
//!
//! # What would a hot phone in low-power mode do?
//! sync-sim schedule --battery 0.6 --thermal serious --low-power
//!
//! # Inspect what survived the last run
//! sync-sim pending --db ./linkwise-sync.db
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use linkwise_sync_client::SyncConfig;
use linkwise_sync_types::ThermalState;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

mod commands;

use commands::{pending, schedule, simulate};

/// Simulator and inspection tool for the Linkwise sync engine.
#[derive(Parser, Debug)]
#[command(name = "sync-sim")]
#[command(version, about, long_about = None)]
struct Cli {
    /// TOML configuration file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run synthetic operations through the engine over a mock link
    Simulate {
        /// Number of operations to submit
        #[arg(long, default_value = "20")]
        ops: usize,

        /// Battery level in [0, 1]
        #[arg(long, default_value = "1.0")]
        battery: f32,

        /// Thermal state (nominal, fair, serious, critical)
        #[arg(long, default_value = "nominal", value_parser = parse_thermal)]
        thermal: ThermalState,

        /// OS low-power mode
        #[arg(long)]
        low_power: bool,

        /// Fraction of first send attempts the link drops
        #[arg(long, default_value = "0.0")]
        drop_rate: f64,

        /// Payload size per operation in bytes
        #[arg(long, default_value = "2048")]
        payload_bytes: usize,

        /// Seconds to wait for outstanding operations before reporting
        #[arg(long, default_value = "10")]
        wait_secs: u64,

        /// Persist pending operations to this SQLite file instead of memory
        #[arg(long)]
        db: Option<PathBuf>,
    },

    /// List operations persisted in a SQLite pending store
    Pending {
        /// SQLite database file
        #[arg(long)]
        db: Option<PathBuf>,
    },

    /// Show the power level and update intervals for a device state
    Schedule {
        /// Battery level in [0, 1]
        #[arg(long)]
        battery: f32,

        /// Thermal state (nominal, fair, serious, critical)
        #[arg(long, default_value = "nominal", value_parser = parse_thermal)]
        thermal: ThermalState,

        /// OS low-power mode
        #[arg(long)]
        low_power: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Simulate {
            ops,
            battery,
            thermal,
            low_power,
            drop_rate,
            payload_bytes,
            wait_secs,
            db,
        } => {
            if !(0.0..=1.0).contains(&drop_rate) {
                anyhow::bail!("--drop-rate must be between 0 and 1");
            }
            let options = simulate::SimulateOptions {
                ops,
                battery,
                thermal,
                low_power,
                drop_rate,
                payload_bytes,
                wait: std::time::Duration::from_secs(wait_secs),
                db,
            };
            simulate::run(config, options, cli.json).await?;
        }
        Commands::Pending { db } => {
            let db = match db {
                Some(path) => path,
                None => default_db_path()?,
            };
            pending::run(&db, cli.json).await?;
        }
        Commands::Schedule {
            battery,
            thermal,
            low_power,
        } => {
            schedule::run(&config, battery, thermal, low_power, cli.json)?;
        }
    }

    Ok(())
}

fn parse_thermal(s: &str) -> Result<ThermalState, String> {
    s.parse().map_err(|e: linkwise_sync_types::SyncError| e.to_string())
}

/// Load the engine configuration.
///
/// An explicit path must exist. Without one, the platform config file is
/// used when present, otherwise defaults.
fn load_config(path: Option<&Path>) -> Result<SyncConfig> {
    if let Some(path) = path {
        return SyncConfig::from_file(path).context("Failed to load configuration");
    }

    let Some(dirs) = project_dirs() else {
        return Ok(SyncConfig::default());
    };
    let default_path = dirs.config_dir().join("config.toml");
    if default_path.exists() {
        SyncConfig::from_file(&default_path).context("Failed to load configuration")
    } else {
        Ok(SyncConfig::default())
    }
}

/// Default location of the pending store database.
fn default_db_path() -> Result<PathBuf> {
    let dirs = project_dirs().context("Could not determine home directory")?;
    Ok(dirs.data_dir().join("linkwise-sync.db"))
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("io", "linkwise", "sync-sim")
}

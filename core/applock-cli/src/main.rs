//! applock: command-line harness for the App Lock engine.
//!
//! Runs the same decision engine the Android host links against, with a
//! virtual clock, so lock behaviour can be reproduced from a script.
//!
//! ## Subcommands
//!
//! - `replay`: Feed a JSON-lines script (file or stdin) through the engine
//! - `show-config`: Print the effective engine config and registry

mod logging;
mod replay;
mod show_config;

use applock_core::{load_engine_config_or_default, RegistryData, StorageConfig};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use fs_err as fs;
use std::io::{self, BufReader};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "applock")]
#[command(about = "App Lock engine harness")]
#[command(version)]
struct Cli {
    /// Data directory holding engine.json, registry.json and logs
    /// (default: ~/.applock)
    #[arg(long, global = true, value_name = "DIR")]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a detection script and print one JSON line per step
    Replay {
        /// Script path, or `-` for stdin
        #[arg(value_name = "SCRIPT", default_value = "-")]
        script: String,

        /// Virtual start time (RFC 3339); defaults to the Unix epoch
        #[arg(long)]
        start: Option<DateTime<Utc>>,
    },

    /// Print the effective engine config and registry
    ShowConfig,
}

fn main() {
    let cli = Cli::parse();
    let storage = cli
        .root
        .map(StorageConfig::with_root)
        .unwrap_or_default();
    let _logging_guard = logging::init(&storage);

    match cli.command {
        Commands::Replay { script, start } => {
            if let Err(e) = run_replay(&storage, &script, start) {
                tracing::error!(error = %e, "applock replay failed");
                eprintln!("applock replay: {e}");
                std::process::exit(1);
            }
        }
        Commands::ShowConfig => {
            if let Err(e) = show_config::run(&storage, io::stdout().lock()) {
                tracing::error!(error = %e, "applock show-config failed");
                eprintln!("applock show-config: {e}");
                std::process::exit(1);
            }
        }
    }
}

fn run_replay(
    storage: &StorageConfig,
    script: &str,
    start: Option<DateTime<Utc>>,
) -> Result<(), replay::ReplayError> {
    let config = load_engine_config_or_default(&storage.engine_config_file());
    let registry = RegistryData::load(&storage.registry_file()).unwrap_or_else(|err| {
        tracing::warn!(error = %err, "Using empty registry");
        RegistryData::default()
    });
    let start = start.unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
    let replay = replay::Replay::new(registry, config, start);

    let stdout = io::stdout().lock();
    let steps = if script == "-" {
        replay.run(io::stdin().lock(), stdout)?
    } else {
        replay.run(BufReader::new(fs::File::open(script)?), stdout)?
    };
    tracing::info!(steps, script, "Replay finished");
    Ok(())
}

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "rehome",
    version,
    about = "Move local application data from the legacy store to the new store, safely."
)]
pub struct Cli {
    /// Data directory (defaults to ~/.rehome)
    #[arg(long, global = true, value_name = "DIR")]
    pub data_dir: Option<PathBuf>,
    /// Legacy JSON store (defaults to <data-dir>/legacy.json)
    #[arg(long, global = true, value_name = "FILE")]
    pub legacy: Option<PathBuf>,
    #[arg(long, global = true)]
    pub debug: bool,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the migration if it is due
    Migrate(MigrateArgs),
    /// Retry a failed migration (subject to cooldowns)
    Retry,
    /// Show marker, lease, progress and history
    Status(StatusArgs),
    Snapshots(SnapshotsArgs),
    /// Clear the stuck flag after fixing the underlying problem
    Resolve,
    Config(ConfigArgs),
}

#[derive(Args)]
pub struct MigrateArgs {
    /// When another process is migrating, follow it for up to this many seconds
    #[arg(long, value_name = "SECS")]
    pub wait: Option<u64>,
}

#[derive(Args)]
pub struct StatusArgs {
    #[arg(long)]
    pub json: bool,
}

#[derive(Args)]
pub struct SnapshotsArgs {
    #[command(subcommand)]
    pub command: SnapshotCommands,
}

#[derive(Subcommand)]
pub enum SnapshotCommands {
    List,
    /// Put the new store back to a retained snapshot
    Restore {
        id: String,
        #[arg(long)]
        yes: bool,
    },
    /// Delete a retained snapshot
    Prune {
        id: String,
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,
    /// Write the default configuration file
    Init {
        #[arg(long)]
        force: bool,
    },
}

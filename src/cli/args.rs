//! CLI argument definitions using clap derive

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use crate::config::Channel;
use clap_complete::Shell;
use std::path::PathBuf;

/// byoe - rolling snapshots of multi-ecosystem software stacks
///
/// Resolves environment specifications with Spack, uv and micromamba,
/// builds what is missing locally or through Slurm, and publishes the
/// result as an immutable, reproducible snapshot.
#[derive(Parser, Debug)]
#[command(name = "byoe")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Site configuration file path
    #[arg(short, long, global = true, env = "BYOE_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the storage layout and a starter byoe.toml
    InitDir(InitDirArgs),

    /// Build a new snapshot and publish it if it validates
    Update(UpdateArgs),

    /// List snapshots and their status
    Snapshots(SnapshotsArgs),

    /// Show the lock records of a snapshot
    Show(ShowArgs),

    /// Inspect or garbage-collect the build cache
    Cache(CacheArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

#[derive(Parser, Debug)]
pub struct InitDirArgs {
    /// Overwrite an existing byoe.toml
    #[arg(short, long)]
    pub force: bool,

    /// Installation root (defaults to the configured base_dir)
    #[arg(long)]
    pub base_dir: Option<PathBuf>,
}

#[derive(Parser, Debug)]
pub struct UpdateArgs {
    /// Label for the snapshot id, e.g. `rc` gives `<timestamp>.rc0`
    #[arg(short, long)]
    pub label: Option<String>,

    /// Only build these environments
    #[arg(long, num_args = 1..)]
    pub only: Vec<String>,
}

#[derive(Parser, Debug)]
pub struct SnapshotsArgs {
    #[arg(short, long, value_enum, default_value = "table")]
    pub format: OutputFormat,
}

#[derive(Parser, Debug)]
pub struct ShowArgs {
    /// Snapshot id (defaults to the channel's current snapshot)
    pub snap_id: Option<String>,

    /// Pick the snapshot this channel's update period selects instead
    #[arg(long, conflicts_with = "snap_id")]
    pub channel: Option<Channel>,

    #[arg(short, long, value_enum, default_value = "table")]
    pub format: OutputFormat,
}

#[derive(Parser, Debug)]
pub struct CacheArgs {
    #[command(subcommand)]
    pub action: CacheAction,
}

#[derive(Subcommand, Debug)]
pub enum CacheAction {
    /// List cached artifacts
    List {
        #[arg(short, long, value_enum, default_value = "table")]
        format: OutputFormat,
    },

    /// Remove artifacts no full snapshot references
    Gc {
        /// Show what would be removed without removing it
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Parser, Debug)]
pub struct CompletionsArgs {
    #[arg(value_enum)]
    pub shell: Shell,
}

/// Output format for listing commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
    Plain,
}

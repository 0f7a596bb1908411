use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use walcast_config::SinkKind;

#[derive(Parser)]
#[command(name = "walcast")]
#[command(about = "Stream PostgreSQL row changes over logical replication")]
#[command(version)]
pub struct Cli {
    /// Path to walcast.toml config file
    #[arg(short, long, global = true, default_value = "walcast.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create walcast.toml and .env.example
    Init {
        /// Directory to initialize (defaults to current directory)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Create a slot and stream changes until interrupted
    Run(RunArgs),

    /// Inspect and clean up replication slots
    Slots {
        #[command(subcommand)]
        command: SlotsCommands,
    },
}

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Prefix for the generated slot name (overrides [slot].prefix)
    #[arg(long)]
    pub slot_prefix: Option<String>,

    /// Use a fixed slot name instead of a generated one
    #[arg(long)]
    pub slot: Option<String>,

    /// Where decoded events go (overrides [dispatch].sink)
    #[arg(long, value_enum)]
    pub sink: Option<SinkArg>,

    /// Start position, e.g. 0/16B3748 (overrides [stream].start_lsn)
    #[arg(long)]
    pub start_lsn: Option<String>,
}

#[derive(Subcommand)]
pub enum SlotsCommands {
    /// List slots carrying the configured prefix
    List,

    /// Drop one slot
    Drop {
        /// Slot name
        name: String,
    },

    /// Drop every inactive slot carrying the configured prefix
    Prune {
        /// Skip the confirmation prompt
        #[arg(long, short)]
        yes: bool,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum SinkArg {
    /// One log line per event
    Log,
    /// JSON lines on stdout
    Json,
}

impl From<SinkArg> for SinkKind {
    fn from(arg: SinkArg) -> Self {
        match arg {
            SinkArg::Log => SinkKind::Log,
            SinkArg::Json => SinkKind::Json,
        }
    }
}

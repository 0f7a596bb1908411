use anyhow::Result;
use clap::Parser;
use tracing::debug;

mod cli;
mod commands;
mod config;
mod env;

use cli::{Cli, Commands, SlotsCommands};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("walcast=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    // A .env file is optional; the environment may already carry DATABASE_URL.
    if let Err(e) = env::load_dotenv_from_ancestors() {
        debug!(error = %e, "No .env file loaded");
    }

    match cli.command {
        Commands::Init { path } => commands::cmd_init(&path),
        Commands::Run(args) => {
            let config = config::load_config(&cli.config)?;
            commands::cmd_run(config, args).await
        }
        Commands::Slots { command } => {
            let config = config::load_config(&cli.config)?;
            match command {
                SlotsCommands::List => commands::cmd_slots_list(&config).await,
                SlotsCommands::Drop { name } => commands::cmd_slots_drop(&config, &name).await,
                SlotsCommands::Prune { yes } => commands::cmd_slots_prune(&config, yes).await,
            }
        }
    }
}

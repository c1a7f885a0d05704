use anyhow::Result;
use clap::Parser;

mod cli;
mod config_cmds;
mod network;
mod simulate;

use cli::{Cli, Commands, ConfigCommands};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing (output to stderr, initialize only once)
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init()
        .ok();

    let cli = Cli::parse();
    let output_format = cli.format;

    match cli.command {
        Commands::Simulate(args) => {
            simulate::handle_simulate(args, output_format).await?;
        }
        Commands::Config { cmd } => match cmd {
            ConfigCommands::Init { path, force } => {
                config_cmds::handle_config_init(path, force)?;
            }
            ConfigCommands::Validate { path } => {
                config_cmds::handle_config_validate(path)?;
            }
            ConfigCommands::Show { path } => {
                config_cmds::handle_config_show(path, output_format)?;
            }
        },
    }

    Ok(())
}

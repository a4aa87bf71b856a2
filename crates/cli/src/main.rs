mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;
use raibid_common::AgentConfig;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands, ConfigSubcommand, LogFormat};

fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Initialize logging
    setup_logging(cli.log_format)?;

    // Load configuration; flags and env vars are applied per command
    let mut config = AgentConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Start(args) => {
            args.settings.apply(&mut config);
            tokio::runtime::Runtime::new()?.block_on(commands::start::execute(config))
        }
        Commands::Config(cmd) => match cmd.command {
            ConfigSubcommand::Show { settings } => {
                settings.apply(&mut config);
                commands::config::show(&config)
            }
        },
    }
}

fn setup_logging(format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }

    Ok(())
}

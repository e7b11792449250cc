use clap::Parser;
use tracing_subscriber::EnvFilter;

use ab_agent::cli::{Cli, Command, ConfigCommand};
use ab_agent::config::{LogFormat, LoggingConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // Default to run when no subcommand is given.
        None | Some(Command::Run) => {
            let (config, config_path) = ab_agent::cli::load_config()?;
            init_tracing(&config.logging);
            tracing::debug!(config_path = %config_path, "configuration loaded");
            ab_agent::app::run(config).await
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            init_cli_tracing();
            let (config, config_path) = ab_agent::cli::load_config()?;
            let valid = ab_agent::cli::config::validate(&config, &config_path);
            if !valid {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            init_cli_tracing();
            let (config, _config_path) = ab_agent::cli::load_config()?;
            ab_agent::cli::config::show(&config)
        }
        Some(Command::Version) => {
            println!(
                "agent-bridge {} (protocol {})",
                env!("CARGO_PKG_VERSION"),
                ab_bridge::ab_protocol::PROTOCOL_VERSION,
            );
            Ok(())
        }
    }
}

/// Initialize tracing for the long-running `run` command.
///
/// `RUST_LOG` overrides `logging.filter` when set.
fn init_tracing(logging: &LoggingConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.filter));

    match logging.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .json()
            .init(),
        LogFormat::Compact => tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .compact()
            .init(),
    }
}

/// Minimal stderr logging for one-shot subcommands.
fn init_cli_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

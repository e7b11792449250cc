pub mod config;

use clap::{Parser, Subcommand};

use crate::config::{AgentConfig, CONFIG_PATH_ENV, DEFAULT_CONFIG_PATH};

/// agent-bridge: keeps an agent connected to its coordinator.
#[derive(Debug, Parser)]
#[command(name = "agent-bridge", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Connect and serve requests (default when no subcommand is given).
    Run,
    /// Configuration utilities.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print version information.
    Version,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Parse the config file and report any errors.
    Validate,
    /// Dump the resolved configuration (with defaults) as TOML.
    Show,
}

// ── Config loading helper ─────────────────────────────────────────────

/// Load the configuration from the path in `AB_CONFIG` (or
/// `agent-bridge.toml`), falling back to defaults when the file does not
/// exist, then apply environment overrides. Returns the config and the
/// path that was used.
pub fn load_config() -> anyhow::Result<(AgentConfig, String)> {
    let config_path =
        std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
    let config = load_from(&config_path, |k| std::env::var(k).ok())?;
    Ok((config, config_path))
}

/// [`load_config`] with an explicit path and environment.
pub fn load_from(
    config_path: &str,
    lookup: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<AgentConfig> {
    let mut config = if std::path::Path::new(config_path).exists() {
        let raw = std::fs::read_to_string(config_path)
            .map_err(|e| anyhow::anyhow!("reading {config_path}: {e}"))?;
        AgentConfig::from_toml(&raw).map_err(|e| anyhow::anyhow!("parsing {config_path}: {e}"))?
    } else {
        AgentConfig::default()
    };
    config.apply_env_overrides(lookup);
    Ok(config)
}

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Executions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionsConfig {
    /// Upper bound on executions running at once.
    #[serde(default = "d_max_concurrent")]
    pub max_concurrent: usize,
    /// Budget for re-declaring sessions after a reconnect.
    #[serde(default = "d_restore_timeout_secs")]
    pub restore_timeout_secs: u64,
    /// Upper bound on each reconnect listener.
    #[serde(default = "d_listener_timeout_secs")]
    pub listener_timeout_secs: u64,
}

impl Default for ExecutionsConfig {
    fn default() -> Self {
        Self {
            max_concurrent: d_max_concurrent(),
            restore_timeout_secs: d_restore_timeout_secs(),
            listener_timeout_secs: d_listener_timeout_secs(),
        }
    }
}

fn d_max_concurrent() -> usize {
    ab_bridge::router::DEFAULT_MAX_CONCURRENT
}
fn d_restore_timeout_secs() -> u64 {
    ab_bridge::restore::SESSION_RESTORE_TIMEOUT.as_secs()
}
fn d_listener_timeout_secs() -> u64 {
    30
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// CLI commands
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliConfig {
    /// Advertise and serve `cli_request`.
    #[serde(default)]
    pub enabled: bool,
    /// Program names the coordinator may run. Empty allows any.
    #[serde(default)]
    pub allowed_commands: Vec<String>,
    /// Used when the request carries no `timeout_secs`.
    #[serde(default = "d_cli_timeout_secs")]
    pub default_timeout_secs: u64,
    /// Per-stream cap on captured output.
    #[serde(default = "d_max_output_bytes")]
    pub max_output_bytes: usize,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            allowed_commands: Vec::new(),
            default_timeout_secs: d_cli_timeout_secs(),
            max_output_bytes: d_max_output_bytes(),
        }
    }
}

fn d_cli_timeout_secs() -> u64 {
    300
}
fn d_max_output_bytes() -> usize {
    256 * 1024
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Serve mode
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServeConfig {
    /// Program started on `mcp_serve_start`. Serve mode is disabled
    /// when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    /// Host reported in `mcp_serve_ready`.
    #[serde(default = "d_serve_host")]
    pub host: String,
    /// Used when the request carries no port.
    #[serde(default = "d_serve_port")]
    pub port: u16,
    /// Let `mcp_serve_start` replace the program and append arguments.
    #[serde(default)]
    pub allow_request_command: bool,
    /// A child that exits within this window counts as a failed start.
    #[serde(default = "d_startup_grace_ms")]
    pub startup_grace_ms: u64,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            host: d_serve_host(),
            port: d_serve_port(),
            allow_request_command: false,
            startup_grace_ms: d_startup_grace_ms(),
        }
    }
}

fn d_serve_host() -> String {
    "127.0.0.1".into()
}
fn d_serve_port() -> u16 {
    7001
}
fn d_startup_grace_ms() -> u64 {
    500
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Logging
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Compact,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
    /// `EnvFilter` directives; `RUST_LOG` wins when set.
    #[serde(default = "d_log_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            filter: d_log_filter(),
        }
    }
}

fn d_log_filter() -> String {
    "info,ab_bridge=debug".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_disabled_by_default() {
        let cfg = CliConfig::default();
        assert!(!cfg.enabled);
        assert!(cfg.allowed_commands.is_empty());
    }

    #[test]
    fn log_format_parses_lowercase() {
        let cfg: LoggingConfig = toml::from_str(r#"format = "compact""#).unwrap();
        assert_eq!(cfg.format, LogFormat::Compact);
        assert_eq!(cfg.filter, "info,ab_bridge=debug");
    }

    #[test]
    fn serve_without_command_omits_it() {
        let out = toml::to_string(&ServeConfig::default()).unwrap();
        assert!(!out.lines().any(|l| l.starts_with("command ")));
    }
}

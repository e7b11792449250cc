mod connection;
mod runtime;

pub use connection::*;
pub use runtime::*;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Environment variable naming the config file.
pub const CONFIG_PATH_ENV: &str = "AB_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "agent-bridge.toml";
/// Overrides `connection.url`.
pub const GATEWAY_URL_ENV: &str = "AB_GATEWAY_URL";
/// Overrides `connection.agent_id`.
pub const AGENT_ID_ENV: &str = "AB_AGENT_ID";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentConfig {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub reconnect: ReconnectSection,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub executions: ExecutionsConfig,
    #[serde(default)]
    pub cli: CliConfig,
    #[serde(default)]
    pub serve: ServeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigError {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl ConfigError {
    fn error(field: &str, message: impl Into<String>) -> Self {
        Self {
            severity: ConfigSeverity::Error,
            field: field.into(),
            message: message.into(),
        }
    }

    fn warning(field: &str, message: impl Into<String>) -> Self {
        Self {
            severity: ConfigSeverity::Warning,
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl AgentConfig {
    /// Parse a TOML document.
    pub fn from_toml(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    /// Apply `AB_GATEWAY_URL` / `AB_AGENT_ID` from `lookup`.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(GATEWAY_URL_ENV).filter(|v| !v.trim().is_empty()) {
            self.connection.url = url;
        }
        if let Some(id) = lookup(AGENT_ID_ENV).filter(|v| !v.trim().is_empty()) {
            self.connection.agent_id = id;
        }
    }

    /// Validate the configuration and return a list of issues.
    ///
    /// `lookup` resolves the secret environment variables so a malformed
    /// signing secret is caught before connecting.
    pub fn validate(&self, lookup: impl Fn(&str) -> Option<String>) -> Vec<ConfigError> {
        let mut errors = Vec::new();
        let conn = &self.connection;

        if !(conn.url.starts_with("ws://") || conn.url.starts_with("wss://")) {
            errors.push(ConfigError::error(
                "connection.url",
                format!("must use ws:// or wss://, got {:?}", conn.url),
            ));
        }
        if conn.agent_id.trim().is_empty() {
            errors.push(ConfigError::error("connection.agent_id", "must not be empty"));
        }
        for (field, value) in [
            ("connection.heartbeat_interval_secs", conn.heartbeat_interval_secs),
            ("connection.connect_timeout_secs", conn.connect_timeout_secs),
            ("connection.handshake_timeout_secs", conn.handshake_timeout_secs),
            ("connection.write_timeout_secs", conn.write_timeout_secs),
            ("connection.ping_timeout_secs", conn.ping_timeout_secs),
        ] {
            if value == 0 {
                errors.push(ConfigError::error(field, "must be greater than 0"));
            }
        }
        if conn.max_frame_bytes == 0 {
            errors.push(ConfigError::error("connection.max_frame_bytes", "must be greater than 0"));
        }
        if conn.url.starts_with("ws://") && lookup(&conn.token_env).is_some() {
            errors.push(ConfigError::warning(
                "connection.url",
                "token is sent over an unencrypted ws:// connection",
            ));
        }

        let rc = &self.reconnect;
        if rc.initial_delay_ms == 0 {
            errors.push(ConfigError::error("reconnect.initial_delay_ms", "must be greater than 0"));
        }
        if rc.max_delay_ms < rc.initial_delay_ms {
            errors.push(ConfigError::error(
                "reconnect.max_delay_ms",
                "must be at least reconnect.initial_delay_ms",
            ));
        }
        if !rc.multiplier.is_finite() || rc.multiplier < 1.0 {
            errors.push(ConfigError::error("reconnect.multiplier", "must be >= 1.0"));
        }

        if self.network.monitor && self.network.poll_interval_secs == 0 {
            errors.push(ConfigError::error("network.poll_interval_secs", "must be greater than 0"));
        }

        if let Some(secret) = lookup(&self.security.signing_secret_env) {
            if hex::decode(secret.trim()).map_or(true, |b| b.is_empty()) {
                errors.push(ConfigError::error(
                    "security.signing_secret_env",
                    format!("{} is not a non-empty hex string", self.security.signing_secret_env),
                ));
            }
        }

        if self.executions.max_concurrent == 0 {
            errors.push(ConfigError::error("executions.max_concurrent", "must be greater than 0"));
        }

        if self.cli.enabled {
            if self.cli.default_timeout_secs == 0 {
                errors.push(ConfigError::error("cli.default_timeout_secs", "must be greater than 0"));
            }
            if self.cli.allowed_commands.is_empty() {
                errors.push(ConfigError::warning(
                    "cli.allowed_commands",
                    "empty: the coordinator may run any program",
                ));
            }
        }

        if let Some(cmd) = &self.serve.command {
            if cmd.trim().is_empty() {
                errors.push(ConfigError::error("serve.command", "must not be blank"));
            }
            if self.serve.port == 0 {
                errors.push(ConfigError::error("serve.port", "must be greater than 0"));
            }
        } else if self.serve.allow_request_command {
            errors.push(ConfigError::warning(
                "serve.allow_request_command",
                "has no effect without serve.command",
            ));
        }

        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    fn errors_for(cfg: &AgentConfig, lookup: impl Fn(&str) -> Option<String>) -> Vec<String> {
        cfg.validate(lookup)
            .into_iter()
            .filter(|e| e.severity == ConfigSeverity::Error)
            .map(|e| e.field)
            .collect()
    }

    #[test]
    fn defaults_are_valid() {
        assert!(errors_for(&AgentConfig::default(), env(&[])).is_empty());
    }

    #[test]
    fn env_overrides_win_over_file() {
        let mut cfg = AgentConfig::default();
        cfg.apply_env_overrides(env(&[
            (GATEWAY_URL_ENV, "wss://coord.example.com/agent/ws"),
            (AGENT_ID_ENV, "ci-runner-2"),
        ]));
        assert_eq!(cfg.connection.url, "wss://coord.example.com/agent/ws");
        assert_eq!(cfg.connection.agent_id, "ci-runner-2");
    }

    #[test]
    fn blank_env_override_is_ignored() {
        let mut cfg = AgentConfig::default();
        cfg.apply_env_overrides(env(&[(AGENT_ID_ENV, "  ")]));
        assert_eq!(cfg.connection.agent_id, "agent-bridge");
    }

    #[test]
    fn zero_intervals_are_errors() {
        let mut cfg = AgentConfig::default();
        cfg.connection.heartbeat_interval_secs = 0;
        cfg.network.poll_interval_secs = 0;
        let fields = errors_for(&cfg, env(&[]));
        assert!(fields.contains(&"connection.heartbeat_interval_secs".to_string()));
        assert!(fields.contains(&"network.poll_interval_secs".to_string()));
    }

    #[test]
    fn disabled_monitor_ignores_poll_interval() {
        let mut cfg = AgentConfig::default();
        cfg.network.monitor = false;
        cfg.network.poll_interval_secs = 0;
        assert!(errors_for(&cfg, env(&[])).is_empty());
    }

    #[test]
    fn multiplier_below_one_is_error() {
        let mut cfg = AgentConfig::default();
        cfg.reconnect.multiplier = 0.5;
        assert_eq!(errors_for(&cfg, env(&[])), vec!["reconnect.multiplier"]);
    }

    #[test]
    fn inverted_delays_are_error() {
        let mut cfg = AgentConfig::default();
        cfg.reconnect.initial_delay_ms = 5_000;
        cfg.reconnect.max_delay_ms = 1_000;
        assert_eq!(errors_for(&cfg, env(&[])), vec!["reconnect.max_delay_ms"]);
    }

    #[test]
    fn malformed_signing_secret_is_error() {
        let cfg = AgentConfig::default();
        let fields = errors_for(&cfg, env(&[("AB_SIGNING_SECRET", "zz-not-hex")]));
        assert_eq!(fields, vec!["security.signing_secret_env"]);
        assert!(errors_for(&cfg, env(&[("AB_SIGNING_SECRET", "736563726574")])).is_empty());
    }

    #[test]
    fn non_websocket_url_is_error() {
        let mut cfg = AgentConfig::default();
        cfg.connection.url = "https://coord.example.com".into();
        assert_eq!(errors_for(&cfg, env(&[])), vec!["connection.url"]);
    }

    #[test]
    fn plaintext_token_is_warning() {
        let cfg = AgentConfig::default();
        let issues = cfg.validate(env(&[("AB_AGENT_TOKEN", "t0k3n")]));
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].severity, ConfigSeverity::Warning);
        assert!(issues[0].to_string().starts_with("[WARN] connection.url"));
    }
}

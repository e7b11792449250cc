use ab_agent::cli::load_from;
use ab_agent::config::{AgentConfig, LogFormat};

#[test]
fn default_url_is_local_websocket() {
    let config = AgentConfig::default();
    assert_eq!(config.connection.url, "ws://127.0.0.1:3210/agent/ws");
}

#[test]
fn default_secret_env_names() {
    let config = AgentConfig::default();
    assert_eq!(config.connection.token_env, "AB_AGENT_TOKEN");
    assert_eq!(config.security.signing_secret_env, "AB_SIGNING_SECRET");
}

#[test]
fn default_reconnect_is_unlimited() {
    let config = AgentConfig::default();
    assert_eq!(config.reconnect.max_attempts, 0);
    assert_eq!(config.reconnect.initial_delay_ms, 1_000);
    assert_eq!(config.reconnect.max_delay_ms, 120_000);
}

#[test]
fn empty_file_is_all_defaults() {
    let config: AgentConfig = toml::from_str("").unwrap();
    assert_eq!(config.connection.heartbeat_interval_secs, 30);
    assert!(config.network.monitor);
    assert_eq!(config.logging.format, LogFormat::Json);
    assert!(config.serve.command.is_none());
}

#[test]
fn sections_parse() {
    let toml_str = r#"
[connection]
url = "wss://coord.example.com/agent/ws"
agent_id = "build-box-3"

[reconnect]
initial_delay_ms = 500
max_attempts = 12

[network]
monitor = false

[cli]
enabled = true
allowed_commands = ["git", "cargo"]

[serve]
command = "mcp-server"
args = ["--stdio"]
port = 7100

[logging]
format = "compact"
"#;
    let config: AgentConfig = toml::from_str(toml_str).unwrap();
    assert_eq!(config.connection.agent_id, "build-box-3");
    assert_eq!(config.reconnect.initial_delay_ms, 500);
    assert_eq!(config.reconnect.max_attempts, 12);
    assert!(!config.network.monitor);
    assert_eq!(config.cli.allowed_commands, vec!["git", "cargo"]);
    assert_eq!(config.serve.port, 7100);
    assert_eq!(config.logging.format, LogFormat::Compact);
}

#[test]
fn load_from_file_applies_env_overrides() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("agent-bridge.toml");
    std::fs::write(
        &path,
        "[connection]\nurl = \"wss://file.example.com/ws\"\nagent_id = \"from-file\"\n",
    )
    .unwrap();

    let config = load_from(path.to_str().unwrap(), |k| {
        (k == "AB_AGENT_ID").then(|| "from-env".to_string())
    })
    .unwrap();
    assert_eq!(config.connection.url, "wss://file.example.com/ws");
    assert_eq!(config.connection.agent_id, "from-env");
}

#[test]
fn malformed_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.toml");
    std::fs::write(&path, "[connection\nurl = 3").unwrap();
    let err = load_from(path.to_str().unwrap(), |_| None).unwrap_err();
    assert!(err.to_string().starts_with("parsing "));
}

#[test]
fn show_output_round_trips() {
    let config = AgentConfig::default();
    let rendered = toml::to_string_pretty(&config).unwrap();
    let parsed: AgentConfig = toml::from_str(&rendered).unwrap();
    assert_eq!(parsed.connection.agent_id, config.connection.agent_id);
    assert_eq!(parsed.executions.max_concurrent, config.executions.max_concurrent);
}

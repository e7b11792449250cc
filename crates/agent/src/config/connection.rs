use std::time::Duration;

use ab_bridge::ReconnectConfig;
use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Connection
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Coordinator WebSocket endpoint. Overridden by `AB_GATEWAY_URL`.
    #[serde(default = "d_url")]
    pub url: String,
    /// Overridden by `AB_AGENT_ID`.
    #[serde(default = "d_agent_id")]
    pub agent_id: String,
    /// Environment variable holding the connection token.
    /// If the env var is unset, the agent connects without one.
    #[serde(default = "d_token_env")]
    pub token_env: String,
    #[serde(default = "d_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "d_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "d_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    #[serde(default = "d_write_timeout_secs")]
    pub write_timeout_secs: u64,
    #[serde(default = "d_ping_timeout_secs")]
    pub ping_timeout_secs: u64,
    /// Inbound frames larger than this are dropped.
    #[serde(default = "d_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: d_url(),
            agent_id: d_agent_id(),
            token_env: d_token_env(),
            heartbeat_interval_secs: d_heartbeat_interval_secs(),
            connect_timeout_secs: d_connect_timeout_secs(),
            handshake_timeout_secs: d_handshake_timeout_secs(),
            write_timeout_secs: d_write_timeout_secs(),
            ping_timeout_secs: d_ping_timeout_secs(),
            max_frame_bytes: d_max_frame_bytes(),
        }
    }
}

fn d_url() -> String {
    "ws://127.0.0.1:3210/agent/ws".into()
}
fn d_agent_id() -> String {
    "agent-bridge".into()
}
fn d_token_env() -> String {
    "AB_AGENT_TOKEN".into()
}
fn d_heartbeat_interval_secs() -> u64 {
    30
}
fn d_connect_timeout_secs() -> u64 {
    15
}
fn d_handshake_timeout_secs() -> u64 {
    10
}
fn d_write_timeout_secs() -> u64 {
    10
}
fn d_ping_timeout_secs() -> u64 {
    5
}
fn d_max_frame_bytes() -> usize {
    ab_bridge::ab_protocol::DEFAULT_MAX_FRAME_BYTES
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Reconnect
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectSection {
    #[serde(default = "d_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "d_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "d_multiplier")]
    pub multiplier: f64,
    /// `0` retries forever.
    #[serde(default)]
    pub max_attempts: u32,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            initial_delay_ms: d_initial_delay_ms(),
            max_delay_ms: d_max_delay_ms(),
            multiplier: d_multiplier(),
            max_attempts: 0,
        }
    }
}

impl ReconnectSection {
    pub fn to_reconnect_config(&self) -> ReconnectConfig {
        ReconnectConfig {
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            multiplier: self.multiplier,
            max_attempts: self.max_attempts,
        }
    }
}

fn d_initial_delay_ms() -> u64 {
    1_000
}
fn d_max_delay_ms() -> u64 {
    120_000
}
fn d_multiplier() -> f64 {
    2.0
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Network monitor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Probe the connection when local interface addresses change.
    #[serde(default = "d_true")]
    pub monitor: bool,
    #[serde(default = "d_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            monitor: true,
            poll_interval_secs: d_poll_interval_secs(),
        }
    }
}

fn d_true() -> bool {
    true
}
fn d_poll_interval_secs() -> u64 {
    ab_bridge::netmon::DEFAULT_POLL_INTERVAL.as_secs()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Security
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Environment variable holding a hex signing secret to install before
    /// the handshake. A secret delivered in `agent_connect_ack` replaces it.
    #[serde(default = "d_signing_secret_env")]
    pub signing_secret_env: String,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            signing_secret_env: d_signing_secret_env(),
        }
    }
}

fn d_signing_secret_env() -> String {
    "AB_SIGNING_SECRET".into()
}

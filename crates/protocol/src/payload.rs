//! Payload schemas, one struct per message family.
//!
//! All fields default when absent so that partially populated payloads from
//! older or newer coordinators still decode.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handshake / liveness
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// `agent_connect`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectPayload {
    #[serde(default)]
    pub agent_id: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub protocol_version: u32,
    /// Message types this agent routes.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Executions still running locally, so the coordinator can reconcile
    /// after a reconnect instead of re-dispatching them.
    #[serde(default)]
    pub active_executions: Vec<String>,
}

/// `agent_connect_ack`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectAckPayload {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub message: String,
    /// Hex-encoded HMAC secret for critical messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_secret: Option<String>,
    /// Opaque per-agent runtime configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
}

/// `agent_disconnect`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DisconnectPayload {
    #[serde(default)]
    pub agent_id: String,
    #[serde(default)]
    pub reason: String,
}

/// `heartbeat`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    #[serde(default)]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub agent_id: String,
    #[serde(default)]
    pub active_tasks: usize,
    /// Subordinate serve-mode server status (`running` / `stopped`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serve_status: Option<String>,
    /// Additional status fields attached by enrichment callbacks.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Executions (task / build / test / qa / codegen / deploy)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// `*_request`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    #[serde(default)]
    pub execution_id: String,
    /// Executor-specific request body.
    #[serde(default)]
    pub spec: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// `*_result`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    #[serde(default)]
    pub execution_id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub output: serde_json::Value,
    #[serde(default)]
    pub duration_ms: u64,
}

/// `*_error`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionError {
    #[serde(default)]
    pub execution_id: String,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub retryable: bool,
}

/// `*_progress`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionProgress {
    #[serde(default)]
    pub execution_id: String,
    /// Percentage in `[0, 100]`.
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub status: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// CLI
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// `cli_request`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CliRequest {
    #[serde(default)]
    pub execution_id: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// `cli_result`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CliResult {
    #[serde(default)]
    pub execution_id: String,
    #[serde(default)]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub duration_ms: u64,
    /// Error code when the command could not be run to completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Subordinate MCP servers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// `mcp_start`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct McpStartPayload {
    #[serde(default)]
    pub server_id: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// `mcp_ready`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct McpReadyPayload {
    #[serde(default)]
    pub server_id: String,
    #[serde(default)]
    pub info: serde_json::Value,
}

/// `mcp_stop` and `mcp_stopped`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct McpStopPayload {
    #[serde(default)]
    pub server_id: String,
}

/// `mcp_error`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct McpErrorPayload {
    #[serde(default)]
    pub server_id: String,
    #[serde(default)]
    pub error: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Computer use
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// `computer_use_start`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComputerUseStartPayload {
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// `computer_use_started`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComputerUseStartedPayload {
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub info: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `computer_use_action`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComputerUseActionPayload {
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub action_id: String,
    #[serde(default)]
    pub action: serde_json::Value,
}

/// `computer_use_result`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComputerUseResultPayload {
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub action_id: String,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub result: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `computer_use_end`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComputerUseEndPayload {
    #[serde(default)]
    pub session_id: String,
}

/// `computer_use_session`: sent after a reconnect for every live session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionDeclarationPayload {
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub started_at: DateTime<Utc>,
    /// Results about to be resent in the messages following this one.
    #[serde(default)]
    pub pending_results: usize,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Serve mode
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// `mcp_serve_start`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServeStartPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

/// `mcp_serve_ready`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServeReadyPayload {
    #[serde(default)]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

/// Serve-mode status reported in `mcp_serve_result` and heartbeats.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServeStatus {
    Running,
    #[default]
    Stopped,
    Error,
}

impl ServeStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            ServeStatus::Running => "running",
            ServeStatus::Stopped => "stopped",
            ServeStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for ServeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `mcp_serve_result`. `error` is always serialized, empty when there is none.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServeResultPayload {
    #[serde(default)]
    pub status: ServeStatus,
    #[serde(default)]
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_result_always_carries_error_field() {
        let stopped = ServeResultPayload {
            status: ServeStatus::Stopped,
            error: String::new(),
        };
        let json = serde_json::to_value(&stopped).unwrap();
        assert_eq!(json, serde_json::json!({"status": "stopped", "error": ""}));
    }

    #[test]
    fn heartbeat_enrichment_fields_flatten() {
        let mut hb = HeartbeatPayload {
            agent_id: "a1".into(),
            active_tasks: 2,
            serve_status: Some("running".into()),
            ..Default::default()
        };
        hb.extra.insert("load".into(), serde_json::json!(0.5));
        let json = serde_json::to_value(&hb).unwrap();
        assert_eq!(json["serve_status"], "running");
        assert_eq!(json["load"], 0.5);
        assert_eq!(json["active_tasks"], 2);
    }

    #[test]
    fn connect_ack_without_secret_or_config() {
        let ack: ConnectAckPayload =
            serde_json::from_str(r#"{"success": true, "message": "welcome"}"#).unwrap();
        assert!(ack.success);
        assert!(ack.signing_secret.is_none());
        assert!(ack.config.is_none());
    }

    #[test]
    fn cli_request_defaults() {
        let req: CliRequest =
            serde_json::from_str(r#"{"execution_id": "c1", "command": "ls"}"#).unwrap();
        assert!(req.args.is_empty());
        assert!(req.env.is_empty());
        assert!(req.cwd.is_none());
        assert!(req.timeout_secs.is_none());
    }
}

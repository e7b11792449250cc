//! Shared types: connection state, errors, and the callback/sink seams that
//! connect the client to the router.

use std::sync::Arc;

use ab_protocol::{codes, AgentMessage, HeartbeatPayload};
use serde::Serialize;

/// Lifecycle of the single logical connection to the coordinator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Authenticating,
    Connected,
    Reconnecting,
    /// Terminal: no further reconnection.
    Closed,
}

impl ConnectionState {
    pub const fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closed => "closed",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors an executor can return.
///
/// The router turns these into a structured `*_error` (or `cli_result`)
/// payload; [`ExecutorError::code`] gives the wire code.
#[derive(thiserror::Error, Debug, Clone)]
pub enum ExecutorError {
    #[error("invalid_request: {0}")]
    InvalidRequest(String),
    #[error("failed: {0}")]
    Failed(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl ExecutorError {
    pub fn code(&self) -> &'static str {
        match self {
            ExecutorError::InvalidRequest(_) => codes::INVALID_PAYLOAD,
            ExecutorError::Failed(_) => codes::EXECUTION_FAILED,
            ExecutorError::Timeout(_) => codes::TIMEOUT,
            ExecutorError::Cancelled(_) => codes::CANCELLED,
        }
    }
}

/// Top-level bridge error.
#[derive(thiserror::Error, Debug)]
pub enum BridgeError {
    #[error("config: {0}")]
    Config(String),
    #[error("transport: {0}")]
    Transport(String),
    #[error("handshake: {0}")]
    Handshake(String),
    #[error("not connected")]
    NotConnected,
    #[error("cannot {action} while {state}")]
    InvalidState {
        action: &'static str,
        state: ConnectionState,
    },
    #[error("connection closed")]
    Closed,
    #[error("reconnect exhausted after {0} attempts")]
    ReconnectExhausted(u32),
    #[error("signature verification failed for {msg_type} message {id}")]
    Signature { msg_type: String, id: String },
    #[error("invalid {msg_type} payload: {reason}")]
    Payload { msg_type: String, reason: String },
    #[error("duplicate: {0}")]
    Duplicate(String),
    #[error("executor: {0}")]
    Executor(#[from] ExecutorError),
    #[error("protocol: {0}")]
    Protocol(String),
    #[error("cancelled")]
    Cancelled,
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Observability hook for per-message failures.
pub type ErrorCallback = Arc<dyn Fn(&BridgeError) + Send + Sync>;

/// Mutates each outbound heartbeat before it is sent.
pub type HeartbeatEnricher = Arc<dyn Fn(&mut HeartbeatPayload) + Send + Sync>;

/// Anything that can deliver a message to the coordinator.
///
/// [`AgentClient`](crate::client::AgentClient) is the production
/// implementation; the router only ever talks to this trait.
#[async_trait::async_trait]
pub trait MessageSink: Send + Sync + 'static {
    async fn send(&self, msg: AgentMessage) -> Result<(), BridgeError>;
}

/// Receives every authenticated inbound message from the client.
#[async_trait::async_trait]
pub trait InboundHandler: Send + Sync + 'static {
    async fn handle_message(&self, msg: AgentMessage) -> Result<(), BridgeError>;

    /// Message types advertised in `agent_connect`.
    fn capabilities(&self) -> Vec<String> {
        Vec::new()
    }
}

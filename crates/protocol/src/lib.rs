//! Agent bridge wire protocol: message envelope, type tags, payload schemas,
//! and the set of message types that must be authenticated.
//!
//! Every frame on the wire is one JSON object:
//!
//! ```text
//! { "type": "task_request", "id": "…", "timestamp": "…", "payload": { … }, "signature": "…" }
//! ```
//!
//! Decoding is deliberately lenient: unknown fields are ignored and absent
//! fields take their zero value, so older agents keep working when the
//! coordinator grows the protocol.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

pub mod payload;

pub use payload::*;

/// Protocol version advertised in `agent_connect`.
pub const PROTOCOL_VERSION: u32 = 1;

/// Default upper bound for a single inbound frame (4 MiB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Error codes carried in structured error payloads.
pub mod codes {
    pub const NO_EXECUTOR: &str = "NO_EXECUTOR";
    pub const INVALID_PAYLOAD: &str = "INVALID_PAYLOAD";
    pub const EXECUTION_FAILED: &str = "EXECUTION_FAILED";
    pub const EXECUTION_PANICKED: &str = "EXECUTION_PANICKED";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const CANCELLED: &str = "CANCELLED";
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

macro_rules! message_types {
    ($( $(#[$meta:meta])* $variant:ident => $tag:literal, )*) => {
        /// Every message type tag this agent understands.
        ///
        /// The wire carries the tag as a plain string; [`MessageType::parse`]
        /// returns `None` for tags added by newer coordinators.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum MessageType {
            $( $(#[$meta])* $variant, )*
        }

        impl MessageType {
            /// All known message types, in declaration order.
            pub const ALL: &'static [MessageType] = &[ $( MessageType::$variant, )* ];

            /// The wire tag.
            pub const fn as_str(self) -> &'static str {
                match self {
                    $( MessageType::$variant => $tag, )*
                }
            }

            /// Parse a wire tag. Unknown tags yield `None`, never an error.
            pub fn parse(tag: &str) -> Option<Self> {
                match tag {
                    $( $tag => Some(MessageType::$variant), )*
                    _ => None,
                }
            }
        }
    };
}

message_types! {
    // ── Session ──────────────────────────────────────────────────────
    Heartbeat => "heartbeat",
    /// Agent → coordinator: handshake.
    AgentConnect => "agent_connect",
    /// Coordinator → agent: handshake accepted or rejected.
    AgentConnectAck => "agent_connect_ack",
    AgentDisconnect => "agent_disconnect",

    // ── Executions ───────────────────────────────────────────────────
    TaskRequest => "task_request",
    TaskProgress => "task_progress",
    TaskResult => "task_result",
    TaskError => "task_error",
    BuildRequest => "build_request",
    BuildProgress => "build_progress",
    BuildResult => "build_result",
    BuildError => "build_error",
    TestRequest => "test_request",
    TestProgress => "test_progress",
    TestResult => "test_result",
    TestError => "test_error",
    QaRequest => "qa_request",
    QaProgress => "qa_progress",
    QaResult => "qa_result",
    QaError => "qa_error",
    CodegenRequest => "codegen_request",
    CodegenProgress => "codegen_progress",
    CodegenResult => "codegen_result",
    CodegenError => "codegen_error",
    DeployRequest => "deploy_request",
    DeployProgress => "deploy_progress",
    DeployResult => "deploy_result",
    DeployError => "deploy_error",

    // ── CLI ──────────────────────────────────────────────────────────
    CliRequest => "cli_request",
    CliResult => "cli_result",

    // ── Subordinate MCP servers ──────────────────────────────────────
    McpStart => "mcp_start",
    McpReady => "mcp_ready",
    McpStop => "mcp_stop",
    McpStopped => "mcp_stopped",
    McpError => "mcp_error",

    // ── Computer use ─────────────────────────────────────────────────
    ComputerUseStart => "computer_use_start",
    ComputerUseStarted => "computer_use_started",
    ComputerUseAction => "computer_use_action",
    ComputerUseResult => "computer_use_result",
    ComputerUseEnd => "computer_use_end",
    /// Agent → coordinator: re-declares a live session after reconnecting.
    ComputerUseSession => "computer_use_session",

    // ── Serve mode ───────────────────────────────────────────────────
    McpServeStart => "mcp_serve_start",
    McpServeReady => "mcp_serve_ready",
    McpServeStop => "mcp_serve_stop",
    McpServeStatus => "mcp_serve_status",
    McpServeResult => "mcp_serve_result",
}

impl MessageType {
    /// Whether messages of this type must carry an HMAC signature once a
    /// shared secret is installed.
    ///
    /// The set is fixed by the coordinator. Error, progress, computer-use
    /// and serve-mode traffic is intentionally outside it.
    pub const fn is_critical(self) -> bool {
        matches!(
            self,
            MessageType::TaskRequest
                | MessageType::TaskResult
                | MessageType::BuildRequest
                | MessageType::BuildResult
                | MessageType::TestRequest
                | MessageType::TestResult
                | MessageType::QaRequest
                | MessageType::QaResult
                | MessageType::CliRequest
                | MessageType::CliResult
                | MessageType::McpStart
                | MessageType::McpReady
                | MessageType::McpStop
                | MessageType::McpError
        )
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a raw wire tag belongs to the critical set. Unknown tags never do.
pub fn is_critical_type(tag: &str) -> bool {
    MessageType::parse(tag).is_some_and(MessageType::is_critical)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Execution categories
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Categories of work that share the request → progress → result/error
/// lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionKind {
    Task,
    Build,
    Test,
    Qa,
    Codegen,
    Deploy,
}

impl ExecutionKind {
    pub const ALL: [ExecutionKind; 6] = [
        ExecutionKind::Task,
        ExecutionKind::Build,
        ExecutionKind::Test,
        ExecutionKind::Qa,
        ExecutionKind::Codegen,
        ExecutionKind::Deploy,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            ExecutionKind::Task => "task",
            ExecutionKind::Build => "build",
            ExecutionKind::Test => "test",
            ExecutionKind::Qa => "qa",
            ExecutionKind::Codegen => "codegen",
            ExecutionKind::Deploy => "deploy",
        }
    }

    /// The category a request type belongs to, if it is an execution request.
    pub const fn from_request(kind: MessageType) -> Option<Self> {
        match kind {
            MessageType::TaskRequest => Some(ExecutionKind::Task),
            MessageType::BuildRequest => Some(ExecutionKind::Build),
            MessageType::TestRequest => Some(ExecutionKind::Test),
            MessageType::QaRequest => Some(ExecutionKind::Qa),
            MessageType::CodegenRequest => Some(ExecutionKind::Codegen),
            MessageType::DeployRequest => Some(ExecutionKind::Deploy),
            _ => None,
        }
    }

    pub const fn request_type(self) -> MessageType {
        match self {
            ExecutionKind::Task => MessageType::TaskRequest,
            ExecutionKind::Build => MessageType::BuildRequest,
            ExecutionKind::Test => MessageType::TestRequest,
            ExecutionKind::Qa => MessageType::QaRequest,
            ExecutionKind::Codegen => MessageType::CodegenRequest,
            ExecutionKind::Deploy => MessageType::DeployRequest,
        }
    }

    pub const fn progress_type(self) -> MessageType {
        match self {
            ExecutionKind::Task => MessageType::TaskProgress,
            ExecutionKind::Build => MessageType::BuildProgress,
            ExecutionKind::Test => MessageType::TestProgress,
            ExecutionKind::Qa => MessageType::QaProgress,
            ExecutionKind::Codegen => MessageType::CodegenProgress,
            ExecutionKind::Deploy => MessageType::DeployProgress,
        }
    }

    pub const fn result_type(self) -> MessageType {
        match self {
            ExecutionKind::Task => MessageType::TaskResult,
            ExecutionKind::Build => MessageType::BuildResult,
            ExecutionKind::Test => MessageType::TestResult,
            ExecutionKind::Qa => MessageType::QaResult,
            ExecutionKind::Codegen => MessageType::CodegenResult,
            ExecutionKind::Deploy => MessageType::DeployResult,
        }
    }

    pub const fn error_type(self) -> MessageType {
        match self {
            ExecutionKind::Task => MessageType::TaskError,
            ExecutionKind::Build => MessageType::BuildError,
            ExecutionKind::Test => MessageType::TestError,
            ExecutionKind::Qa => MessageType::QaError,
            ExecutionKind::Codegen => MessageType::CodegenError,
            ExecutionKind::Deploy => MessageType::DeployError,
        }
    }
}

impl std::fmt::Display for ExecutionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Envelope
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The wire unit exchanged with the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMessage {
    /// Type tag; selects routing and payload schema.
    #[serde(rename = "type", default)]
    pub msg_type: String,
    /// Correlation id, echoed in responses.
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Hex HMAC-SHA-256, present only on critical messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl AgentMessage {
    /// Build a message stamped with the current time.
    pub fn new<P: Serialize + ?Sized>(
        kind: MessageType,
        id: impl Into<String>,
        payload: &P,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            msg_type: kind.as_str().to_string(),
            id: id.into(),
            timestamp: Utc::now(),
            payload: serde_json::to_value(payload)?,
            signature: None,
        })
    }

    /// Build a message with a freshly generated id.
    pub fn with_new_id<P: Serialize + ?Sized>(
        kind: MessageType,
        payload: &P,
    ) -> Result<Self, serde_json::Error> {
        Self::new(kind, uuid::Uuid::new_v4().to_string(), payload)
    }

    /// The parsed type tag, or `None` for types this agent does not know.
    pub fn kind(&self) -> Option<MessageType> {
        MessageType::parse(&self.msg_type)
    }

    pub fn is_critical(&self) -> bool {
        is_critical_type(&self.msg_type)
    }

    /// Decode the payload into a typed schema.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }

    /// Best-effort `execution_id` lookup for payloads that failed to decode.
    pub fn execution_id_hint(&self) -> String {
        self.payload
            .get("execution_id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string()
    }
}

/// The `payload` member of an encoded frame, byte for byte as the sender
/// wrote it. `None` when the payload is absent or `null`.
pub fn raw_payload(frame: &str) -> Result<Option<&str>, serde_json::Error> {
    #[derive(Deserialize)]
    struct Frame<'a> {
        #[serde(borrow, default)]
        payload: Option<&'a RawValue>,
    }
    let frame: Frame<'_> = serde_json::from_str(frame)?;
    Ok(frame.payload.map(RawValue::get))
}

/// Format a timestamp as RFC 3339 with nanosecond precision and trailing
/// fractional zeros removed (`2024-05-01T10:00:00.5Z`, `2024-05-01T10:00:00Z`).
///
/// This is the timestamp form fed into message signatures, so both peers
/// must agree on it byte for byte.
pub fn rfc3339_nano(ts: &DateTime<Utc>) -> String {
    let full = ts.to_rfc3339_opts(SecondsFormat::Nanos, true);
    let Some(body) = full.strip_suffix('Z') else {
        return full;
    };
    match body.split_once('.') {
        Some((secs, frac)) => {
            let frac = frac.trim_end_matches('0');
            if frac.is_empty() {
                format!("{secs}Z")
            } else {
                format!("{secs}.{frac}Z")
            }
        }
        None => full,
    }
}

//! Interfaces to the external engines the router drives.
//!
//! The bridge never executes work itself. Each category of request is handed
//! to one of these traits and the router waits for the outcome; how the
//! work is actually done is the implementor's business.

use std::sync::Arc;

use ab_protocol::{
    AgentMessage, CliRequest, ExecutionKind, ExecutionProgress, ExecutionRequest,
    McpStartPayload, MessageType,
};
use tokio_util::sync::CancellationToken;

use crate::types::{ExecutorError, MessageSink};

/// Result type for execution engines.
pub type ExecutorResult = Result<serde_json::Value, ExecutorError>;

/// Context provided to every execution.
#[derive(Clone, Debug)]
pub struct ExecutionContext {
    /// Coordinator-assigned id; echoed in every response.
    pub execution_id: String,
    pub kind: ExecutionKind,
    /// Cancelled when the router shuts down.
    pub cancel: CancellationToken,
    pub progress: ProgressReporter,
}

/// Best-effort progress updates for one execution.
#[derive(Clone)]
pub struct ProgressReporter {
    sink: Arc<dyn MessageSink>,
    msg_type: MessageType,
    execution_id: String,
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("msg_type", &self.msg_type)
            .field("execution_id", &self.execution_id)
            .finish()
    }
}

impl ProgressReporter {
    pub fn new(sink: Arc<dyn MessageSink>, kind: ExecutionKind, execution_id: impl Into<String>) -> Self {
        Self {
            sink,
            msg_type: kind.progress_type(),
            execution_id: execution_id.into(),
        }
    }

    /// Send a progress update. `progress` is clamped to `[0, 100]`.
    /// Delivery failures are logged and otherwise ignored.
    pub async fn report(&self, progress: f64, status: impl Into<String>) {
        let progress = if progress.is_nan() { 0.0 } else { progress.clamp(0.0, 100.0) };
        let payload = ExecutionProgress {
            execution_id: self.execution_id.clone(),
            progress,
            status: status.into(),
        };
        let msg = match AgentMessage::with_new_id(self.msg_type, &payload) {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!(error = %e, "failed to encode progress");
                return;
            }
        };
        if let Err(e) = self.sink.send(msg).await {
            tracing::debug!(
                execution_id = %self.execution_id,
                error = %e,
                "progress update dropped"
            );
        }
    }
}

/// Task, build, test, QA, codegen, and deploy engines.
#[async_trait::async_trait]
pub trait Executor: Send + Sync + 'static {
    async fn execute(&self, ctx: ExecutionContext, request: ExecutionRequest) -> ExecutorResult;
}

/// Output of a completed CLI command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CliOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Runs `cli_request` commands.
#[async_trait::async_trait]
pub trait CliExecutor: Send + Sync + 'static {
    async fn run(&self, cancel: CancellationToken, request: CliRequest) -> Result<CliOutput, ExecutorError>;
}

/// Starts and stops subordinate MCP servers.
#[async_trait::async_trait]
pub trait McpManager: Send + Sync + 'static {
    /// Start a server; the returned value is reported in `mcp_ready`.
    async fn start(&self, request: McpStartPayload) -> ExecutorResult;
    async fn stop(&self, server_id: &str) -> Result<(), ExecutorError>;
}

/// Drives computer-use (browser / desktop automation) sessions.
#[async_trait::async_trait]
pub trait ComputerUseDriver: Send + Sync + 'static {
    async fn start_session(&self, session_id: &str, params: &serde_json::Value) -> ExecutorResult;
    async fn perform(&self, session_id: &str, action: serde_json::Value) -> ExecutorResult;
    async fn end_session(&self, session_id: &str) -> Result<(), ExecutorError>;
}

/// Decides whether a failed execution may be retried by the coordinator.
pub trait RetryPolicy: Send + Sync + 'static {
    fn is_retryable(&self, kind: ExecutionKind, error: &ExecutorError) -> bool;
}

/// Classifies every failure as final.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverRetry;

impl RetryPolicy for NeverRetry {
    fn is_retryable(&self, _kind: ExecutionKind, _error: &ExecutorError) -> bool {
        false
    }
}

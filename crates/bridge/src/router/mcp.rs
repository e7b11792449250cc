//! Subordinate MCP servers and the serve-mode server.

use ab_protocol::{
    AgentMessage, McpErrorPayload, McpReadyPayload, McpStartPayload, McpStopPayload, MessageType,
    ServeResultPayload, ServeStartPayload, ServeStatus,
};

use super::execution::{supervise, Failure};
use super::Router;
use crate::types::BridgeError;

impl Router {
    // ── mcp_start / mcp_stop ────────────────────────────────────────

    pub(super) async fn handle_mcp_start(&self, msg: AgentMessage) -> Result<(), BridgeError> {
        let request = match msg.decode_payload::<McpStartPayload>() {
            Ok(r) if !r.server_id.is_empty() => r,
            Ok(_) => return Err(self.reject_mcp(&msg, String::new(), "missing server_id".into()).await),
            Err(e) => {
                let server_id = hint(&msg, "server_id");
                return Err(self.reject_mcp(&msg, server_id, e.to_string()).await);
            }
        };

        let Some(mcp) = self.shared.mcp.clone() else {
            tracing::warn!(server_id = %request.server_id, "no MCP manager configured");
            self.mcp_error(&msg.id, request.server_id, "no MCP manager configured".into())
                .await;
            return Ok(());
        };

        let router = self.clone();
        tokio::spawn(async move {
            let server_id = request.server_id.clone();
            let cancel = router.shared.cancel.child_token();
            match supervise(&cancel, None, mcp.start(request)).await {
                Ok(info) => {
                    tracing::info!(server_id = %server_id, "mcp server ready");
                    let ready = McpReadyPayload { server_id, info };
                    router.deliver(MessageType::McpReady, &msg.id, &ready).await;
                }
                Err(failure) => {
                    tracing::warn!(server_id = %server_id, error = %failure.message(), "mcp server failed to start");
                    router.mcp_error(&msg.id, server_id, failure.message()).await;
                }
            }
        });
        Ok(())
    }

    pub(super) async fn handle_mcp_stop(&self, msg: AgentMessage) -> Result<(), BridgeError> {
        let request = match msg.decode_payload::<McpStopPayload>() {
            Ok(r) if !r.server_id.is_empty() => r,
            Ok(_) => return Err(self.reject_mcp(&msg, String::new(), "missing server_id".into()).await),
            Err(e) => {
                let server_id = hint(&msg, "server_id");
                return Err(self.reject_mcp(&msg, server_id, e.to_string()).await);
            }
        };

        let Some(mcp) = self.shared.mcp.clone() else {
            self.mcp_error(&msg.id, request.server_id, "no MCP manager configured".into())
                .await;
            return Ok(());
        };

        let router = self.clone();
        tokio::spawn(async move {
            let server_id = request.server_id;
            let cancel = router.shared.cancel.child_token();
            let outcome = supervise(&cancel, None, mcp.stop(&server_id)).await;
            match outcome {
                Ok(()) => {
                    tracing::info!(server_id = %server_id, "mcp server stopped");
                    let stopped = McpStopPayload { server_id };
                    router.deliver(MessageType::McpStopped, &msg.id, &stopped).await;
                }
                Err(failure) => {
                    router.mcp_error(&msg.id, server_id, failure.message()).await;
                }
            }
        });
        Ok(())
    }

    async fn mcp_error(&self, reply_to: &str, server_id: String, error: String) {
        let payload = McpErrorPayload { server_id, error };
        self.deliver(MessageType::McpError, reply_to, &payload).await;
    }

    async fn reject_mcp(&self, msg: &AgentMessage, server_id: String, reason: String) -> BridgeError {
        self.mcp_error(&msg.id, server_id, format!("invalid payload: {reason}"))
            .await;
        BridgeError::Payload {
            msg_type: msg.msg_type.clone(),
            reason,
        }
    }

    // ── serve mode ──────────────────────────────────────────────────

    pub(super) async fn handle_serve_start(&self, msg: AgentMessage) -> Result<(), BridgeError> {
        let request = match msg.decode_payload::<ServeStartPayload>() {
            Ok(r) => r,
            Err(e) => {
                self.serve_result(&msg.id, ServeStatus::Error, format!("invalid payload: {e}"))
                    .await;
                return Err(BridgeError::Payload {
                    msg_type: msg.msg_type.clone(),
                    reason: e.to_string(),
                });
            }
        };

        // The slot is claimed before this handler returns, so a second start
        // arriving right behind this one is rejected deterministically.
        let reservation = match self.shared.serve.reserve() {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "serve start rejected");
                self.serve_result(&msg.id, ServeStatus::Error, e.to_string()).await;
                return Err(e);
            }
        };

        let router = self.clone();
        tokio::spawn(async move {
            let cancel = router.shared.cancel.child_token();
            match supervise(&cancel, None, reservation.launch(request)).await {
                Ok(ready) => {
                    router.deliver(MessageType::McpServeReady, &msg.id, &ready).await;
                }
                Err(failure) => {
                    if matches!(failure, Failure::Panicked) {
                        tracing::error!("serve launcher panicked");
                    }
                    router
                        .serve_result(&msg.id, ServeStatus::Error, failure.message())
                        .await;
                }
            }
        });
        Ok(())
    }

    pub(super) async fn handle_serve_stop(&self, msg: AgentMessage) -> Result<(), BridgeError> {
        match self.shared.serve.stop().await {
            Ok(status) => {
                self.serve_result(&msg.id, status, String::new()).await;
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "serve stop failed");
                self.serve_result(&msg.id, ServeStatus::Error, e.to_string()).await;
                Err(e)
            }
        }
    }

    pub(super) async fn handle_serve_status(&self, msg: AgentMessage) -> Result<(), BridgeError> {
        let status = self.shared.serve.status();
        self.serve_result(&msg.id, status, String::new()).await;
        Ok(())
    }

    async fn serve_result(&self, reply_to: &str, status: ServeStatus, error: String) {
        let payload = ServeResultPayload { status, error };
        self.deliver(MessageType::McpServeResult, reply_to, &payload).await;
    }
}

/// Best-effort string field from a payload that failed to decode.
pub(super) fn hint(msg: &AgentMessage, field: &str) -> String {
    msg.payload
        .get(field)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ExecutorResult, McpManager};
    use crate::serve::{ServeHandle, ServeLauncher};
    use crate::testing::RecordingSink;
    use crate::types::ExecutorError;
    use ab_protocol::ServeReadyPayload;
    use std::sync::Arc;

    fn request(msg_type: &str, payload: serde_json::Value) -> AgentMessage {
        AgentMessage {
            msg_type: msg_type.into(),
            id: "req-7".into(),
            timestamp: chrono::Utc::now(),
            payload,
            signature: None,
        }
    }

    struct Mcp;

    #[async_trait::async_trait]
    impl McpManager for Mcp {
        async fn start(&self, request: McpStartPayload) -> ExecutorResult {
            if request.command.is_empty() {
                return Err(ExecutorError::InvalidRequest("command required".into()));
            }
            Ok(serde_json::json!({"tools": 3}))
        }

        async fn stop(&self, _server_id: &str) -> Result<(), ExecutorError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn mcp_start_and_stop() {
        let sink = Arc::new(RecordingSink::new());
        let router = Router::builder(sink.clone()).mcp_manager(Arc::new(Mcp)).build();

        router
            .handle_message(request(
                "mcp_start",
                serde_json::json!({"server_id": "fs", "command": "mcp-fs"}),
            ))
            .await
            .unwrap();
        let ready = sink.wait_for("mcp_ready").await;
        assert_eq!(ready.payload["server_id"], "fs");
        assert_eq!(ready.payload["info"]["tools"], 3);

        router
            .handle_message(request("mcp_stop", serde_json::json!({"server_id": "fs"})))
            .await
            .unwrap();
        let stopped = sink.wait_for("mcp_stopped").await;
        assert_eq!(stopped.payload["server_id"], "fs");
    }

    #[tokio::test]
    async fn mcp_start_failure_reports_mcp_error() {
        let sink = Arc::new(RecordingSink::new());
        let router = Router::builder(sink.clone()).mcp_manager(Arc::new(Mcp)).build();
        router
            .handle_message(request("mcp_start", serde_json::json!({"server_id": "fs"})))
            .await
            .unwrap();
        let err = sink.wait_for("mcp_error").await;
        assert_eq!(err.payload["server_id"], "fs");
        assert!(err.payload["error"].as_str().unwrap().contains("command required"));
    }

    #[tokio::test]
    async fn mcp_without_manager() {
        let sink = Arc::new(RecordingSink::new());
        let router = Router::builder(sink.clone()).build();
        router
            .handle_message(request("mcp_stop", serde_json::json!({"server_id": "fs"})))
            .await
            .unwrap();
        let err = sink.wait_for("mcp_error").await;
        assert_eq!(err.payload["error"], "no MCP manager configured");
    }

    struct Handle;

    #[async_trait::async_trait]
    impl ServeHandle for Handle {
        fn ready(&self) -> ServeReadyPayload {
            ServeReadyPayload {
                url: "http://127.0.0.1:9000".into(),
                pid: Some(7),
            }
        }

        async fn stop(self: Box<Self>) -> Result<(), ExecutorError> {
            Ok(())
        }
    }

    struct Launcher;

    #[async_trait::async_trait]
    impl ServeLauncher for Launcher {
        async fn launch(&self, _request: ServeStartPayload) -> Result<Box<dyn ServeHandle>, ExecutorError> {
            Ok(Box::new(Handle))
        }
    }

    fn serve_router() -> (Router, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::new());
        let router = Router::builder(sink.clone())
            .serve_launcher(Arc::new(Launcher))
            .build();
        (router, sink)
    }

    #[tokio::test]
    async fn serve_lifecycle() {
        let (router, sink) = serve_router();

        router
            .handle_message(request("mcp_serve_start", serde_json::json!({"port": 9000})))
            .await
            .unwrap();
        let ready = sink.wait_for("mcp_serve_ready").await;
        assert_eq!(ready.payload["url"], "http://127.0.0.1:9000");
        assert_eq!(ready.payload["pid"], 7);

        router
            .handle_message(request("mcp_serve_status", serde_json::json!({})))
            .await
            .unwrap();
        let status = sink.wait_for("mcp_serve_result").await;
        assert_eq!(status.payload["status"], "running");
        assert_eq!(status.payload["error"], "");

        router
            .handle_message(request("mcp_serve_stop", serde_json::json!({})))
            .await
            .unwrap();
        let results = sink.sent_of("mcp_serve_result");
        assert_eq!(results.len(), 2);
        assert_eq!(results[1].payload["status"], "stopped");
        assert_eq!(router.serve().status(), ServeStatus::Stopped);
    }

    #[tokio::test]
    async fn back_to_back_start_is_rejected() {
        let (router, sink) = serve_router();

        router
            .handle_message(request("mcp_serve_start", serde_json::json!({})))
            .await
            .unwrap();
        let err = router
            .handle_message(request("mcp_serve_start", serde_json::json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Duplicate(_)));

        let rejected = sink.wait_for("mcp_serve_result").await;
        assert_eq!(rejected.payload["status"], "error");
        assert!(!rejected.payload["error"].as_str().unwrap().is_empty());
        sink.wait_for("mcp_serve_ready").await;
    }

    #[tokio::test]
    async fn stop_when_idle_reports_stopped() {
        let (router, sink) = serve_router();
        router
            .handle_message(request("mcp_serve_stop", serde_json::json!({})))
            .await
            .unwrap();
        let result = sink.wait_for("mcp_serve_result").await;
        assert_eq!(result.payload["status"], "stopped");
        assert_eq!(result.payload["error"], "");
    }

    #[tokio::test]
    async fn serve_start_without_launcher() {
        let sink = Arc::new(RecordingSink::new());
        let router = Router::builder(sink.clone()).build();
        let err = router
            .handle_message(request("mcp_serve_start", serde_json::json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Config(_)));
        let result = sink.wait_for("mcp_serve_result").await;
        assert_eq!(result.payload["status"], "error");
    }
}

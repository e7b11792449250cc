//! Computer-use sessions. Action results are queued before they are sent so
//! a result produced during a disconnect survives until the next
//! reconnection restore.

use ab_protocol::{
    AgentMessage, ComputerUseActionPayload, ComputerUseEndPayload, ComputerUseResultPayload,
    ComputerUseStartPayload, ComputerUseStartedPayload, MessageType,
};

use super::execution::supervise;
use super::mcp::hint;
use super::Router;
use crate::session::ComputerUseSession;
use crate::types::BridgeError;

impl Router {
    pub(super) async fn handle_computer_use_start(&self, msg: AgentMessage) -> Result<(), BridgeError> {
        let request = match msg.decode_payload::<ComputerUseStartPayload>() {
            Ok(r) if !r.session_id.is_empty() => r,
            Ok(_) => return Err(self.reject_start(&msg, "missing session_id".into()).await),
            Err(e) => return Err(self.reject_start(&msg, e.to_string()).await),
        };

        if self.shared.sessions.get(&request.session_id).is_some() {
            let e = BridgeError::Duplicate(format!("session {} already active", request.session_id));
            self.started(&msg.id, request.session_id, Err(e.to_string())).await;
            return Err(e);
        }

        let Some(driver) = self.shared.computer_use.clone() else {
            self.started(
                &msg.id,
                request.session_id,
                Err("no computer-use driver configured".into()),
            )
            .await;
            return Ok(());
        };

        let router = self.clone();
        tokio::spawn(async move {
            let cancel = router.shared.cancel.child_token();
            let outcome = supervise(
                &cancel,
                None,
                driver.start_session(&request.session_id, &request.params),
            )
            .await;
            match outcome {
                Ok(info) => {
                    router
                        .shared
                        .sessions
                        .insert(ComputerUseSession::new(&request.session_id, request.params));
                    tracing::info!(session_id = %request.session_id, "computer-use session started");
                    router.started(&msg.id, request.session_id, Ok(info)).await;
                }
                Err(failure) => {
                    tracing::warn!(session_id = %request.session_id, error = %failure.message(), "computer-use session failed to start");
                    router
                        .started(&msg.id, request.session_id, Err(failure.message()))
                        .await;
                }
            }
        });
        Ok(())
    }

    pub(super) async fn handle_computer_use_action(&self, msg: AgentMessage) -> Result<(), BridgeError> {
        let request = match msg.decode_payload::<ComputerUseActionPayload>() {
            Ok(r) if !r.session_id.is_empty() => r,
            Ok(_) => {
                return Err(self
                    .reject_action(&msg, String::new(), String::new(), "missing session_id".into())
                    .await)
            }
            Err(e) => {
                let (session_id, action_id) = (hint(&msg, "session_id"), hint(&msg, "action_id"));
                return Err(self.reject_action(&msg, session_id, action_id, e.to_string()).await);
            }
        };

        let Some(session) = self.shared.sessions.get(&request.session_id) else {
            tracing::warn!(session_id = %request.session_id, "action for unknown session");
            let result = ComputerUseResultPayload {
                session_id: request.session_id,
                action_id: request.action_id,
                success: false,
                result: serde_json::Value::Null,
                error: Some("unknown session".into()),
            };
            self.deliver(MessageType::ComputerUseResult, &msg.id, &result).await;
            return Ok(());
        };
        let Some(driver) = self.shared.computer_use.clone() else {
            return Err(BridgeError::Config("no computer-use driver configured".into()));
        };

        let router = self.clone();
        tokio::spawn(async move {
            let cancel = router.shared.cancel.child_token();
            let outcome = supervise(
                &cancel,
                None,
                driver.perform(&request.session_id, request.action),
            )
            .await;
            let result = match outcome {
                Ok(value) => ComputerUseResultPayload {
                    session_id: request.session_id,
                    action_id: request.action_id,
                    success: true,
                    result: value,
                    error: None,
                },
                Err(failure) => ComputerUseResultPayload {
                    session_id: request.session_id,
                    action_id: request.action_id,
                    success: false,
                    result: serde_json::Value::Null,
                    error: Some(failure.message()),
                },
            };

            let seq = session.enqueue_pending(&msg.id, result.clone());
            let sent = match AgentMessage::new(MessageType::ComputerUseResult, &msg.id, &result) {
                Ok(m) => router.send(m).await,
                Err(e) => Err(e.into()),
            };
            match sent {
                Ok(()) => {
                    session.ack_pending(seq);
                }
                Err(e) => {
                    tracing::warn!(
                        session_id = %result.session_id,
                        action_id = %result.action_id,
                        error = %e,
                        "action result queued for resend after reconnect"
                    );
                }
            }
        });
        Ok(())
    }

    pub(super) async fn handle_computer_use_end(&self, msg: AgentMessage) -> Result<(), BridgeError> {
        let request = match msg.decode_payload::<ComputerUseEndPayload>() {
            Ok(r) => r,
            Err(e) => {
                let session_id = hint(&msg, "session_id");
                return Err(self
                    .reject_action(&msg, session_id, String::new(), e.to_string())
                    .await);
            }
        };

        let Some(session) = self.shared.sessions.remove(&request.session_id) else {
            tracing::debug!(session_id = %request.session_id, "end for unknown session");
            return Ok(());
        };
        let dropped = session.pending_count();
        if dropped > 0 {
            tracing::warn!(session_id = %session.session_id, dropped, "session ended with undelivered results");
        }

        if let Some(driver) = self.shared.computer_use.clone() {
            tokio::spawn(async move {
                if let Err(e) = driver.end_session(&request.session_id).await {
                    tracing::warn!(session_id = %request.session_id, error = %e, "failed to end computer-use session");
                }
            });
        }
        tracing::info!(session_id = %session.session_id, "computer-use session ended");
        Ok(())
    }

    async fn started(&self, reply_to: &str, session_id: String, outcome: Result<serde_json::Value, String>) {
        let payload = match outcome {
            Ok(info) => ComputerUseStartedPayload {
                session_id,
                success: true,
                info,
                error: None,
            },
            Err(error) => ComputerUseStartedPayload {
                session_id,
                success: false,
                info: serde_json::Value::Null,
                error: Some(error),
            },
        };
        self.deliver(MessageType::ComputerUseStarted, reply_to, &payload).await;
    }

    async fn reject_start(&self, msg: &AgentMessage, reason: String) -> BridgeError {
        self.started(&msg.id, hint(msg, "session_id"), Err(format!("invalid payload: {reason}")))
            .await;
        BridgeError::Payload {
            msg_type: msg.msg_type.clone(),
            reason,
        }
    }

    async fn reject_action(
        &self,
        msg: &AgentMessage,
        session_id: String,
        action_id: String,
        reason: String,
    ) -> BridgeError {
        let result = ComputerUseResultPayload {
            session_id,
            action_id,
            success: false,
            result: serde_json::Value::Null,
            error: Some(format!("invalid payload: {reason}")),
        };
        self.deliver(MessageType::ComputerUseResult, &msg.id, &result).await;
        BridgeError::Payload {
            msg_type: msg.msg_type.clone(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ComputerUseDriver, ExecutorResult};
    use crate::restore::ReconnectListener;
    use crate::testing::RecordingSink;
    use crate::types::ExecutorError;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn request(msg_type: &str, payload: serde_json::Value) -> AgentMessage {
        AgentMessage {
            msg_type: msg_type.into(),
            id: "req-3".into(),
            timestamp: chrono::Utc::now(),
            payload,
            signature: None,
        }
    }

    struct Driver;

    #[async_trait::async_trait]
    impl ComputerUseDriver for Driver {
        async fn start_session(&self, session_id: &str, _params: &serde_json::Value) -> ExecutorResult {
            Ok(serde_json::json!({"display": format!(":{session_id}")}))
        }

        async fn perform(&self, _session_id: &str, action: serde_json::Value) -> ExecutorResult {
            if action["kind"] == "explode" {
                return Err(ExecutorError::Failed("no such element".into()));
            }
            Ok(serde_json::json!({"done": action["kind"]}))
        }

        async fn end_session(&self, _session_id: &str) -> Result<(), ExecutorError> {
            Ok(())
        }
    }

    async fn started_router() -> (super::Router, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::new());
        let router = super::Router::builder(sink.clone())
            .computer_use(Arc::new(Driver))
            .build();
        router
            .handle_message(request(
                "computer_use_start",
                serde_json::json!({"session_id": "s1", "params": {"w": 800}}),
            ))
            .await
            .unwrap();
        let started = sink.wait_for("computer_use_started").await;
        assert_eq!(started.payload["success"], true);
        (router, sink)
    }

    async fn wait_for_results(sink: &RecordingSink, n: usize) {
        for _ in 0..400 {
            if sink.sent_of("computer_use_result").len() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {n} results, got {:?}", sink.sent());
    }

    #[tokio::test]
    async fn action_result_is_sent_and_drained() {
        let (router, sink) = started_router().await;
        router
            .handle_message(request(
                "computer_use_action",
                serde_json::json!({"session_id": "s1", "action_id": "a1", "action": {"kind": "click"}}),
            ))
            .await
            .unwrap();
        let result = sink.wait_for("computer_use_result").await;
        assert_eq!(result.payload["action_id"], "a1");
        assert_eq!(result.payload["success"], true);
        assert_eq!(result.payload["result"]["done"], "click");

        let session = router.sessions().get("s1").unwrap();
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test]
    async fn failed_action_reports_error_result() {
        let (router, sink) = started_router().await;
        router
            .handle_message(request(
                "computer_use_action",
                serde_json::json!({"session_id": "s1", "action_id": "a2", "action": {"kind": "explode"}}),
            ))
            .await
            .unwrap();
        let result = sink.wait_for("computer_use_result").await;
        assert_eq!(result.payload["success"], false);
        assert!(result.payload["error"].as_str().unwrap().contains("no such element"));
    }

    #[tokio::test]
    async fn undelivered_result_is_restored_after_reconnect() {
        let (router, sink) = started_router().await;
        sink.fail_type("computer_use_result");

        let mut action = request(
            "computer_use_action",
            serde_json::json!({"session_id": "s1", "action_id": "a1", "action": {"kind": "type"}}),
        );
        action.id = "act-42".into();
        router.handle_message(action).await.unwrap();

        let session = router.sessions().get("s1").unwrap();
        for _ in 0..400 {
            if session.pending_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(session.pending_count(), 1);
        assert!(sink.sent_of("computer_use_result").is_empty());

        sink.heal_type("computer_use_result");
        router.on_reconnect(&CancellationToken::new()).await.unwrap();

        let declaration = sink.wait_for("computer_use_session").await;
        assert_eq!(declaration.payload["session_id"], "s1");
        assert_eq!(declaration.payload["params"]["w"], 800);
        wait_for_results(&sink, 1).await;
        let resent = sink.sent_of("computer_use_result");
        assert_eq!(resent[0].payload["action_id"], "a1");
        assert_eq!(resent[0].id, "act-42");
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test]
    async fn action_for_unknown_session() {
        let (router, sink) = started_router().await;
        router
            .handle_message(request(
                "computer_use_action",
                serde_json::json!({"session_id": "nope", "action_id": "a1"}),
            ))
            .await
            .unwrap();
        let result = sink.wait_for("computer_use_result").await;
        assert_eq!(result.payload["error"], "unknown session");
    }

    #[tokio::test]
    async fn end_removes_session_and_duplicate_start_rejected() {
        let (router, sink) = started_router().await;

        let err = router
            .handle_message(request("computer_use_start", serde_json::json!({"session_id": "s1"})))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Duplicate(_)));
        assert_eq!(sink.sent_of("computer_use_started").len(), 2);

        router
            .handle_message(request("computer_use_end", serde_json::json!({"session_id": "s1"})))
            .await
            .unwrap();
        assert!(router.sessions().is_empty());
    }

    #[tokio::test]
    async fn malformed_end_gets_structured_reply() {
        let (router, sink) = started_router().await;
        let err = router
            .handle_message(request("computer_use_end", serde_json::json!({"session_id": 5})))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Payload { .. }));

        let reply = sink.wait_for("computer_use_result").await;
        assert_eq!(reply.id, "req-3");
        assert_eq!(reply.payload["success"], false);
        assert!(reply.payload["error"]
            .as_str()
            .unwrap()
            .starts_with("invalid payload: "));
        assert!(router.sessions().get("s1").is_some());
    }
}

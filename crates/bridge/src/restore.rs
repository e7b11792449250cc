//! Reconnection restoration: after every successful reconnect the client
//! hands control to each registered [`ReconnectListener`] before it resumes
//! reading, so stateful modules can re-declare themselves to a coordinator
//! that may have lost its in-memory view of them.

use std::time::Duration;

use ab_protocol::{AgentMessage, MessageType, SessionDeclarationPayload};
use tokio_util::sync::CancellationToken;

use crate::session::{ComputerUseSession, SessionStore};
use crate::types::{BridgeError, MessageSink};

/// Upper bound for restoring one session.
pub const SESSION_RESTORE_TIMEOUT: Duration = Duration::from_secs(10);

/// Invoked once per successful reconnection, before the read loop resumes.
#[async_trait::async_trait]
pub trait ReconnectListener: Send + Sync + 'static {
    /// Resynchronise with the coordinator. Must return promptly with
    /// [`BridgeError::Cancelled`] once `cancel` fires.
    async fn on_reconnect(&self, cancel: &CancellationToken) -> Result<(), BridgeError>;
}

/// Re-declare one session and resend its pending results in enqueue order.
///
/// Each result stays queued until its send succeeds, so a failure (or the
/// future being dropped mid-send) leaves it in place for the next attempt.
/// Returns the number of results delivered.
pub async fn restore_session(
    sink: &dyn MessageSink,
    session: &ComputerUseSession,
) -> Result<usize, BridgeError> {
    let declaration = SessionDeclarationPayload {
        session_id: session.session_id.clone(),
        params: session.params.clone(),
        started_at: session.started_at,
        pending_results: session.pending_count(),
    };
    sink.send(AgentMessage::with_new_id(
        MessageType::ComputerUseSession,
        &declaration,
    )?)
    .await?;

    let mut delivered = 0;
    while let Some(pending) = session.front_pending() {
        let msg = AgentMessage::new(
            MessageType::ComputerUseResult,
            &pending.reply_to,
            &pending.payload,
        )?;
        sink.send(msg).await?;
        session.ack_pending(pending.seq);
        delivered += 1;
    }
    Ok(delivered)
}

/// Restore every live session in `store`, oldest first.
///
/// A failing or slow session is logged and skipped; the first error is
/// returned after all sessions were attempted. Cancellation aborts the
/// remaining sessions immediately.
pub async fn restore_sessions(
    store: &SessionStore,
    sink: &dyn MessageSink,
    cancel: &CancellationToken,
    per_session: Duration,
) -> Result<(), BridgeError> {
    let mut first_error = None;

    for session in store.active_sessions() {
        if cancel.is_cancelled() {
            return Err(BridgeError::Cancelled);
        }

        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Err(BridgeError::Cancelled),
            r = tokio::time::timeout(per_session, restore_session(sink, &session)) => r,
        };

        match outcome {
            Ok(Ok(delivered)) => {
                tracing::info!(
                    session_id = %session.session_id,
                    resent = delivered,
                    "computer-use session restored"
                );
            }
            Ok(Err(e)) => {
                tracing::warn!(
                    session_id = %session.session_id,
                    pending = session.pending_count(),
                    error = %e,
                    "session restore failed, results stay queued"
                );
                first_error.get_or_insert(e);
            }
            Err(_) => {
                tracing::warn!(
                    session_id = %session.session_id,
                    timeout_ms = per_session.as_millis() as u64,
                    "session restore timed out"
                );
                first_error.get_or_insert(BridgeError::Transport(format!(
                    "restoring session {} timed out",
                    session.session_id
                )));
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingSink;
    use ab_protocol::ComputerUseResultPayload;

    fn session_with_pending(store: &SessionStore) -> std::sync::Arc<ComputerUseSession> {
        let session = store.insert(ComputerUseSession::new(
            "s1",
            serde_json::json!({"display": ":1"}),
        ));
        session.enqueue_pending("act-42", ComputerUseResultPayload {
            session_id: "s1".into(),
            action_id: "a1".into(),
            success: true,
            result: serde_json::json!({"clicked": true}),
            error: None,
        });
        session
    }

    #[tokio::test]
    async fn declaration_then_result_then_drained() {
        let store = SessionStore::new();
        let session = session_with_pending(&store);
        let sink = RecordingSink::new();

        restore_sessions(&store, &sink, &CancellationToken::new(), SESSION_RESTORE_TIMEOUT)
            .await
            .unwrap();

        let sent = sink.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].msg_type, "computer_use_session");
        assert_eq!(sent[0].payload["session_id"], "s1");
        assert_eq!(sent[0].payload["pending_results"], 1);
        assert_eq!(sent[1].msg_type, "computer_use_result");
        assert_eq!(sent[1].payload["action_id"], "a1");
        assert_eq!(sent[1].id, "act-42");
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test]
    async fn failed_resend_keeps_result_queued() {
        let store = SessionStore::new();
        let session = session_with_pending(&store);
        let sink = RecordingSink::new();
        sink.fail_type("computer_use_result");

        let err = restore_sessions(&store, &sink, &CancellationToken::new(), SESSION_RESTORE_TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::NotConnected));

        assert_eq!(sink.sent_of("computer_use_session").len(), 1);
        assert_eq!(session.pending_count(), 1);
        assert_eq!(session.front_pending().unwrap().payload.action_id, "a1");
    }

    #[tokio::test]
    async fn resends_in_enqueue_order() {
        let store = SessionStore::new();
        let session = store.insert(ComputerUseSession::new("s1", serde_json::json!({})));
        for id in ["a1", "a2", "a3"] {
            session.enqueue_pending(format!("m-{id}"), ComputerUseResultPayload {
                session_id: "s1".into(),
                action_id: id.into(),
                ..Default::default()
            });
        }
        let sink = RecordingSink::new();
        restore_session(&sink, &session).await.unwrap();

        let ids: Vec<_> = sink
            .sent_of("computer_use_result")
            .iter()
            .map(|m| m.payload["action_id"].as_str().unwrap_or_default().to_string())
            .collect();
        assert_eq!(ids, vec!["a1", "a2", "a3"]);
        let reply_ids: Vec<_> = sink
            .sent_of("computer_use_result")
            .iter()
            .map(|m| m.id.clone())
            .collect();
        assert_eq!(reply_ids, vec!["m-a1", "m-a2", "m-a3"]);
    }

    #[tokio::test]
    async fn cancellation_aborts_restore() {
        let store = SessionStore::new();
        let session = session_with_pending(&store);
        let sink = RecordingSink::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = restore_sessions(&store, &sink, &cancel, SESSION_RESTORE_TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Cancelled));
        assert!(sink.sent().is_empty());
        assert_eq!(session.pending_count(), 1);
    }

    #[tokio::test]
    async fn slow_session_times_out_without_losing_results() {
        let store = SessionStore::new();
        let session = session_with_pending(&store);
        let sink = RecordingSink::new();
        sink.stall_type("computer_use_result");

        let err = restore_sessions(
            &store,
            &sink,
            &CancellationToken::new(),
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, BridgeError::Transport(_)));
        assert_eq!(session.pending_count(), 1);
    }
}

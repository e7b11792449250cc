//! Test doubles shared by the unit tests.

use std::collections::HashSet;
use std::time::Duration;

use ab_protocol::AgentMessage;
use parking_lot::Mutex;

use crate::types::{BridgeError, MessageSink};

/// Records every delivered message. Selected types can be made to fail or
/// to hang forever.
#[derive(Default)]
pub(crate) struct RecordingSink {
    sent: Mutex<Vec<AgentMessage>>,
    failing: Mutex<HashSet<String>>,
    stalling: Mutex<HashSet<String>>,
}

impl RecordingSink {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn fail_type(&self, msg_type: &str) {
        self.failing.lock().insert(msg_type.to_string());
    }

    pub(crate) fn heal_type(&self, msg_type: &str) {
        self.failing.lock().remove(msg_type);
    }

    pub(crate) fn stall_type(&self, msg_type: &str) {
        self.stalling.lock().insert(msg_type.to_string());
    }

    pub(crate) fn sent(&self) -> Vec<AgentMessage> {
        self.sent.lock().clone()
    }

    pub(crate) fn sent_of(&self, msg_type: &str) -> Vec<AgentMessage> {
        self.sent
            .lock()
            .iter()
            .filter(|m| m.msg_type == msg_type)
            .cloned()
            .collect()
    }

    /// Wait until a message of `msg_type` has been delivered.
    pub(crate) async fn wait_for(&self, msg_type: &str) -> AgentMessage {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(m) = self.sent_of(msg_type).into_iter().next() {
                return m;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("timeout waiting for {msg_type}; sent: {:?}", self.sent());
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait::async_trait]
impl MessageSink for RecordingSink {
    async fn send(&self, msg: AgentMessage) -> Result<(), BridgeError> {
        assert!(!msg.msg_type.is_empty(), "sent a message without a type");
        let stall = self.stalling.lock().contains(&msg.msg_type);
        if stall {
            std::future::pending::<()>().await;
        }
        let fail = self.failing.lock().contains(&msg.msg_type);
        if fail {
            return Err(BridgeError::NotConnected);
        }
        self.sent.lock().push(msg);
        Ok(())
    }
}

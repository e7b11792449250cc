//! Computer-use sessions and their queues of undelivered action results.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use ab_protocol::ComputerUseResultPayload;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};

/// An action result that has not been confirmed delivered.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingResult {
    /// Per-session enqueue sequence, used to acknowledge exactly this entry.
    pub seq: u64,
    /// Id of the `computer_use_action` this result answers.
    pub reply_to: String,
    pub payload: ComputerUseResultPayload,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct PendingQueue {
    next_seq: u64,
    items: VecDeque<PendingResult>,
}

/// A live computer-use session.
#[derive(Debug)]
pub struct ComputerUseSession {
    pub session_id: String,
    pub params: serde_json::Value,
    pub started_at: DateTime<Utc>,
    pending: Mutex<PendingQueue>,
}

impl ComputerUseSession {
    pub fn new(session_id: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            session_id: session_id.into(),
            params,
            started_at: Utc::now(),
            pending: Mutex::new(PendingQueue::default()),
        }
    }

    /// Queue a result ahead of sending it. Returns the sequence number to
    /// acknowledge once delivery succeeds.
    pub fn enqueue_pending(
        &self,
        reply_to: impl Into<String>,
        payload: ComputerUseResultPayload,
    ) -> u64 {
        let mut queue = self.pending.lock();
        let seq = queue.next_seq;
        queue.next_seq += 1;
        queue.items.push_back(PendingResult {
            seq,
            reply_to: reply_to.into(),
            payload,
            created_at: Utc::now(),
        });
        seq
    }

    /// Drop a delivered result. Returns `false` if it was already gone.
    pub fn ack_pending(&self, seq: u64) -> bool {
        let mut queue = self.pending.lock();
        match queue.items.iter().position(|p| p.seq == seq) {
            Some(idx) => {
                queue.items.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Oldest undelivered result, left in the queue.
    pub fn front_pending(&self) -> Option<PendingResult> {
        self.pending.lock().items.front().cloned()
    }

    pub fn pending_results(&self) -> Vec<PendingResult> {
        self.pending.lock().items.iter().cloned().collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().items.len()
    }
}

/// All live computer-use sessions, keyed by session id.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Arc<ComputerUseSession>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session, replacing any earlier one with the same id.
    pub fn insert(&self, session: ComputerUseSession) -> Arc<ComputerUseSession> {
        let session = Arc::new(session);
        self.sessions
            .write()
            .insert(session.session_id.clone(), session.clone());
        session
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<ComputerUseSession>> {
        self.sessions.read().get(session_id).cloned()
    }

    pub fn remove(&self, session_id: &str) -> Option<Arc<ComputerUseSession>> {
        self.sessions.write().remove(session_id)
    }

    /// Live sessions, oldest first.
    pub fn active_sessions(&self) -> Vec<Arc<ComputerUseSession>> {
        let mut sessions: Vec<_> = self.sessions.read().values().cloned().collect();
        sessions.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        sessions
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

//! In-flight execution registry, consulted when reconnecting so the
//! coordinator can reconcile instead of re-dispatching.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

/// One execution currently running on this agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackedTask {
    pub execution_id: String,
    pub task_type: String,
    pub started_at: DateTime<Utc>,
}

/// Thread-safe registry of in-flight executions. Cheap to clone; clones
/// share the same map.
#[derive(Debug, Clone, Default)]
pub struct TaskTracker {
    tasks: Arc<RwLock<HashMap<String, TrackedTask>>>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an execution. Tracking an id twice replaces the earlier entry.
    pub fn track(&self, execution_id: impl Into<String>, task_type: impl Into<String>) {
        let execution_id = execution_id.into();
        let task = TrackedTask {
            execution_id: execution_id.clone(),
            task_type: task_type.into(),
            started_at: Utc::now(),
        };
        self.tasks.write().insert(execution_id, task);
    }

    /// Track an execution and return a guard that completes it on drop,
    /// whichever way the owning future ends.
    pub fn track_guarded(
        &self,
        execution_id: impl Into<String>,
        task_type: impl Into<String>,
    ) -> TaskGuard {
        let execution_id = execution_id.into();
        self.track(execution_id.clone(), task_type);
        TaskGuard {
            tracker: self.clone(),
            execution_id,
        }
    }

    /// Remove an execution. Unknown ids are ignored.
    pub fn complete(&self, execution_id: &str) -> Option<TrackedTask> {
        self.tasks.write().remove(execution_id)
    }

    pub fn is_active(&self, execution_id: &str) -> bool {
        self.tasks.read().contains_key(execution_id)
    }

    /// Snapshot of active executions, oldest first.
    pub fn active_tasks(&self) -> Vec<TrackedTask> {
        let mut tasks: Vec<TrackedTask> = self.tasks.read().values().cloned().collect();
        tasks.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.execution_id.cmp(&b.execution_id))
        });
        tasks
    }

    /// Ids of active executions, sorted.
    pub fn active_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tasks.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn active_count(&self) -> usize {
        self.tasks.read().len()
    }

    /// Forget everything (full session reset).
    pub fn clear(&self) {
        self.tasks.write().clear();
    }
}

/// Completes its execution in the owning [`TaskTracker`] when dropped.
#[derive(Debug)]
pub struct TaskGuard {
    tracker: TaskTracker,
    execution_id: String,
}

impl TaskGuard {
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.tracker.complete(&self.execution_id);
    }
}

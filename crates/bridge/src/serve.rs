//! Serve-mode: at most one subordinate server process at a time.
//!
//! Status is derived solely from whether a handle is held, and feeds the
//! heartbeat so the coordinator always sees the current state.

use std::sync::Arc;

use ab_protocol::{ServeReadyPayload, ServeStartPayload, ServeStatus};
use parking_lot::Mutex;

use crate::types::{BridgeError, ExecutorError};

/// Starts subordinate servers.
#[async_trait::async_trait]
pub trait ServeLauncher: Send + Sync + 'static {
    async fn launch(&self, request: ServeStartPayload) -> Result<Box<dyn ServeHandle>, ExecutorError>;
}

/// A running subordinate server.
#[async_trait::async_trait]
pub trait ServeHandle: Send + Sync + 'static {
    /// Connection details reported in `mcp_serve_ready`.
    fn ready(&self) -> ServeReadyPayload;
    async fn stop(self: Box<Self>) -> Result<(), ExecutorError>;
}

enum Slot {
    Idle,
    Starting,
    Running(Box<dyn ServeHandle>),
}

/// Owns the single serve-mode slot.
pub struct ServeSupervisor {
    launcher: Option<Arc<dyn ServeLauncher>>,
    slot: Mutex<Slot>,
}

impl ServeSupervisor {
    pub fn new(launcher: Option<Arc<dyn ServeLauncher>>) -> Self {
        Self {
            launcher,
            slot: Mutex::new(Slot::Idle),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.launcher.is_some()
    }

    /// `running` while a handle is held, `stopped` otherwise.
    pub fn status(&self) -> ServeStatus {
        match *self.slot.lock() {
            Slot::Running(_) => ServeStatus::Running,
            Slot::Idle | Slot::Starting => ServeStatus::Stopped,
        }
    }

    /// Claim the slot for a new server. Fails if a server is running or
    /// another start is in flight.
    pub fn reserve(self: &Arc<Self>) -> Result<ServeReservation, BridgeError> {
        let Some(launcher) = self.launcher.clone() else {
            return Err(BridgeError::Config("no serve launcher configured".into()));
        };
        let mut slot = self.slot.lock();
        match &*slot {
            Slot::Idle => {}
            Slot::Starting => {
                return Err(BridgeError::Duplicate(
                    "serve-mode server is already starting".into(),
                ))
            }
            Slot::Running(_) => {
                return Err(BridgeError::Duplicate(
                    "serve-mode server is already running".into(),
                ))
            }
        }
        *slot = Slot::Starting;
        Ok(ServeReservation {
            supervisor: self.clone(),
            launcher,
            committed: false,
        })
    }

    /// Stop the running server. Stopping when nothing runs succeeds.
    pub async fn stop(&self) -> Result<ServeStatus, BridgeError> {
        let handle = {
            let mut slot = self.slot.lock();
            match std::mem::replace(&mut *slot, Slot::Idle) {
                Slot::Running(handle) => handle,
                Slot::Idle => return Ok(ServeStatus::Stopped),
                Slot::Starting => {
                    *slot = Slot::Starting;
                    return Err(BridgeError::Duplicate(
                        "serve-mode server is still starting".into(),
                    ));
                }
            }
        };
        handle.stop().await?;
        tracing::info!("serve-mode server stopped");
        Ok(ServeStatus::Stopped)
    }
}

/// Exclusive claim on the serve slot. Dropping it without a successful
/// launch releases the slot.
pub struct ServeReservation {
    supervisor: Arc<ServeSupervisor>,
    launcher: Arc<dyn ServeLauncher>,
    committed: bool,
}

impl ServeReservation {
    pub async fn launch(mut self, request: ServeStartPayload) -> Result<ServeReadyPayload, ExecutorError> {
        let handle = self.launcher.launch(request).await?;
        let ready = handle.ready();
        *self.supervisor.slot.lock() = Slot::Running(handle);
        self.committed = true;
        tracing::info!(url = %ready.url, pid = ?ready.pid, "serve-mode server running");
        Ok(ready)
    }
}

impl Drop for ServeReservation {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let mut slot = self.supervisor.slot.lock();
        if matches!(*slot, Slot::Starting) {
            *slot = Slot::Idle;
        }
    }
}

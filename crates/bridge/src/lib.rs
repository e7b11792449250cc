//! `ab-bridge`: protocol engine for agents that hold a persistent,
//! authenticated connection to a remote coordinator.
//!
//! An agent connects once, advertises what it can handle, and then receives
//! typed work requests that it hands to pluggable executors. Results flow
//! back over the same connection. The engine survives network flaps:
//! dropped links are re-established with back-off, network changes are
//! probed proactively, and long-lived sessions are re-declared after every
//! reconnect.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  Agent process                                               │
//! │                                                              │
//! │   let client = AgentClientBuilder::new()                     │
//! │       .url("wss://coord/agent/ws")                           │
//! │       .agent_id("build-box-3")                               │
//! │       .build()?;                                             │
//! │   let router = Router::builder(Arc::new(client.clone()))     │
//! │       .executor(ExecutionKind::Build, builds)                │
//! │       .tracker(client.tracker().clone())                     │
//! │       .build();                                              │
//! │   client.set_handler(Arc::new(router.clone()));              │
//! │   client.add_reconnect_listener(Arc::new(router.clone()));   │
//! │   client.connect().await?;                                   │
//! │   let _hb = client.start_heartbeat(&shutdown);               │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Connection flow
//!
//! 1. Connect WS (with `token=<token>&agent_id=<id>` query params)
//! 2. Send `agent_connect { agent_id, version, capabilities, active_executions }`
//! 3. Wait for `agent_connect_ack { success, signing_secret, config }`
//! 4. Main loop:
//!    - Verify critical messages against the signing secret
//!    - Consume heartbeats; route everything else through the [`Router`]
//!    - Emit periodic `heartbeat` with active task count and serve status
//! 5. On disconnect: fast retries, then capped exponential back-off; after
//!    the handshake succeeds, reconnect listeners restore session state
//!    before reading resumes

pub mod builder;
pub mod client;
pub mod executor;
pub mod netmon;
pub mod reconnect;
pub mod restore;
pub mod router;
pub mod serve;
pub mod session;
pub mod signer;
pub mod tracker;
pub mod types;

#[cfg(test)]
mod testing;

// ── Re-exports for ergonomic imports ─────────────────────────────────

pub use builder::AgentClientBuilder;
pub use client::{AgentClient, ClientConfig, HeartbeatHandle};
pub use executor::{
    CliExecutor, CliOutput, ComputerUseDriver, ExecutionContext, Executor, ExecutorResult,
    McpManager, NeverRetry, ProgressReporter, RetryPolicy,
};
pub use netmon::{
    CheckOutcome, ConnectionProbe, InterfaceSource, NetworkMonitor, SystemInterfaces,
};
pub use reconnect::{ReconnectConfig, ReconnectState, ReconnectStrategy};
pub use restore::ReconnectListener;
pub use router::{Handler, Router, RouterBuilder};
pub use serve::{ServeHandle, ServeLauncher, ServeSupervisor};
pub use session::{ComputerUseSession, SessionStore};
pub use signer::MessageSigner;
pub use tracker::{TaskGuard, TaskTracker, TrackedTask};
pub use types::{
    BridgeError, ConnectionState, ErrorCallback, ExecutorError, HeartbeatEnricher,
    InboundHandler, MessageSink,
};

// Re-export protocol types so agents never need to import ab-protocol directly.
pub use ab_protocol;
pub use ab_protocol::{AgentMessage, ExecutionKind, MessageType};

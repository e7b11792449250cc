//! Builder pattern for constructing an [`AgentClient`].

use std::time::Duration;

use crate::client::{AgentClient, ClientConfig};
use crate::reconnect::ReconnectConfig;
use crate::signer::MessageSigner;
use crate::tracker::TaskTracker;
use crate::types::{BridgeError, ErrorCallback, HeartbeatEnricher};

/// Fluent builder for [`AgentClient`].
///
/// # Example
///
/// ```rust,no_run
/// # use ab_bridge::AgentClientBuilder;
/// let client = AgentClientBuilder::new()
///     .url("wss://coordinator.example.com/agent/ws")
///     .token("secret")
///     .agent_id("build-box-3")
///     .version(env!("CARGO_PKG_VERSION"))
///     .heartbeat_interval(std::time::Duration::from_secs(30))
///     .build()
///     .unwrap();
/// ```
pub struct AgentClientBuilder {
    config: ClientConfig,
    signing_secret_hex: Option<String>,
    tracker: Option<TaskTracker>,
    on_error: Option<ErrorCallback>,
    enricher: Option<HeartbeatEnricher>,
}

impl Default for AgentClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentClientBuilder {
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
            signing_secret_hex: None,
            tracker: None,
            on_error: None,
            enricher: None,
        }
    }

    // ── Required ─────────────────────────────────────────────────────

    /// Coordinator WebSocket URL (e.g. `wss://coord.example.com/agent/ws`).
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.config.url = url.into();
        self
    }

    /// Authentication token, sent as the `token` query parameter.
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.config.token = Some(token.into());
        self
    }

    pub fn agent_id(mut self, id: impl Into<String>) -> Self {
        self.config.agent_id = id.into();
        self
    }

    // ── Identity ─────────────────────────────────────────────────────

    /// Version string reported in `agent_connect`.
    pub fn version(mut self, v: impl Into<String>) -> Self {
        self.config.version = v.into();
        self
    }

    // ── Behavior ─────────────────────────────────────────────────────

    /// Override the heartbeat interval (default 30s).
    pub fn heartbeat_interval(mut self, d: Duration) -> Self {
        self.config.heartbeat_interval = d;
        self
    }

    /// Transport connect timeout (default 15s).
    pub fn connect_timeout(mut self, d: Duration) -> Self {
        self.config.connect_timeout = d;
        self
    }

    /// How long to wait for `agent_connect_ack` (default 10s).
    pub fn handshake_timeout(mut self, d: Duration) -> Self {
        self.config.handshake_timeout = d;
        self
    }

    /// Per-write timeout (default 10s).
    pub fn write_timeout(mut self, d: Duration) -> Self {
        self.config.write_timeout = d;
        self
    }

    /// Liveness ping timeout (default 5s).
    pub fn ping_timeout(mut self, d: Duration) -> Self {
        self.config.ping_timeout = d;
        self
    }

    /// Upper bound on each reconnect listener (default 30s).
    pub fn listener_timeout(mut self, d: Duration) -> Self {
        self.config.listener_timeout = d;
        self
    }

    /// Override the reconnect backoff policy.
    pub fn reconnect(mut self, cfg: ReconnectConfig) -> Self {
        self.config.reconnect = cfg;
        self
    }

    // ── Wire limits ──────────────────────────────────────────────────

    /// Maximum inbound frame size (default 4 MiB).
    pub fn max_frame_bytes(mut self, n: usize) -> Self {
        self.config.max_frame_bytes = n;
        self
    }

    // ── Security ─────────────────────────────────────────────────────

    /// Pre-install a hex signing secret. A secret delivered in the
    /// handshake replaces it.
    pub fn signing_secret_hex(mut self, secret: impl Into<String>) -> Self {
        self.signing_secret_hex = Some(secret.into());
        self
    }

    // ── Hooks ────────────────────────────────────────────────────────

    /// Share a tracker with the router.
    pub fn tracker(mut self, tracker: TaskTracker) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn on_error(mut self, cb: ErrorCallback) -> Self {
        self.on_error = Some(cb);
        self
    }

    pub fn heartbeat_enricher(mut self, enricher: HeartbeatEnricher) -> Self {
        self.enricher = Some(enricher);
        self
    }

    // ── Build ────────────────────────────────────────────────────────

    /// Validate settings and build the client.
    pub fn build(self) -> Result<AgentClient, BridgeError> {
        let cfg = &self.config;
        if cfg.url.is_empty() {
            return Err(BridgeError::Config("url is required".into()));
        }
        if !(cfg.url.starts_with("ws://") || cfg.url.starts_with("wss://")) {
            return Err(BridgeError::Config(format!(
                "url must use ws:// or wss://, got {}",
                cfg.url
            )));
        }
        if cfg.agent_id.trim().is_empty() {
            return Err(BridgeError::Config("agent_id is required".into()));
        }
        if cfg.heartbeat_interval.is_zero() {
            return Err(BridgeError::Config("heartbeat_interval must be non-zero".into()));
        }
        if cfg.max_frame_bytes == 0 {
            return Err(BridgeError::Config("max_frame_bytes must be non-zero".into()));
        }

        let signer = MessageSigner::new();
        if let Some(secret) = &self.signing_secret_hex {
            signer.set_secret_hex(secret)?;
        }

        Ok(AgentClient::from_parts(
            self.config,
            signer,
            self.tracker.unwrap_or_default(),
            self.on_error,
            self.enricher,
        ))
    }
}

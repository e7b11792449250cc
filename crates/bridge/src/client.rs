//! Connection to the coordinator: handshake, the inbound read loop,
//! heartbeats, and reconnection.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use ab_protocol::{
    raw_payload, AgentMessage, ConnectAckPayload, ConnectPayload, DisconnectPayload,
    HeartbeatPayload, MessageType, DEFAULT_MAX_FRAME_BYTES, PROTOCOL_VERSION,
};
use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{FutureExt, SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::netmon::ConnectionProbe;
use crate::reconnect::{ReconnectConfig, ReconnectStrategy};
use crate::restore::ReconnectListener;
use crate::signer::MessageSigner;
use crate::tracker::TaskTracker;
use crate::types::{
    BridgeError, ConnectionState, ErrorCallback, HeartbeatEnricher, InboundHandler, MessageSink,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Static connection settings. Built by
/// [`AgentClientBuilder`](crate::builder::AgentClientBuilder).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub url: String,
    pub token: Option<String>,
    pub agent_id: String,
    pub version: String,
    pub heartbeat_interval: Duration,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub write_timeout: Duration,
    pub ping_timeout: Duration,
    /// Upper bound on each reconnect listener.
    pub listener_timeout: Duration,
    pub max_frame_bytes: usize,
    pub reconnect: ReconnectConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8080/agent/ws".into(),
            token: None,
            agent_id: "agent".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            heartbeat_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(15),
            handshake_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            ping_timeout: Duration::from_secs(5),
            listener_timeout: Duration::from_secs(30),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// State guarded together so transitions are atomic.
struct Link {
    state: ConnectionState,
    /// Set while a recovery sequence owns the connection.
    recovering: bool,
    /// Wakes the read loop of the current link.
    cancel: CancellationToken,
    /// Why the current link is being torn down.
    reason: Option<String>,
    /// Whether a reader task is alive.
    reading: bool,
}

struct Inner {
    config: ClientConfig,
    strategy: ReconnectStrategy,
    signer: MessageSigner,
    tracker: TaskTracker,
    link: Mutex<Link>,
    sink: tokio::sync::Mutex<Option<WsSink>>,
    handler: RwLock<Option<Arc<dyn InboundHandler>>>,
    listeners: RwLock<Vec<Arc<dyn ReconnectListener>>>,
    enricher: RwLock<Option<HeartbeatEnricher>>,
    on_error: Option<ErrorCallback>,
    runtime_config: RwLock<Option<serde_json::Value>>,
    /// Cancelled once, on disconnect. Parent of every link token.
    shutdown: CancellationToken,
    /// Fired when the client is closed or gives up reconnecting.
    terminated: CancellationToken,
}

enum ReaderStart {
    Live(WsSource, CancellationToken),
    Recover(String),
}

/// A connection to the coordinator.
///
/// Cheap to clone; clones share one connection. Create via
/// [`AgentClientBuilder`](crate::builder::AgentClientBuilder).
#[derive(Clone)]
pub struct AgentClient {
    inner: Arc<Inner>,
}

impl AgentClient {
    pub fn builder() -> crate::builder::AgentClientBuilder {
        crate::builder::AgentClientBuilder::new()
    }

    pub(crate) fn from_parts(
        config: ClientConfig,
        signer: MessageSigner,
        tracker: TaskTracker,
        on_error: Option<ErrorCallback>,
        enricher: Option<HeartbeatEnricher>,
    ) -> Self {
        let shutdown = CancellationToken::new();
        Self {
            inner: Arc::new(Inner {
                strategy: ReconnectStrategy::new(config.reconnect.clone()),
                config,
                signer,
                tracker,
                link: Mutex::new(Link {
                    state: ConnectionState::Disconnected,
                    recovering: false,
                    cancel: shutdown.child_token(),
                    reason: None,
                    reading: false,
                }),
                sink: tokio::sync::Mutex::new(None),
                handler: RwLock::new(None),
                listeners: RwLock::new(Vec::new()),
                enricher: RwLock::new(enricher),
                on_error,
                runtime_config: RwLock::new(None),
                shutdown,
                terminated: CancellationToken::new(),
            }),
        }
    }

    // ── Wiring ───────────────────────────────────────────────────────

    /// Install the receiver for inbound messages. Its
    /// [`capabilities`](InboundHandler::capabilities) are advertised on
    /// every handshake.
    pub fn set_handler(&self, handler: Arc<dyn InboundHandler>) {
        *self.inner.handler.write() = Some(handler);
    }

    /// Run `listener` after every successful reconnection.
    pub fn add_reconnect_listener(&self, listener: Arc<dyn ReconnectListener>) {
        self.inner.listeners.write().push(listener);
    }

    pub fn set_heartbeat_enricher(&self, enricher: HeartbeatEnricher) {
        *self.inner.enricher.write() = Some(enricher);
    }

    // ── Accessors ────────────────────────────────────────────────────

    pub fn state(&self) -> ConnectionState {
        self.inner.link.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn agent_id(&self) -> &str {
        &self.inner.config.agent_id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn signer(&self) -> &MessageSigner {
        &self.inner.signer
    }

    pub fn tracker(&self) -> &TaskTracker {
        &self.inner.tracker
    }

    pub fn strategy(&self) -> &ReconnectStrategy {
        &self.inner.strategy
    }

    /// Runtime configuration delivered in the last `agent_connect_ack`.
    pub fn runtime_config(&self) -> Option<serde_json::Value> {
        self.inner.runtime_config.read().clone()
    }

    /// Resolves once the client is closed or has exhausted reconnection.
    pub async fn terminated(&self) {
        self.inner.terminated.cancelled().await
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Open the connection and complete the handshake.
    ///
    /// Failures are returned as-is; `connect` never retries. On success the
    /// read loop runs in the background and recovers from later failures on
    /// its own.
    pub async fn connect(&self) -> Result<(), BridgeError> {
        {
            let mut link = self.inner.link.lock();
            if link.state != ConnectionState::Disconnected || link.recovering {
                return Err(BridgeError::InvalidState {
                    action: "connect",
                    state: link.state,
                });
            }
            link.state = ConnectionState::Connecting;
        }

        let (sink, stream) = match self.establish().await {
            Ok(pair) => pair,
            Err(e) => {
                self.transition(ConnectionState::Disconnected);
                tracing::warn!(url = %self.inner.config.url, error = %e, "connect failed");
                return Err(e);
            }
        };

        *self.inner.sink.lock().await = Some(sink);
        let Some(link) = self.mark_connected() else {
            self.close_sink().await;
            return Err(BridgeError::Closed);
        };
        self.inner.strategy.reset();
        self.spawn_reader(ReaderStart::Live(stream, link));
        Ok(())
    }

    /// Close the connection for good. Idempotent; always succeeds.
    pub async fn disconnect(&self, reason: &str) -> Result<(), BridgeError> {
        let was = {
            let mut link = self.inner.link.lock();
            let was = link.state;
            if was == ConnectionState::Closed {
                return Ok(());
            }
            link.state = ConnectionState::Closed;
            link.recovering = false;
            link.reason = Some(reason.to_string());
            link.cancel.cancel();
            was
        };

        if was == ConnectionState::Connected {
            let bye = DisconnectPayload {
                agent_id: self.inner.config.agent_id.clone(),
                reason: reason.to_string(),
            };
            match AgentMessage::with_new_id(MessageType::AgentDisconnect, &bye) {
                Ok(msg) => {
                    if let Err(e) = self.send(msg).await {
                        tracing::debug!(error = %e, "agent_disconnect not delivered");
                    }
                }
                Err(e) => tracing::debug!(error = %e, "failed to encode agent_disconnect"),
            }
        }

        self.close_sink().await;
        self.inner.shutdown.cancel();
        self.inner.terminated.cancel();
        // Break the client <-> router reference cycle.
        self.inner.handler.write().take();
        self.inner.listeners.write().clear();
        tracing::info!(agent_id = %self.inner.config.agent_id, reason, "disconnected");
        Ok(())
    }

    /// Force a reconnection, e.g. after a network change.
    ///
    /// No-op when closed or while a connection attempt or recovery is
    /// already underway. The backoff is reset first since the cause is not
    /// a failing coordinator.
    pub async fn trigger_reconnect(&self, reason: &str) {
        let wake = {
            let mut link = self.inner.link.lock();
            match link.state {
                ConnectionState::Closed
                | ConnectionState::Connecting
                | ConnectionState::Authenticating
                | ConnectionState::Reconnecting => {
                    tracing::debug!(state = %link.state, reason, "reconnect already in progress or closed");
                    return;
                }
                _ if link.recovering => {
                    tracing::debug!(reason, "reconnect already in progress");
                    return;
                }
                ConnectionState::Connected => {
                    link.recovering = true;
                    link.reason = Some(reason.to_string());
                    Some(link.cancel.clone())
                }
                ConnectionState::Disconnected => {
                    link.recovering = true;
                    None
                }
            }
        };

        tracing::info!(reason, "forced reconnect");
        self.inner.strategy.reset();
        match wake {
            Some(token) => token.cancel(),
            None => self.spawn_reader(ReaderStart::Recover(reason.to_string())),
        }
    }

    // ── Outbound ─────────────────────────────────────────────────────

    /// Sign (if critical) and write one message.
    ///
    /// Writes are serialized. A failed write drops the socket and wakes the
    /// read loop into recovery.
    pub async fn send(&self, mut msg: AgentMessage) -> Result<(), BridgeError> {
        if msg.msg_type.is_empty() {
            return Err(BridgeError::Protocol("message type is required".into()));
        }
        if msg.id.is_empty() {
            msg.id = uuid::Uuid::new_v4().to_string();
        }
        self.inner.signer.sign(&mut msg);
        let text = serde_json::to_string(&msg)?;

        let mut guard = self.inner.sink.lock().await;
        let Some(sink) = guard.as_mut() else {
            return Err(BridgeError::NotConnected);
        };
        let err = match tokio::time::timeout(self.inner.config.write_timeout, sink.send(Message::Text(text))).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => e.to_string(),
            Err(_) => "write timed out".to_string(),
        };
        *guard = None;
        drop(guard);

        tracing::warn!(msg_type = %msg.msg_type, error = %err, "write failed");
        self.fail_link(format!("write failed: {err}"));
        Err(BridgeError::Transport(err))
    }

    /// Liveness probe: a WebSocket ping under a short timeout.
    pub async fn ping(&self) -> Result<(), BridgeError> {
        let mut guard = self.inner.sink.lock().await;
        let Some(sink) = guard.as_mut() else {
            return Err(BridgeError::NotConnected);
        };
        match tokio::time::timeout(self.inner.config.ping_timeout, sink.send(Message::Ping(Vec::new()))).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(BridgeError::Transport(e.to_string())),
            Err(_) => Err(BridgeError::Transport("ping timed out".into())),
        }
    }

    /// Build and send one heartbeat.
    pub async fn send_heartbeat(&self) -> Result<(), BridgeError> {
        let mut hb = HeartbeatPayload {
            timestamp: Utc::now(),
            agent_id: self.inner.config.agent_id.clone(),
            active_tasks: self.inner.tracker.active_count(),
            ..Default::default()
        };
        let enricher = self.inner.enricher.read().clone();
        if let Some(enrich) = enricher {
            enrich(&mut hb);
        }
        self.send(AgentMessage::with_new_id(MessageType::Heartbeat, &hb)?)
            .await
    }

    /// Emit heartbeats every `heartbeat_interval` while connected.
    ///
    /// The emitter runs under a child of `cancel` owned by the returned
    /// handle, so each call gets its own scope and dropping the handle stops
    /// that emitter.
    pub fn start_heartbeat(&self, cancel: &CancellationToken) -> HeartbeatHandle {
        let scope = cancel.child_token();
        let token = scope.clone();
        let client = self.clone();
        let period = self.inner.config.heartbeat_interval;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = client.inner.shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if !client.is_connected() {
                    continue;
                }
                if let Err(e) = client.send_heartbeat().await {
                    tracing::debug!(error = %e, "heartbeat not sent");
                }
            }
            tracing::debug!("heartbeat emitter stopped");
        });

        HeartbeatHandle {
            scope,
            task: Some(task),
        }
    }

    // ── Internals ────────────────────────────────────────────────────

    fn report(&self, err: &BridgeError) {
        if let Some(cb) = &self.inner.on_error {
            cb(err);
        }
    }

    /// Move to `to` unless closed. Returns `false` if closed.
    fn transition(&self, to: ConnectionState) -> bool {
        let mut link = self.inner.link.lock();
        if link.state == ConnectionState::Closed {
            return false;
        }
        link.state = to;
        true
    }

    /// Enter Connected with a fresh link token, unless closed meanwhile.
    fn mark_connected(&self) -> Option<CancellationToken> {
        let mut link = self.inner.link.lock();
        if link.state == ConnectionState::Closed {
            return None;
        }
        link.state = ConnectionState::Connected;
        link.recovering = false;
        link.reason = None;
        link.cancel = self.inner.shutdown.child_token();
        Some(link.cancel.clone())
    }

    fn fail_link(&self, reason: String) {
        let mut link = self.inner.link.lock();
        if link.state == ConnectionState::Connected {
            link.reason.get_or_insert(reason);
            link.cancel.cancel();
        }
    }

    async fn close_sink(&self) {
        let sink = self.inner.sink.lock().await.take();
        if let Some(mut sink) = sink {
            let _ = tokio::time::timeout(self.inner.config.write_timeout, sink.close()).await;
        }
    }

    fn build_url(&self) -> String {
        let cfg = &self.inner.config;
        let sep = if cfg.url.contains('?') { "&" } else { "?" };
        match &cfg.token {
            Some(token) => format!("{}{sep}token={token}&agent_id={}", cfg.url, cfg.agent_id),
            None => format!("{}{sep}agent_id={}", cfg.url, cfg.agent_id),
        }
    }

    /// Transport connect plus `agent_connect` / `agent_connect_ack`.
    async fn establish(&self) -> Result<(WsSink, WsSource), BridgeError> {
        let cfg = &self.inner.config;
        if !self.transition(ConnectionState::Connecting) {
            return Err(BridgeError::Closed);
        }
        tracing::info!(url = %cfg.url, agent_id = %cfg.agent_id, "connecting to coordinator");

        let url = self.build_url();
        let (ws, _response) = tokio::time::timeout(cfg.connect_timeout, tokio_tungstenite::connect_async(url.as_str()))
            .await
            .map_err(|_| BridgeError::Transport("connect timed out".into()))?
            .map_err(|e| BridgeError::Transport(e.to_string()))?;
        let (mut sink, mut stream) = ws.split();

        if !self.transition(ConnectionState::Authenticating) {
            return Err(BridgeError::Closed);
        }

        // ── agent_connect ────────────────────────────────────────────
        let capabilities = self
            .inner
            .handler
            .read()
            .as_ref()
            .map(|h| h.capabilities())
            .unwrap_or_default();
        let hello = ConnectPayload {
            agent_id: cfg.agent_id.clone(),
            version: cfg.version.clone(),
            protocol_version: PROTOCOL_VERSION,
            capabilities,
            active_executions: self.inner.tracker.active_ids(),
        };
        let msg = AgentMessage::with_new_id(MessageType::AgentConnect, &hello)?;
        let text = serde_json::to_string(&msg)?;
        sink.send(Message::Text(text))
            .await
            .map_err(|e| BridgeError::Transport(e.to_string()))?;

        // ── agent_connect_ack ────────────────────────────────────────
        let ack = tokio::time::timeout(cfg.handshake_timeout, wait_for_ack(&mut stream))
            .await
            .map_err(|_| BridgeError::Handshake("timed out waiting for agent_connect_ack".into()))??;
        if !ack.success {
            return Err(BridgeError::Handshake(format!("rejected: {}", ack.message)));
        }

        if let Some(secret) = ack.signing_secret.as_deref().filter(|s| !s.is_empty()) {
            self.inner.signer.set_secret_hex(secret)?;
        }
        if let Some(runtime) = ack.config {
            *self.inner.runtime_config.write() = Some(runtime);
        }

        tracing::info!(
            agent_id = %cfg.agent_id,
            signed = self.inner.signer.has_secret(),
            in_flight = hello.active_executions.len(),
            "coordinator accepted handshake"
        );
        Ok((sink, stream))
    }

    fn spawn_reader(&self, start: ReaderStart) {
        self.inner.link.lock().reading = true;
        let client = self.clone();
        tokio::spawn(async move {
            client.reader(start).await;
            client.inner.link.lock().reading = false;
        });
    }

    async fn reader(&self, start: ReaderStart) {
        let (mut stream, mut link) = match start {
            ReaderStart::Live(stream, link) => (stream, link),
            ReaderStart::Recover(reason) => match self.recover(reason).await {
                Some(pair) => pair,
                None => return,
            },
        };

        loop {
            let reason = self.pump(&mut stream, &link).await;
            if self.inner.shutdown.is_cancelled() {
                return;
            }
            match self.recover(reason).await {
                Some((s, l)) => {
                    stream = s;
                    link = l;
                }
                None => return,
            }
        }
    }

    /// Read frames until the link drops. Returns why.
    async fn pump(&self, stream: &mut WsSource, link: &CancellationToken) -> String {
        loop {
            let frame = tokio::select! {
                _ = link.cancelled() => {
                    let reason = self.inner.link.lock().reason.take();
                    return reason.unwrap_or_else(|| "link cancelled".into());
                }
                frame = stream.next() => frame,
            };
            match frame {
                None => return "connection closed".into(),
                Some(Err(e)) => return format!("read error: {e}"),
                Some(Ok(Message::Close(frame))) => {
                    return match frame {
                        Some(f) => format!("closed by coordinator: {}", f.reason),
                        None => "closed by coordinator".into(),
                    };
                }
                Some(Ok(Message::Text(text))) => {
                    let processed = AssertUnwindSafe(self.process_frame(text)).catch_unwind().await;
                    if processed.is_err() {
                        tracing::error!("panic while processing inbound message");
                        self.report(&BridgeError::Protocol("inbound handler panicked".into()));
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    tracing::debug!(bytes = data.len(), "ignoring binary frame");
                }
                Some(Ok(_)) => {}
            }
        }
    }

    async fn process_frame(&self, text: String) {
        let max = self.inner.config.max_frame_bytes;
        if text.len() > max {
            tracing::warn!(bytes = text.len(), max, "inbound frame exceeds max_frame_bytes, dropping");
            self.report(&BridgeError::Protocol(format!(
                "frame of {} bytes exceeds limit of {max}",
                text.len()
            )));
            return;
        }

        let msg: AgentMessage = match serde_json::from_str(&text) {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!(error = %e, "failed to decode inbound frame");
                self.report(&BridgeError::Protocol(format!("undecodable frame: {e}")));
                return;
            }
        };
        if msg.msg_type.is_empty() {
            self.report(&BridgeError::Protocol("inbound message without type".into()));
            return;
        }
        let received = raw_payload(&text).ok().flatten();
        if !self.inner.signer.verify_received(&msg, received) {
            tracing::warn!(msg_type = %msg.msg_type, id = %msg.id, "signature verification failed, dropping");
            self.report(&BridgeError::Signature {
                msg_type: msg.msg_type,
                id: msg.id,
            });
            return;
        }
        if msg.kind() == Some(MessageType::Heartbeat) {
            tracing::trace!("coordinator heartbeat");
            return;
        }

        let handler = self.inner.handler.read().clone();
        let Some(handler) = handler else {
            tracing::debug!(msg_type = %msg.msg_type, "no inbound handler installed");
            return;
        };
        let msg_type = msg.msg_type.clone();
        // Handlers report their own failures.
        if let Err(e) = handler.handle_message(msg).await {
            tracing::debug!(msg_type = %msg_type, error = %e, "inbound handler returned error");
        }
    }

    /// Reconnect with backoff. Returns the new stream and link token, or
    /// `None` when closed or out of attempts.
    async fn recover(&self, reason: String) -> Option<(WsSource, CancellationToken)> {
        {
            let mut link = self.inner.link.lock();
            if link.state == ConnectionState::Closed {
                return None;
            }
            link.state = ConnectionState::Reconnecting;
            link.recovering = true;
        }
        self.close_sink().await;
        tracing::warn!(reason = %reason, "connection lost, reconnecting");

        loop {
            if !self.inner.strategy.can_retry() {
                let attempts = self.inner.strategy.current_attempt();
                tracing::error!(attempts, "reconnect attempts exhausted");
                {
                    let mut link = self.inner.link.lock();
                    if link.state != ConnectionState::Closed {
                        link.state = ConnectionState::Disconnected;
                    }
                    link.recovering = false;
                }
                self.report(&BridgeError::ReconnectExhausted(attempts));
                self.inner.terminated.cancel();
                return None;
            }

            let delay = self.inner.strategy.next_delay();
            tracing::info!(
                attempt = self.inner.strategy.current_attempt(),
                delay_ms = delay.as_millis() as u64,
                "reconnecting"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.inner.shutdown.cancelled() => return None,
            }

            match self.establish().await {
                Ok((sink, stream)) => {
                    *self.inner.sink.lock().await = Some(sink);
                    self.notify_listeners().await;
                    let Some(link) = self.mark_connected() else {
                        self.close_sink().await;
                        return None;
                    };
                    self.inner.strategy.reset();
                    tracing::info!(agent_id = %self.inner.config.agent_id, "reconnected");
                    return Some((stream, link));
                }
                Err(BridgeError::Closed) => return None,
                Err(e) => {
                    tracing::warn!(
                        attempt = self.inner.strategy.current_attempt(),
                        error = %e,
                        "reconnect attempt failed"
                    );
                    if !self.transition(ConnectionState::Reconnecting) {
                        return None;
                    }
                }
            }
        }
    }

    /// Run every reconnect listener, each bounded by `listener_timeout`.
    async fn notify_listeners(&self) {
        let listeners = self.inner.listeners.read().clone();
        if listeners.is_empty() {
            return;
        }
        let cancel = self.inner.shutdown.child_token();
        let limit = self.inner.config.listener_timeout;
        for listener in listeners {
            match tokio::time::timeout(limit, listener.on_reconnect(&cancel)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "reconnect listener failed");
                    self.report(&e);
                }
                Err(_) => {
                    tracing::warn!(timeout_ms = limit.as_millis() as u64, "reconnect listener timed out");
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl MessageSink for AgentClient {
    async fn send(&self, msg: AgentMessage) -> Result<(), BridgeError> {
        AgentClient::send(self, msg).await
    }
}

#[async_trait::async_trait]
impl ConnectionProbe for AgentClient {
    fn state(&self) -> ConnectionState {
        AgentClient::state(self)
    }

    async fn ping(&self) -> Result<(), BridgeError> {
        AgentClient::ping(self).await
    }

    async fn trigger_reconnect(&self, reason: &str) {
        AgentClient::trigger_reconnect(self, reason).await
    }
}

/// Owns one heartbeat emitter. Dropping it stops the emitter.
pub struct HeartbeatHandle {
    scope: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl HeartbeatHandle {
    pub fn stop(&self) {
        self.scope.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Stop the emitter and wait for it to exit.
    pub async fn shutdown(mut self) {
        self.scope.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        self.scope.cancel();
    }
}

/// Read until `agent_connect_ack` arrives.
async fn wait_for_ack(stream: &mut WsSource) -> Result<ConnectAckPayload, BridgeError> {
    while let Some(frame) = stream.next().await {
        let frame = frame.map_err(|e| BridgeError::Transport(e.to_string()))?;
        let text = match frame {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let msg: AgentMessage = match serde_json::from_str(&text) {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!(error = %e, "ignoring undecodable frame during handshake");
                continue;
            }
        };
        if msg.kind() != Some(MessageType::AgentConnectAck) {
            tracing::debug!(msg_type = %msg.msg_type, "ignoring message before agent_connect_ack");
            continue;
        }
        return msg.decode_payload::<ConnectAckPayload>().map_err(|e| {
            BridgeError::Handshake(format!("malformed agent_connect_ack: {e}"))
        });
    }
    Err(BridgeError::Handshake("connection closed before agent_connect_ack".into()))
}

//! Type-routed dispatch of inbound messages.
//!
//! Every inbound message is looked up in a closed table keyed by
//! [`MessageType`]. A route is either one of the built-in handlers below or
//! a custom [`Handler`] registered at runtime. Types with no route (and
//! types this build does not know at all) are ignored.
//!
//! Work requests are never executed on the caller's task: the router
//! validates the payload, records the execution in the [`TaskTracker`],
//! and spawns a task that eventually sends exactly one terminal response.

mod computer_use;
mod execution;
mod mcp;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ab_protocol::{AgentMessage, ExecutionKind, MessageType};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::executor::{
    CliExecutor, ComputerUseDriver, Executor, McpManager, NeverRetry, RetryPolicy,
};
use crate::restore::{restore_sessions, ReconnectListener, SESSION_RESTORE_TIMEOUT};
use crate::serve::{ServeLauncher, ServeSupervisor};
use crate::session::SessionStore;
use crate::tracker::TaskTracker;
use crate::types::{BridgeError, ErrorCallback, HeartbeatEnricher, InboundHandler, MessageSink};

/// Default bound on concurrently running executions.
pub const DEFAULT_MAX_CONCURRENT: usize = 16;

/// A custom message handler.
#[async_trait::async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, router: &Router, msg: AgentMessage) -> Result<(), BridgeError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Builtin {
    Heartbeat,
    Execution(ExecutionKind),
    Cli,
    McpStart,
    McpStop,
    ComputerUseStart,
    ComputerUseAction,
    ComputerUseEnd,
    ServeStart,
    ServeStop,
    ServeStatus,
}

#[derive(Clone)]
enum Route {
    Builtin(Builtin),
    Custom(Arc<dyn Handler>),
}

fn default_routes() -> HashMap<MessageType, Route> {
    let mut routes = HashMap::new();
    routes.insert(MessageType::Heartbeat, Route::Builtin(Builtin::Heartbeat));
    for kind in ExecutionKind::ALL {
        routes.insert(
            kind.request_type(),
            Route::Builtin(Builtin::Execution(kind)),
        );
    }
    let fixed = [
        (MessageType::CliRequest, Builtin::Cli),
        (MessageType::McpStart, Builtin::McpStart),
        (MessageType::McpStop, Builtin::McpStop),
        (MessageType::ComputerUseStart, Builtin::ComputerUseStart),
        (MessageType::ComputerUseAction, Builtin::ComputerUseAction),
        (MessageType::ComputerUseEnd, Builtin::ComputerUseEnd),
        (MessageType::McpServeStart, Builtin::ServeStart),
        (MessageType::McpServeStop, Builtin::ServeStop),
        (MessageType::McpServeStatus, Builtin::ServeStatus),
    ];
    for (msg_type, builtin) in fixed {
        routes.insert(msg_type, Route::Builtin(builtin));
    }
    routes
}

struct Shared {
    sink: Arc<dyn MessageSink>,
    routes: RwLock<HashMap<MessageType, Route>>,
    executors: HashMap<ExecutionKind, Arc<dyn Executor>>,
    cli: Option<Arc<dyn CliExecutor>>,
    mcp: Option<Arc<dyn McpManager>>,
    computer_use: Option<Arc<dyn ComputerUseDriver>>,
    sessions: Arc<SessionStore>,
    serve: Arc<ServeSupervisor>,
    tracker: TaskTracker,
    retry: Arc<dyn RetryPolicy>,
    on_error: Option<ErrorCallback>,
    cancel: CancellationToken,
    permits: Arc<Semaphore>,
    restore_timeout: Duration,
}

/// Routes inbound messages to handlers and executors.
///
/// Cheap to clone; all clones share the same table and state.
#[derive(Clone)]
pub struct Router {
    shared: Arc<Shared>,
}

impl Router {
    pub fn builder(sink: Arc<dyn MessageSink>) -> RouterBuilder {
        RouterBuilder::new(sink)
    }

    /// Install (or replace) the route for `msg_type`.
    pub fn register_handler<H: Handler>(&self, msg_type: MessageType, handler: H) {
        self.register_boxed(msg_type, Arc::new(handler));
    }

    /// Install a pre-boxed handler.
    pub fn register_boxed(&self, msg_type: MessageType, handler: Arc<dyn Handler>) {
        let replaced = self
            .shared
            .routes
            .write()
            .insert(msg_type, Route::Custom(handler))
            .is_some();
        tracing::debug!(msg_type = %msg_type, replaced, "handler registered");
    }

    /// Whether any route exists for `msg_type`.
    pub fn handles(&self, msg_type: MessageType) -> bool {
        self.shared.routes.read().contains_key(&msg_type)
    }

    /// Wire names of every routed type, sorted.
    pub fn routed_types(&self) -> Vec<String> {
        let mut types: Vec<MessageType> = self.shared.routes.read().keys().copied().collect();
        types.sort();
        types.into_iter().map(|t| t.as_str().to_string()).collect()
    }

    /// Dispatch one inbound message.
    ///
    /// Unknown and unrouted types succeed without invoking anything. A
    /// handler failure is passed to the error callback and returned.
    pub async fn handle_message(&self, msg: AgentMessage) -> Result<(), BridgeError> {
        let Some(msg_type) = msg.kind() else {
            tracing::debug!(msg_type = %msg.msg_type, id = %msg.id, "ignoring unknown message type");
            return Ok(());
        };
        let route = self.shared.routes.read().get(&msg_type).cloned();
        let Some(route) = route else {
            tracing::debug!(msg_type = %msg_type, "no route, ignoring");
            return Ok(());
        };

        let result = match route {
            Route::Builtin(builtin) => self.dispatch_builtin(builtin, msg).await,
            Route::Custom(handler) => handler.handle(self, msg).await,
        };
        if let Err(ref e) = result {
            tracing::warn!(msg_type = %msg_type, error = %e, "message handling failed");
            self.report(e);
        }
        result
    }

    async fn dispatch_builtin(&self, builtin: Builtin, msg: AgentMessage) -> Result<(), BridgeError> {
        match builtin {
            // Consumed by the client; only reachable when called directly.
            Builtin::Heartbeat => Ok(()),
            Builtin::Execution(kind) => self.handle_execution(kind, msg).await,
            Builtin::Cli => self.handle_cli(msg).await,
            Builtin::McpStart => self.handle_mcp_start(msg).await,
            Builtin::McpStop => self.handle_mcp_stop(msg).await,
            Builtin::ComputerUseStart => self.handle_computer_use_start(msg).await,
            Builtin::ComputerUseAction => self.handle_computer_use_action(msg).await,
            Builtin::ComputerUseEnd => self.handle_computer_use_end(msg).await,
            Builtin::ServeStart => self.handle_serve_start(msg).await,
            Builtin::ServeStop => self.handle_serve_stop(msg).await,
            Builtin::ServeStatus => self.handle_serve_status(msg).await,
        }
    }

    /// Send a message through the connection.
    pub async fn send(&self, msg: AgentMessage) -> Result<(), BridgeError> {
        self.shared.sink.send(msg).await
    }

    /// Build and send a response. `reply_to` becomes the message id so the
    /// coordinator can correlate it with the request; empty means fresh id.
    pub async fn respond<P: Serialize + ?Sized>(
        &self,
        msg_type: MessageType,
        reply_to: &str,
        payload: &P,
    ) -> Result<(), BridgeError> {
        let msg = if reply_to.is_empty() {
            AgentMessage::with_new_id(msg_type, payload)?
        } else {
            AgentMessage::new(msg_type, reply_to, payload)?
        };
        self.send(msg).await
    }

    /// Like [`respond`](Self::respond), but failures are logged and reported
    /// instead of returned. Used from spawned tasks.
    async fn deliver<P: Serialize + ?Sized>(&self, msg_type: MessageType, reply_to: &str, payload: &P) {
        if let Err(e) = self.respond(msg_type, reply_to, payload).await {
            tracing::warn!(msg_type = %msg_type, error = %e, "failed to deliver response");
            self.report(&e);
        }
    }

    fn report(&self, err: &BridgeError) {
        if let Some(cb) = &self.shared.on_error {
            cb(err);
        }
    }

    pub fn tracker(&self) -> &TaskTracker {
        &self.shared.tracker
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.shared.sessions
    }

    pub fn serve(&self) -> &Arc<ServeSupervisor> {
        &self.shared.serve
    }

    /// Enricher that stamps the serve-mode status on every heartbeat.
    pub fn heartbeat_enricher(&self) -> HeartbeatEnricher {
        let serve = self.shared.serve.clone();
        Arc::new(move |hb| {
            hb.serve_status = Some(serve.status().as_str().to_string());
        })
    }

    /// Cancel every in-flight execution and stop the serve-mode server.
    pub async fn shutdown(&self) {
        self.shared.cancel.cancel();
        if let Err(e) = self.shared.serve.stop().await {
            tracing::warn!(error = %e, "failed to stop serve-mode server during shutdown");
        }
        tracing::info!(in_flight = self.shared.tracker.active_count(), "router shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }
}

#[async_trait::async_trait]
impl InboundHandler for Router {
    async fn handle_message(&self, msg: AgentMessage) -> Result<(), BridgeError> {
        Router::handle_message(self, msg).await
    }

    fn capabilities(&self) -> Vec<String> {
        self.routed_types()
    }
}

#[async_trait::async_trait]
impl ReconnectListener for Router {
    async fn on_reconnect(&self, cancel: &CancellationToken) -> Result<(), BridgeError> {
        restore_sessions(
            &self.shared.sessions,
            self.shared.sink.as_ref(),
            cancel,
            self.shared.restore_timeout,
        )
        .await
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Builder
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Fluent construction of a [`Router`].
pub struct RouterBuilder {
    sink: Arc<dyn MessageSink>,
    executors: HashMap<ExecutionKind, Arc<dyn Executor>>,
    cli: Option<Arc<dyn CliExecutor>>,
    mcp: Option<Arc<dyn McpManager>>,
    computer_use: Option<Arc<dyn ComputerUseDriver>>,
    serve_launcher: Option<Arc<dyn ServeLauncher>>,
    tracker: Option<TaskTracker>,
    retry: Arc<dyn RetryPolicy>,
    on_error: Option<ErrorCallback>,
    max_concurrent: usize,
    restore_timeout: Duration,
}

impl RouterBuilder {
    pub fn new(sink: Arc<dyn MessageSink>) -> Self {
        Self {
            sink,
            executors: HashMap::new(),
            cli: None,
            mcp: None,
            computer_use: None,
            serve_launcher: None,
            tracker: None,
            retry: Arc::new(NeverRetry),
            on_error: None,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            restore_timeout: SESSION_RESTORE_TIMEOUT,
        }
    }

    pub fn executor(mut self, kind: ExecutionKind, executor: Arc<dyn Executor>) -> Self {
        self.executors.insert(kind, executor);
        self
    }

    pub fn cli_executor(mut self, cli: Arc<dyn CliExecutor>) -> Self {
        self.cli = Some(cli);
        self
    }

    pub fn mcp_manager(mut self, mcp: Arc<dyn McpManager>) -> Self {
        self.mcp = Some(mcp);
        self
    }

    pub fn computer_use(mut self, driver: Arc<dyn ComputerUseDriver>) -> Self {
        self.computer_use = Some(driver);
        self
    }

    pub fn serve_launcher(mut self, launcher: Arc<dyn ServeLauncher>) -> Self {
        self.serve_launcher = Some(launcher);
        self
    }

    /// Share a tracker with the client so `agent_connect` can report
    /// in-flight executions.
    pub fn tracker(mut self, tracker: TaskTracker) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry = policy;
        self
    }

    pub fn on_error(mut self, cb: ErrorCallback) -> Self {
        self.on_error = Some(cb);
        self
    }

    /// Maximum concurrent executions (default: 16). Zero is treated as one.
    pub fn max_concurrent(mut self, n: usize) -> Self {
        self.max_concurrent = n;
        self
    }

    pub fn restore_timeout(mut self, timeout: Duration) -> Self {
        self.restore_timeout = timeout;
        self
    }

    pub fn build(self) -> Router {
        Router {
            shared: Arc::new(Shared {
                sink: self.sink,
                routes: RwLock::new(default_routes()),
                executors: self.executors,
                cli: self.cli,
                mcp: self.mcp,
                computer_use: self.computer_use,
                sessions: Arc::new(SessionStore::new()),
                serve: Arc::new(ServeSupervisor::new(self.serve_launcher)),
                tracker: self.tracker.unwrap_or_default(),
                retry: self.retry,
                on_error: self.on_error,
                cancel: CancellationToken::new(),
                permits: Arc::new(Semaphore::new(self.max_concurrent.max(1))),
                restore_timeout: self.restore_timeout,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingSink;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn router() -> (Router, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::new());
        (Router::builder(sink.clone()).build(), sink)
    }

    fn raw(msg_type: &str, payload: serde_json::Value) -> AgentMessage {
        AgentMessage {
            msg_type: msg_type.into(),
            id: "m1".into(),
            timestamp: chrono::Utc::now(),
            payload,
            signature: None,
        }
    }

    struct Counting(Arc<AtomicUsize>);

    #[async_trait::async_trait]
    impl Handler for Counting {
        async fn handle(&self, _router: &Router, _msg: AgentMessage) -> Result<(), BridgeError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn unknown_type_is_ignored() {
        let (router, sink) = router();
        router
            .handle_message(raw("weather_report", serde_json::json!({})))
            .await
            .unwrap();
        assert!(sink.sent().is_empty());
    }

    #[tokio::test]
    async fn unrouted_known_type_is_ignored() {
        let (router, sink) = router();
        router
            .handle_message(raw("task_result", serde_json::json!({})))
            .await
            .unwrap();
        assert!(sink.sent().is_empty());
    }

    #[tokio::test]
    async fn heartbeat_route_is_noop() {
        let (router, sink) = router();
        router
            .handle_message(raw("heartbeat", serde_json::json!({})))
            .await
            .unwrap();
        assert!(sink.sent().is_empty());
    }

    #[tokio::test]
    async fn registered_handler_overrides_builtin() {
        let (router, sink) = router();
        let count = Arc::new(AtomicUsize::new(0));
        router.register_handler(MessageType::TaskRequest, Counting(count.clone()));

        router
            .handle_message(raw("task_request", serde_json::json!({"execution_id": "e1"})))
            .await
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(sink.sent().is_empty());
        assert_eq!(router.tracker().active_count(), 0);
    }

    #[tokio::test]
    async fn concurrent_registration_and_dispatch() {
        let (router, _sink) = router();
        let count = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for i in 0..32 {
            let router = router.clone();
            let count = count.clone();
            handles.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    router.register_handler(MessageType::DeployProgress, Counting(count));
                } else {
                    router
                        .handle_message(raw("deploy_progress", serde_json::json!({})))
                        .await
                        .unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert!(router.handles(MessageType::DeployProgress));
    }

    #[tokio::test]
    async fn handler_failure_reaches_error_callback() {
        struct Failing;
        #[async_trait::async_trait]
        impl Handler for Failing {
            async fn handle(&self, _router: &Router, _msg: AgentMessage) -> Result<(), BridgeError> {
                Err(BridgeError::Protocol("boom".into()))
            }
        }

        let errors = Arc::new(AtomicUsize::new(0));
        let seen = errors.clone();
        let router = Router::builder(Arc::new(RecordingSink::new()))
            .on_error(Arc::new(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            }))
            .build();
        router.register_handler(MessageType::QaProgress, Failing);

        let err = router
            .handle_message(raw("qa_progress", serde_json::json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Protocol(_)));
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn capabilities_cover_default_routes() {
        let (router, _) = router();
        let caps = router.routed_types();
        for expected in [
            "task_request",
            "build_request",
            "test_request",
            "qa_request",
            "codegen_request",
            "deploy_request",
            "cli_request",
            "mcp_start",
            "mcp_stop",
            "computer_use_start",
            "computer_use_action",
            "computer_use_end",
            "mcp_serve_start",
            "mcp_serve_stop",
            "mcp_serve_status",
        ] {
            assert!(caps.iter().any(|c| c == expected), "missing {expected}");
        }
        let mut sorted = caps.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), caps.len());
    }

    #[tokio::test]
    async fn heartbeat_enricher_reports_serve_status() {
        let (router, _) = router();
        let enrich = router.heartbeat_enricher();
        let mut hb = ab_protocol::HeartbeatPayload::default();
        enrich(&mut hb);
        assert_eq!(hb.serve_status.as_deref(), Some("stopped"));
    }
}

//! Execution lifecycle for task/build/test/QA/codegen/deploy and CLI
//! requests.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ab_protocol::{
    codes, AgentMessage, CliRequest, CliResult, ExecutionError, ExecutionKind, ExecutionRequest,
    ExecutionResult, MessageType,
};
use futures_util::FutureExt;
use tokio::sync::OwnedSemaphorePermit;
use tokio_util::sync::CancellationToken;

use super::Router;
use crate::executor::{CliExecutor, ExecutionContext, Executor, ProgressReporter};
use crate::tracker::TaskGuard;
use crate::types::{BridgeError, ExecutorError};

/// Why a supervised execution did not produce a value.
pub(super) enum Failure {
    Executor(ExecutorError),
    Panicked,
}

impl Failure {
    pub(super) fn code(&self) -> &'static str {
        match self {
            Failure::Executor(e) => e.code(),
            Failure::Panicked => codes::EXECUTION_PANICKED,
        }
    }

    pub(super) fn message(&self) -> String {
        match self {
            Failure::Executor(e) => e.to_string(),
            Failure::Panicked => "executor panicked".into(),
        }
    }
}

/// Drive `fut` to completion, converting a panic, an elapsed `limit`, or
/// cancellation of `cancel` into a [`Failure`].
pub(super) async fn supervise<T, F>(
    cancel: &CancellationToken,
    limit: Option<Duration>,
    fut: F,
) -> Result<T, Failure>
where
    F: Future<Output = Result<T, ExecutorError>>,
{
    let guarded = AssertUnwindSafe(fut).catch_unwind();
    let bounded = async {
        match limit {
            Some(limit) => tokio::time::timeout(limit, guarded).await.map_err(|_| {
                Failure::Executor(ExecutorError::Timeout(format!(
                    "exceeded {}s",
                    limit.as_secs()
                )))
            }),
            None => Ok(guarded.await),
        }
    };

    tokio::select! {
        _ = cancel.cancelled() => Err(Failure::Executor(ExecutorError::Cancelled(
            "agent shutting down".into(),
        ))),
        outcome = bounded => match outcome {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(e))) => Err(Failure::Executor(e)),
            Ok(Err(_panic)) => Err(Failure::Panicked),
            Err(failure) => Err(failure),
        },
    }
}

/// `timeout_secs` of zero means no limit.
fn limit_from(timeout_secs: Option<u64>) -> Option<Duration> {
    timeout_secs.filter(|s| *s > 0).map(Duration::from_secs)
}

impl Router {
    /// Wait for a concurrency permit, or give up when the router shuts down.
    pub(super) async fn acquire_permit(&self, cancel: &CancellationToken) -> Option<OwnedSemaphorePermit> {
        tokio::select! {
            permit = self.shared.permits.clone().acquire_owned() => permit.ok(),
            _ = cancel.cancelled() => None,
        }
    }

    // ── task / build / test / qa / codegen / deploy ────────────────

    pub(super) async fn handle_execution(
        &self,
        kind: ExecutionKind,
        msg: AgentMessage,
    ) -> Result<(), BridgeError> {
        let request = match msg.decode_payload::<ExecutionRequest>() {
            Ok(r) if !r.execution_id.is_empty() => r,
            Ok(_) => return Err(self.reject_execution(kind, &msg, "missing execution_id".into()).await),
            Err(e) => return Err(self.reject_execution(kind, &msg, e.to_string()).await),
        };

        let execution_id = request.execution_id.clone();
        let guard = self.shared.tracker.track_guarded(&execution_id, kind.as_str());
        tracing::debug!(execution_id = %execution_id, kind = %kind, "execution accepted");

        let Some(executor) = self.shared.executors.get(&kind).cloned() else {
            drop(guard);
            tracing::warn!(execution_id = %execution_id, kind = %kind, "no executor configured");
            let err = ExecutionError {
                execution_id,
                code: codes::NO_EXECUTOR.into(),
                message: format!("no {kind} executor configured"),
                retryable: false,
            };
            self.deliver(kind.error_type(), &msg.id, &err).await;
            return Ok(());
        };

        let router = self.clone();
        tokio::spawn(async move {
            router.run_execution(kind, executor, request, msg.id, guard).await;
        });
        Ok(())
    }

    async fn run_execution(
        self,
        kind: ExecutionKind,
        executor: Arc<dyn Executor>,
        request: ExecutionRequest,
        reply_to: String,
        _guard: TaskGuard,
    ) {
        let execution_id = request.execution_id.clone();
        let cancel = self.shared.cancel.child_token();
        let started = Instant::now();

        let outcome = match self.acquire_permit(&cancel).await {
            Some(_permit) => {
                let ctx = ExecutionContext {
                    execution_id: execution_id.clone(),
                    kind,
                    cancel: cancel.clone(),
                    progress: ProgressReporter::new(self.shared.sink.clone(), kind, &execution_id),
                };
                let limit = limit_from(request.timeout_secs);
                supervise(&cancel, limit, executor.execute(ctx, request)).await
            }
            None => Err(Failure::Executor(ExecutorError::Cancelled(
                "agent shutting down".into(),
            ))),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(output) => {
                tracing::info!(execution_id = %execution_id, kind = %kind, duration_ms, "execution completed");
                let result = ExecutionResult {
                    execution_id,
                    status: "completed".into(),
                    output,
                    duration_ms,
                };
                self.deliver(kind.result_type(), &reply_to, &result).await;
            }
            Err(failure) => {
                let retryable = match &failure {
                    Failure::Executor(e) => self.shared.retry.is_retryable(kind, e),
                    Failure::Panicked => false,
                };
                if matches!(failure, Failure::Panicked) {
                    tracing::error!(execution_id = %execution_id, kind = %kind, "executor panicked");
                } else {
                    tracing::warn!(
                        execution_id = %execution_id,
                        kind = %kind,
                        code = failure.code(),
                        duration_ms,
                        "execution failed"
                    );
                }
                let err = ExecutionError {
                    execution_id,
                    code: failure.code().into(),
                    message: failure.message(),
                    retryable,
                };
                self.deliver(kind.error_type(), &reply_to, &err).await;
            }
        }
    }

    /// Answer a malformed request with `INVALID_PAYLOAD` and build the
    /// error returned to the caller.
    async fn reject_execution(&self, kind: ExecutionKind, msg: &AgentMessage, reason: String) -> BridgeError {
        let err = ExecutionError {
            execution_id: msg.execution_id_hint(),
            code: codes::INVALID_PAYLOAD.into(),
            message: reason.clone(),
            retryable: false,
        };
        self.deliver(kind.error_type(), &msg.id, &err).await;
        BridgeError::Payload {
            msg_type: msg.msg_type.clone(),
            reason,
        }
    }

    // ── cli ─────────────────────────────────────────────────────────

    pub(super) async fn handle_cli(&self, msg: AgentMessage) -> Result<(), BridgeError> {
        let request = match msg.decode_payload::<CliRequest>() {
            Ok(r) if !r.execution_id.is_empty() && !r.command.is_empty() => r,
            Ok(r) if r.execution_id.is_empty() => {
                return Err(self.reject_cli(&msg, "missing execution_id".into()).await)
            }
            Ok(_) => return Err(self.reject_cli(&msg, "missing command".into()).await),
            Err(e) => return Err(self.reject_cli(&msg, e.to_string()).await),
        };

        let execution_id = request.execution_id.clone();
        let guard = self.shared.tracker.track_guarded(&execution_id, "cli");

        let Some(cli) = self.shared.cli.clone() else {
            drop(guard);
            tracing::warn!(execution_id = %execution_id, "no CLI executor configured");
            let result = CliResult {
                execution_id,
                code: Some(codes::NO_EXECUTOR.into()),
                error: Some("no CLI executor configured".into()),
                ..Default::default()
            };
            self.deliver(MessageType::CliResult, &msg.id, &result).await;
            return Ok(());
        };

        let router = self.clone();
        tokio::spawn(async move {
            router.run_cli(cli, request, msg.id, guard).await;
        });
        Ok(())
    }

    async fn run_cli(
        self,
        cli: Arc<dyn CliExecutor>,
        request: CliRequest,
        reply_to: String,
        _guard: TaskGuard,
    ) {
        let execution_id = request.execution_id.clone();
        let command = request.command.clone();
        let cancel = self.shared.cancel.child_token();
        let started = Instant::now();

        let outcome = match self.acquire_permit(&cancel).await {
            Some(_permit) => {
                let limit = limit_from(request.timeout_secs);
                supervise(&cancel, limit, cli.run(cancel.clone(), request)).await
            }
            None => Err(Failure::Executor(ExecutorError::Cancelled(
                "agent shutting down".into(),
            ))),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        let result = match outcome {
            Ok(output) => {
                tracing::info!(
                    execution_id = %execution_id,
                    command = %command,
                    exit_code = ?output.exit_code,
                    duration_ms,
                    "cli command finished"
                );
                CliResult {
                    execution_id,
                    success: output.exit_code == Some(0),
                    exit_code: output.exit_code,
                    stdout: output.stdout,
                    stderr: output.stderr,
                    duration_ms,
                    code: None,
                    error: None,
                }
            }
            Err(failure) => {
                tracing::warn!(
                    execution_id = %execution_id,
                    command = %command,
                    code = failure.code(),
                    "cli command failed"
                );
                CliResult {
                    execution_id,
                    duration_ms,
                    code: Some(failure.code().into()),
                    error: Some(failure.message()),
                    ..Default::default()
                }
            }
        };
        self.deliver(MessageType::CliResult, &reply_to, &result).await;
    }

    async fn reject_cli(&self, msg: &AgentMessage, reason: String) -> BridgeError {
        let result = CliResult {
            execution_id: msg.execution_id_hint(),
            code: Some(codes::INVALID_PAYLOAD.into()),
            error: Some(reason.clone()),
            ..Default::default()
        };
        self.deliver(MessageType::CliResult, &msg.id, &result).await;
        BridgeError::Payload {
            msg_type: msg.msg_type.clone(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{CliOutput, ExecutorResult, RetryPolicy};
    use crate::testing::RecordingSink;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn request(msg_type: &str, payload: serde_json::Value) -> AgentMessage {
        AgentMessage {
            msg_type: msg_type.into(),
            id: "req-1".into(),
            timestamp: chrono::Utc::now(),
            payload,
            signature: None,
        }
    }

    struct Echo;

    #[async_trait::async_trait]
    impl Executor for Echo {
        async fn execute(&self, ctx: ExecutionContext, request: ExecutionRequest) -> ExecutorResult {
            ctx.progress.report(150.0, "almost").await;
            Ok(serde_json::json!({"echo": request.spec}))
        }
    }

    struct Panics;

    #[async_trait::async_trait]
    impl Executor for Panics {
        async fn execute(&self, _ctx: ExecutionContext, _request: ExecutionRequest) -> ExecutorResult {
            panic!("executor bug");
        }
    }

    struct Fails;

    #[async_trait::async_trait]
    impl Executor for Fails {
        async fn execute(&self, _ctx: ExecutionContext, _request: ExecutionRequest) -> ExecutorResult {
            Err(ExecutorError::Failed("disk full".into()))
        }
    }

    struct Sleeps;

    #[async_trait::async_trait]
    impl Executor for Sleeps {
        async fn execute(&self, _ctx: ExecutionContext, _request: ExecutionRequest) -> ExecutorResult {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(serde_json::Value::Null)
        }
    }

    struct RetryFailures;

    impl RetryPolicy for RetryFailures {
        fn is_retryable(&self, _kind: ExecutionKind, error: &ExecutorError) -> bool {
            matches!(error, ExecutorError::Failed(_))
        }
    }

    fn router_with(kind: ExecutionKind, executor: Arc<dyn Executor>) -> (Router, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::new());
        let router = Router::builder(sink.clone()).executor(kind, executor).build();
        (router, sink)
    }

    async fn wait_idle(router: &Router) {
        for _ in 0..200 {
            if router.tracker().active_count() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("tracker never drained: {:?}", router.tracker().active_ids());
    }

    #[tokio::test]
    async fn missing_executor_yields_no_executor_error() {
        let sink = Arc::new(RecordingSink::new());
        let router = Router::builder(sink.clone()).build();

        router
            .handle_message(request("task_request", serde_json::json!({"execution_id": "e1"})))
            .await
            .unwrap();

        let sent = sink.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].msg_type, "task_error");
        assert_eq!(sent[0].id, "req-1");
        assert_eq!(sent[0].payload["execution_id"], "e1");
        assert_eq!(sent[0].payload["code"], "NO_EXECUTOR");
        assert_eq!(sent[0].payload["retryable"], false);
        assert_eq!(router.tracker().active_count(), 0);
    }

    #[tokio::test]
    async fn malformed_payload_answers_invalid_payload() {
        let sink = Arc::new(RecordingSink::new());
        let router = Router::builder(sink.clone()).build();

        let err = router
            .handle_message(request(
                "build_request",
                serde_json::json!({"execution_id": "e9", "timeout_secs": "soon"}),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Payload { .. }));

        let reply = sink.wait_for("build_error").await;
        assert_eq!(reply.payload["execution_id"], "e9");
        assert_eq!(reply.payload["code"], "INVALID_PAYLOAD");
        assert_eq!(reply.payload["retryable"], false);
    }

    #[tokio::test]
    async fn successful_execution_reports_progress_then_result() {
        let (router, sink) = router_with(ExecutionKind::Build, Arc::new(Echo));
        router
            .handle_message(request(
                "build_request",
                serde_json::json!({"execution_id": "b1", "spec": {"target": "x"}}),
            ))
            .await
            .unwrap();

        let result = sink.wait_for("build_result").await;
        assert_eq!(result.id, "req-1");
        assert_eq!(result.payload["execution_id"], "b1");
        assert_eq!(result.payload["status"], "completed");
        assert_eq!(result.payload["output"]["echo"]["target"], "x");

        let progress = sink.sent_of("build_progress");
        assert_eq!(progress.len(), 1);
        assert_eq!(progress[0].payload["progress"], 100.0);
        wait_idle(&router).await;
    }

    #[tokio::test]
    async fn panic_is_contained_and_reported() {
        let (router, sink) = router_with(ExecutionKind::Test, Arc::new(Panics));
        router
            .handle_message(request("test_request", serde_json::json!({"execution_id": "t1"})))
            .await
            .unwrap();

        let err = sink.wait_for("test_error").await;
        assert_eq!(err.payload["code"], "EXECUTION_PANICKED");
        assert_eq!(err.payload["retryable"], false);
        wait_idle(&router).await;
        assert!(sink.sent_of("test_result").is_empty());
    }

    #[tokio::test]
    async fn failure_retryability_comes_from_policy() {
        let sink = Arc::new(RecordingSink::new());
        let router = Router::builder(sink.clone())
            .executor(ExecutionKind::Qa, Arc::new(Fails))
            .retry_policy(Arc::new(RetryFailures))
            .build();
        router
            .handle_message(request("qa_request", serde_json::json!({"execution_id": "q1"})))
            .await
            .unwrap();

        let err = sink.wait_for("qa_error").await;
        assert_eq!(err.payload["code"], "EXECUTION_FAILED");
        assert_eq!(err.payload["retryable"], true);
    }

    #[tokio::test]
    async fn default_policy_never_retries() {
        let (router, sink) = router_with(ExecutionKind::Deploy, Arc::new(Fails));
        router
            .handle_message(request("deploy_request", serde_json::json!({"execution_id": "d1"})))
            .await
            .unwrap();
        let err = sink.wait_for("deploy_error").await;
        assert_eq!(err.payload["retryable"], false);
    }

    #[tokio::test]
    async fn per_request_timeout() {
        let (router, sink) = router_with(ExecutionKind::Codegen, Arc::new(Sleeps));
        router
            .handle_message(request(
                "codegen_request",
                serde_json::json!({"execution_id": "c1", "timeout_secs": 1}),
            ))
            .await
            .unwrap();

        let err = sink.wait_for("codegen_error").await;
        assert_eq!(err.payload["code"], "TIMEOUT");
    }

    #[tokio::test]
    async fn shutdown_cancels_in_flight() {
        let (router, sink) = router_with(ExecutionKind::Task, Arc::new(Sleeps));
        router
            .handle_message(request("task_request", serde_json::json!({"execution_id": "e1"})))
            .await
            .unwrap();
        assert!(router.tracker().is_active("e1"));

        router.shutdown().await;
        let err = sink.wait_for("task_error").await;
        assert_eq!(err.payload["code"], "CANCELLED");
        wait_idle(&router).await;
    }

    #[tokio::test]
    async fn one_terminal_response_per_execution() {
        let (router, sink) = router_with(ExecutionKind::Task, Arc::new(Echo));
        for i in 0..20 {
            router
                .handle_message(request(
                    "task_request",
                    serde_json::json!({"execution_id": format!("e{i}")}),
                ))
                .await
                .unwrap();
        }
        wait_idle(&router).await;
        for _ in 0..200 {
            if sink.sent_of("task_result").len() == 20 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let mut ids: Vec<String> = sink
            .sent_of("task_result")
            .iter()
            .map(|m| m.payload["execution_id"].as_str().unwrap_or_default().to_string())
            .collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 20);
        assert!(sink.sent_of("task_error").is_empty());
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        struct Gauge {
            current: AtomicUsize,
            peak: AtomicUsize,
        }

        #[async_trait::async_trait]
        impl Executor for Arc<Gauge> {
            async fn execute(&self, _ctx: ExecutionContext, _request: ExecutionRequest) -> ExecutorResult {
                let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                self.current.fetch_sub(1, Ordering::SeqCst);
                Ok(serde_json::Value::Null)
            }
        }

        let gauge = Arc::new(Gauge {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let sink = Arc::new(RecordingSink::new());
        let router = Router::builder(sink.clone())
            .executor(ExecutionKind::Task, Arc::new(gauge.clone()))
            .max_concurrent(2)
            .build();
        for i in 0..6 {
            router
                .handle_message(request(
                    "task_request",
                    serde_json::json!({"execution_id": format!("e{i}")}),
                ))
                .await
                .unwrap();
        }
        wait_idle(&router).await;
        assert!(gauge.peak.load(Ordering::SeqCst) <= 2);
    }

    struct FixedCli;

    #[async_trait::async_trait]
    impl CliExecutor for FixedCli {
        async fn run(&self, _cancel: CancellationToken, request: CliRequest) -> Result<CliOutput, ExecutorError> {
            let exit_code = if request.command == "false" { 1 } else { 0 };
            Ok(CliOutput {
                exit_code: Some(exit_code),
                stdout: format!("ran {}", request.command),
                stderr: String::new(),
            })
        }
    }

    #[tokio::test]
    async fn cli_request_yields_cli_result() {
        let sink = Arc::new(RecordingSink::new());
        let router = Router::builder(sink.clone()).cli_executor(Arc::new(FixedCli)).build();
        router
            .handle_message(request(
                "cli_request",
                serde_json::json!({"execution_id": "x1", "command": "true"}),
            ))
            .await
            .unwrap();

        let result = sink.wait_for("cli_result").await;
        assert_eq!(result.payload["execution_id"], "x1");
        assert_eq!(result.payload["success"], true);
        assert_eq!(result.payload["exit_code"], 0);
        assert_eq!(result.payload["stdout"], "ran true");
        wait_idle(&router).await;
    }

    #[tokio::test]
    async fn cli_without_executor_or_command() {
        let sink = Arc::new(RecordingSink::new());
        let router = Router::builder(sink.clone()).build();

        router
            .handle_message(request(
                "cli_request",
                serde_json::json!({"execution_id": "x1", "command": "ls"}),
            ))
            .await
            .unwrap();
        let err = router
            .handle_message(request("cli_request", serde_json::json!({"execution_id": "x2"})))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Payload { .. }));

        let results = sink.sent_of("cli_result");
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].payload["code"], "NO_EXECUTOR");
        assert_eq!(results[1].payload["code"], "INVALID_PAYLOAD");
        assert_eq!(results[1].payload["execution_id"], "x2");
    }
}

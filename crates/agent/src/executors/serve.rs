//! Serve-mode launcher that runs the configured program as a child process.

use std::process::Stdio;
use std::time::Duration;

use ab_bridge::ab_protocol::{ServeReadyPayload, ServeStartPayload};
use ab_bridge::{ExecutorError, ServeHandle, ServeLauncher};
use tokio::process::{Child, Command};

use crate::config::ServeConfig;

/// Exported to the child so it knows where to listen.
pub const SERVE_HOST_ENV: &str = "AB_SERVE_HOST";
pub const SERVE_PORT_ENV: &str = "AB_SERVE_PORT";

pub struct CommandServeLauncher {
    config: ServeConfig,
}

impl CommandServeLauncher {
    pub fn new(config: ServeConfig) -> Self {
        Self { config }
    }

    /// Program and arguments for `request`, honoring
    /// `serve.allow_request_command`.
    fn resolve(&self, request: &ServeStartPayload) -> Result<(String, Vec<String>), ExecutorError> {
        let mut args = self.config.args.clone();
        let program = if self.config.allow_request_command {
            args.extend(request.args.iter().cloned());
            request.command.clone().or_else(|| self.config.command.clone())
        } else {
            if request.command.is_some() || !request.args.is_empty() {
                tracing::warn!("ignoring command in mcp_serve_start; serve.allow_request_command is off");
            }
            self.config.command.clone()
        };
        match program {
            Some(p) if !p.trim().is_empty() => Ok((p, args)),
            _ => Err(ExecutorError::InvalidRequest("no serve command configured".into())),
        }
    }
}

#[async_trait::async_trait]
impl ServeLauncher for CommandServeLauncher {
    async fn launch(&self, request: ServeStartPayload) -> Result<Box<dyn ServeHandle>, ExecutorError> {
        let (program, args) = self.resolve(&request)?;
        let port = request.port.unwrap_or(self.config.port);

        let mut child = Command::new(&program)
            .args(&args)
            .env(SERVE_HOST_ENV, &self.config.host)
            .env(SERVE_PORT_ENV, port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecutorError::Failed(format!("failed to spawn {program}: {e}")))?;

        tokio::time::sleep(Duration::from_millis(self.config.startup_grace_ms)).await;
        match child.try_wait() {
            Ok(Some(status)) => {
                return Err(ExecutorError::Failed(format!(
                    "{program} exited during startup ({status})"
                )))
            }
            Ok(None) => {}
            Err(e) => return Err(ExecutorError::Failed(format!("checking {program}: {e}"))),
        }

        let pid = child.id();
        tracing::info!(program = %program, port, pid = ?pid, "serve-mode process started");
        Ok(Box::new(ChildServeHandle {
            child: tokio::sync::Mutex::new(child),
            ready: ServeReadyPayload {
                url: format!("http://{}:{port}", self.config.host),
                pid,
            },
        }))
    }
}

/// A running serve-mode child. Dropping it kills the process.
pub struct ChildServeHandle {
    child: tokio::sync::Mutex<Child>,
    ready: ServeReadyPayload,
}

#[async_trait::async_trait]
impl ServeHandle for ChildServeHandle {
    fn ready(&self) -> ServeReadyPayload {
        self.ready.clone()
    }

    async fn stop(self: Box<Self>) -> Result<(), ExecutorError> {
        let ChildServeHandle { child, ready } = *self;
        let mut child = child.into_inner();
        if let Ok(Some(status)) = child.try_wait() {
            tracing::info!(%status, "serve-mode process had already exited");
            return Ok(());
        }
        child
            .kill()
            .await
            .map_err(|e| ExecutorError::Failed(format!("failed to stop serve-mode process: {e}")))?;
        tracing::info!(pid = ?ready.pid, "serve-mode process stopped");
        Ok(())
    }
}

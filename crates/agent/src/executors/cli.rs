//! `cli_request` runner backed by `tokio::process`.

use std::process::Stdio;
use std::time::Duration;

use ab_bridge::ab_protocol::CliRequest;
use ab_bridge::{CliExecutor, CliOutput, ExecutorError};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::config::CliConfig;

const TRUNCATED_MARKER: &str = "\n[output truncated]";

/// Check if an environment variable name is dangerous to override.
pub(crate) fn is_dangerous_env_var(name: &str) -> bool {
    const BLOCKED: &[&str] = &[
        "LD_PRELOAD", "LD_LIBRARY_PATH", "LD_AUDIT",
        "DYLD_INSERT_LIBRARIES", "DYLD_LIBRARY_PATH", "DYLD_FRAMEWORK_PATH",
        "PATH", "HOME", "USER", "SHELL",
        "SSH_AUTH_SOCK", "SSH_AGENT_PID",
        "PYTHONPATH", "PYTHONSTARTUP", "PYTHONHOME",
        "NODE_PATH", "NODE_OPTIONS",
        "RUBYLIB", "RUBYOPT",
        "PERL5LIB", "PERL5OPT",
        "CLASSPATH",
        "BASH_ENV", "ENV", "IFS", "CDPATH",
    ];
    let upper = name.to_ascii_uppercase();
    BLOCKED.contains(&upper.as_str())
}

/// Cut `s` to at most `limit` bytes on a char boundary.
fn truncate_output(mut s: String, limit: usize) -> String {
    if s.len() <= limit {
        return s;
    }
    let mut end = limit;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
    s.push_str(TRUNCATED_MARKER);
    s
}

/// Runs the requested program directly (no shell) with captured output.
pub struct ProcessCliExecutor {
    config: CliConfig,
}

impl ProcessCliExecutor {
    pub fn new(config: CliConfig) -> Self {
        Self { config }
    }

    fn check_request(&self, request: &CliRequest) -> Result<(), ExecutorError> {
        if request.command.trim().is_empty() {
            return Err(ExecutorError::InvalidRequest("command is required".into()));
        }
        let allowed = &self.config.allowed_commands;
        if !allowed.is_empty() && !allowed.iter().any(|c| c == &request.command) {
            return Err(ExecutorError::InvalidRequest(format!(
                "command '{}' is not in cli.allowed_commands",
                request.command
            )));
        }
        if let Some(name) = request.env.keys().find(|k| is_dangerous_env_var(k)) {
            return Err(ExecutorError::InvalidRequest(format!(
                "environment variable '{name}' is blocked by security policy"
            )));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl CliExecutor for ProcessCliExecutor {
    async fn run(&self, cancel: CancellationToken, request: CliRequest) -> Result<CliOutput, ExecutorError> {
        self.check_request(&request)?;

        let mut cmd = Command::new(&request.command);
        cmd.args(&request.args)
            .envs(&request.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &request.cwd {
            cmd.current_dir(cwd);
        }

        let child = cmd
            .spawn()
            .map_err(|e| ExecutorError::Failed(format!("failed to spawn {}: {e}", request.command)))?;
        tracing::debug!(
            execution_id = %request.execution_id,
            command = %request.command,
            pid = ?child.id(),
            "cli command started"
        );

        let timeout_secs = request.timeout_secs.unwrap_or(self.config.default_timeout_secs);
        // Dropping the wait future drops the child, which kills it.
        let output = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(ExecutorError::Cancelled("agent shutting down".into()));
            }
            res = tokio::time::timeout(Duration::from_secs(timeout_secs), child.wait_with_output()) => match res {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => return Err(ExecutorError::Failed(format!("waiting for {}: {e}", request.command))),
                Err(_) => {
                    return Err(ExecutorError::Timeout(format!(
                        "{} exceeded {timeout_secs}s",
                        request.command
                    )))
                }
            },
        };

        let limit = self.config.max_output_bytes;
        Ok(CliOutput {
            exit_code: output.status.code(),
            stdout: truncate_output(String::from_utf8_lossy(&output.stdout).into_owned(), limit),
            stderr: truncate_output(String::from_utf8_lossy(&output.stderr).into_owned(), limit),
        })
    }
}

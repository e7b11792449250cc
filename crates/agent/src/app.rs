//! Wires config, client, router, heartbeat, and network monitor together.

use std::sync::Arc;
use std::time::Duration;

use ab_bridge::{
    AgentClient, AgentClientBuilder, BridgeError, ErrorCallback, NetworkMonitor, Router,
};
use anyhow::Context;
use tokio_util::sync::CancellationToken;

use crate::config::{AgentConfig, ConfigSeverity};
use crate::executors::{CommandServeLauncher, ProcessCliExecutor};

/// Reported as the `agent_disconnect` reason on a clean exit.
pub const SHUTDOWN_REASON: &str = "agent shutting down";

fn error_callback() -> ErrorCallback {
    Arc::new(|e: &BridgeError| {
        tracing::warn!(error = %e, "bridge error");
    })
}

/// Log every validation issue and fail on any error.
pub fn check_config(
    config: &AgentConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<()> {
    let issues = config.validate(lookup);
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    let errors = issues
        .iter()
        .filter(|i| i.severity == ConfigSeverity::Error)
        .count();
    if errors > 0 {
        anyhow::bail!("config validation failed with {errors} error(s)");
    }
    Ok(())
}

/// Build the client from config. Secrets are read through `lookup`.
pub fn build_client(
    config: &AgentConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<AgentClient> {
    let conn = &config.connection;
    let mut builder = AgentClientBuilder::new()
        .url(&conn.url)
        .agent_id(&conn.agent_id)
        .version(env!("CARGO_PKG_VERSION"))
        .heartbeat_interval(Duration::from_secs(conn.heartbeat_interval_secs))
        .connect_timeout(Duration::from_secs(conn.connect_timeout_secs))
        .handshake_timeout(Duration::from_secs(conn.handshake_timeout_secs))
        .write_timeout(Duration::from_secs(conn.write_timeout_secs))
        .ping_timeout(Duration::from_secs(conn.ping_timeout_secs))
        .listener_timeout(Duration::from_secs(config.executions.listener_timeout_secs))
        .max_frame_bytes(conn.max_frame_bytes)
        .reconnect(config.reconnect.to_reconnect_config())
        .on_error(error_callback());

    match lookup(&conn.token_env) {
        Some(token) => builder = builder.token(token),
        None => tracing::warn!(
            token_env = %conn.token_env,
            "no connection token set, connecting without one"
        ),
    }
    if let Some(secret) = lookup(&config.security.signing_secret_env) {
        builder = builder.signing_secret_hex(secret.trim());
    }

    builder.build().context("invalid connection settings")
}

/// Build the router with the executors enabled in config.
pub fn build_router(config: &AgentConfig, client: &AgentClient) -> Router {
    let mut builder = Router::builder(Arc::new(client.clone()))
        .tracker(client.tracker().clone())
        .max_concurrent(config.executions.max_concurrent)
        .restore_timeout(Duration::from_secs(config.executions.restore_timeout_secs))
        .on_error(error_callback());
    if config.cli.enabled {
        builder = builder.cli_executor(Arc::new(ProcessCliExecutor::new(config.cli.clone())));
    }
    if config.serve.command.is_some() {
        builder = builder.serve_launcher(Arc::new(CommandServeLauncher::new(config.serve.clone())));
    }
    builder.build()
}

/// Connect and serve until a shutdown signal arrives or the client gives up
/// reconnecting.
pub async fn run(config: AgentConfig) -> anyhow::Result<()> {
    tracing::info!(
        url = %config.connection.url,
        agent_id = %config.connection.agent_id,
        "agent-bridge starting"
    );

    check_config(&config, |k| std::env::var(k).ok())?;
    let client = build_client(&config, |k| std::env::var(k).ok())?;
    let router = build_router(&config, &client);
    client.set_handler(Arc::new(router.clone()));
    client.add_reconnect_listener(Arc::new(router.clone()));
    client.set_heartbeat_enricher(router.heartbeat_enricher());

    client
        .connect()
        .await
        .with_context(|| format!("connecting to {}", config.connection.url))?;

    // ── Background loops ─────────────────────────────────────────────
    let shutdown = CancellationToken::new();
    let heartbeat = client.start_heartbeat(&shutdown);
    let monitor = config.network.monitor.then(|| {
        let interval = Duration::from_secs(config.network.poll_interval_secs);
        Arc::new(NetworkMonitor::new(Arc::new(client.clone()), interval)).spawn(shutdown.clone())
    });

    let gave_up = tokio::select! {
        _ = shutdown_signal() => false,
        _ = client.terminated() => true,
    };

    // ── Teardown ─────────────────────────────────────────────────────
    shutdown.cancel();
    heartbeat.shutdown().await;
    if let Some(monitor) = monitor {
        if let Err(e) = monitor.await {
            tracing::error!(error = %e, "network monitor task failed");
        }
    }
    router.shutdown().await;
    client.disconnect(SHUTDOWN_REASON).await?;

    if gave_up {
        anyhow::bail!("gave up reconnecting to {}", config.connection.url);
    }
    tracing::info!("agent-bridge stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => tokio::select! {
                _ = ctrl_c => tracing::info!("received SIGINT, shutting down"),
                _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
            },
            Err(e) => {
                tracing::warn!(error = %e, "failed to register SIGTERM handler");
                let _ = ctrl_c.await;
                tracing::info!("received SIGINT, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        tracing::info!("received SIGINT, shutting down");
    }
}

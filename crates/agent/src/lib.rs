//! `ab-agent`: the `agent-bridge` binary's library half.
//!
//! Loads [`config::AgentConfig`], builds an [`ab_bridge::AgentClient`] and
//! [`ab_bridge::Router`] from it, plugs in process-backed executors, and
//! runs until shutdown.

pub mod app;
pub mod cli;
pub mod config;
pub mod executors;

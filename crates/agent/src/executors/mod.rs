//! Process-backed implementations of the bridge's executor seams.

mod cli;
mod serve;

pub use cli::ProcessCliExecutor;
pub use serve::{ChildServeHandle, CommandServeLauncher, SERVE_HOST_ENV, SERVE_PORT_ENV};

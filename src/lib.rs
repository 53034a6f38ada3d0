//! Sandgate - browser-facing sandbox gateway.
//!
//! Clients connect over a WebSocket and get a jailed view of one workspace
//! directory, on-demand package installs, snippet execution and interactive
//! shells. The pieces, leaves first:
//!
//! - [`jail`]: path resolution and file operations confined to the root.
//! - [`runner`]: child process supervision with deadlines and cancellation.
//! - [`mux`]: per-session routing of process streams.
//! - [`gateway`]: the operations exposed to clients.
//! - [`http_server`]: the Axum transport.

#[cfg(not(unix))]
compile_error!("sandgate only works on Unix-like systems.");

pub mod command;
pub mod config;
pub mod error;
pub mod gateway;
pub mod http_server;
pub mod ids;
pub mod jail;
pub mod mux;
pub mod preview;
pub mod protocol;
pub mod runner;
pub mod sandbox;
pub mod state;

pub use command::{CommandSpec, ProcessKind, TerminalSize};
pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use gateway::Gateway;
pub use ids::{ProcessId, SessionId, StreamId};
pub use jail::{EntryKind, FileEntry, WorkspaceJail};
pub use mux::{SessionFeed, SessionMultiplexer, StreamEvent};
pub use runner::{KillReason, ProcessHandle, ProcessRunner, ProcessStatus};
pub use state::AppState;

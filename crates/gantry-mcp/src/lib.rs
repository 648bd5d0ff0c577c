//! Multi-transport manager for user-configured MCP tool servers.
//!
//! Servers run as subprocesses or network endpoints and expose tools,
//! resources, and prompts over JSON-RPC 2.0. The manager owns the full
//! lifecycle: install, spawn, handshake, request multiplexing, crash
//! detection, and teardown, over stdio, WebSocket, legacy SSE, and
//! StreamableHTTP transports.

pub mod connection;
mod diagnostics;
pub mod http;
pub mod install;
pub mod manager;
pub mod process;
pub mod protocol;
pub mod sse;
pub mod stdio;
pub mod ws;

pub use connection::{Connection, ServerNotification};
pub use install::{InstallOutcome, ServerInstaller};
pub use manager::{ManagerConfig, McpServerManager, ServerConfig, StartOutcome};
pub use process::{
    ManagedServer, ProcessHandle, ProcessTracker, ServerSummary, SubprocessTracker,
};
pub use protocol::{McpCallResult, McpContent, McpToolInfo};

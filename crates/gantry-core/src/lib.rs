//! Core types and error definitions for the Gantry MCP server manager.
//!
//! This crate provides the foundational types shared across the Gantry
//! crates: the unified error enum, the result alias, and the vocabulary
//! enums describing a managed server's transport and lifecycle state.
//!
//! # Main types
//!
//! - [`GantryError`] — Unified error enum for all Gantry subsystems.
//! - [`GantryResult`] — Convenience alias for `Result<T, GantryError>`.
//! - [`ServerType`] — The wire transport a managed server speaks.
//! - [`ServerStatus`] — Lifecycle state of a managed server.

use serde::{Deserialize, Serialize};

// --- Error types ---

/// Top-level error type for the Gantry MCP manager.
///
/// Each variant corresponds to one failure class a caller may want to
/// distinguish: whether a request timed out, the server process crashed,
/// the connection went away, or the server itself reported an error.
#[derive(Debug, thiserror::Error)]
pub enum GantryError {
    /// Package installation failed or no installer is configured.
    #[error("Install error: {0}")]
    Install(String),

    /// The server process could not be spawned or registered.
    #[error("Spawn error: {0}")]
    Spawn(String),

    /// The initialize handshake failed.
    #[error("Handshake error: {0}")]
    Handshake(String),

    /// The server is unknown, not running, or its process is dead.
    #[error("Server unavailable: {0}")]
    Unavailable(String),

    /// No response arrived within the configured timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The server process exited while a request was in flight.
    #[error("Server crashed: {0}")]
    Crashed(String),

    /// The connection closed before the response arrived.
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// An HTTP-level failure, including retry exhaustion.
    #[error("HTTP error: {0}")]
    Http(String),

    /// The server returned a JSON-RPC error or an unparseable payload.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Invalid caller-supplied server configuration.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`GantryError`].
pub type GantryResult<T> = Result<T, GantryError>;

// --- Server vocabulary ---

/// The wire transport a managed server speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerType {
    /// Newline-delimited JSON-RPC over subprocess stdin/stdout.
    Stdio,
    /// StreamableHTTP: one POST endpoint, optional SSE response bodies.
    Http,
    /// Legacy SSE: persistent GET stream plus a discovered POST endpoint.
    Sse,
    /// Persistent WebSocket connection.
    Websocket,
}

impl ServerType {
    /// True for the transports that reach the server over the network.
    pub fn is_network(&self) -> bool {
        !matches!(self, ServerType::Stdio)
    }
}

impl std::fmt::Display for ServerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServerType::Stdio => "stdio",
            ServerType::Http => "http",
            ServerType::Sse => "sse",
            ServerType::Websocket => "websocket",
        };
        write!(f, "{s}")
    }
}

/// Lifecycle state of a managed server.
///
/// `Failed`, `Crashed`, and `Stopped` are terminal until a fresh start
/// recreates the server under the same name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServerStatus {
    /// Spawned but the handshake has not completed yet.
    Starting,
    /// Handshake completed (or remote endpoint registered); serving calls.
    Running,
    /// Unresponsive while the process was still alive, or a handshake error.
    Failed,
    /// Process exit detected.
    Crashed,
    /// Explicitly stopped.
    Stopped,
}

impl ServerStatus {
    /// Whether this state can still transition (only pre-terminal states can).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ServerStatus::Failed | ServerStatus::Crashed | ServerStatus::Stopped
        )
    }
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServerStatus::Starting => "STARTING",
            ServerStatus::Running => "RUNNING",
            ServerStatus::Failed => "FAILED",
            ServerStatus::Crashed => "CRASHED",
            ServerStatus::Stopped => "STOPPED",
        };
        write!(f, "{s}")
    }
}

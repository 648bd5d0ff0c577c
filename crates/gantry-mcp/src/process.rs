//! Server process tracking.
//!
//! The manager delegates spawning and supervision to a [`ProcessTracker`] so
//! hosts can substitute their own sandboxed launcher. [`SubprocessTracker`]
//! is the default implementation and runs servers as plain child processes
//! on the local machine.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gantry_core::{GantryError, GantryResult, ServerStatus, ServerType};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::{Child, ChildStderr, Command};
use tracing::{debug, info, warn};

/// Handles to a spawned child shared between the tracker and the transport
/// layer. The child keeps its stdin/stdout pipes; stderr is pulled out at
/// spawn time so diagnostics can read it without fighting over the child.
#[derive(Clone, Debug)]
pub struct ProcessHandle {
    /// The child process itself.
    pub child: Arc<tokio::sync::Mutex<Child>>,
    /// Captured stderr pipe, consumed by the first diagnostic read.
    pub stderr: Arc<tokio::sync::Mutex<Option<ChildStderr>>>,
}

/// Book-keeping record for one tracked server.
#[derive(Debug)]
pub struct ManagedServer {
    /// Configured server name.
    pub name: String,
    /// Transport the server speaks.
    pub server_type: ServerType,
    /// Command line that launched the server, if this tracker spawned it.
    pub command: Option<String>,
    /// Spawned process, absent for remote servers.
    pub process: Option<ProcessHandle>,
    /// Listen port for locally spawned network servers.
    pub port: Option<u16>,
    /// OS process id recorded at spawn.
    pub pid: Option<u32>,
    /// When the server was started.
    pub started_at: DateTime<Utc>,
    url: RwLock<Option<String>>,
    status: RwLock<ServerStatus>,
    error: RwLock<Option<String>>,
}

impl ManagedServer {
    fn new(
        name: &str,
        server_type: ServerType,
        command: Option<String>,
        process: Option<ProcessHandle>,
        port: Option<u16>,
        pid: Option<u32>,
    ) -> Self {
        Self {
            name: name.to_string(),
            server_type,
            command,
            process,
            port,
            pid,
            started_at: Utc::now(),
            url: RwLock::new(None),
            status: RwLock::new(ServerStatus::Starting),
            error: RwLock::new(None),
        }
    }

    /// Current lifecycle status.
    pub fn status(&self) -> ServerStatus {
        *self.status.read()
    }

    /// Last recorded failure description, if any.
    pub fn error(&self) -> Option<String> {
        self.error.read().clone()
    }

    /// Connection URL for network servers.
    pub fn url(&self) -> Option<String> {
        self.url.read().clone()
    }

    pub(crate) fn set_url(&self, url: String) {
        *self.url.write() = Some(url);
    }

    pub(crate) fn mark_running(&self) {
        *self.status.write() = ServerStatus::Running;
    }

    pub(crate) fn mark_failed(&self, message: impl Into<String>) {
        *self.status.write() = ServerStatus::Failed;
        *self.error.write() = Some(message.into());
    }

    pub(crate) fn mark_crashed(&self, message: impl Into<String>) {
        *self.status.write() = ServerStatus::Crashed;
        *self.error.write() = Some(message.into());
    }

    /// Transitions to STOPPED unless the server already reached a terminal
    /// status. A failed or crashed server keeps that status through stop so
    /// the listing still reports what went wrong.
    pub(crate) fn mark_stopped(&self) {
        let mut status = self.status.write();
        if !status.is_terminal() {
            *status = ServerStatus::Stopped;
        }
    }

    /// Snapshot for server listings.
    pub fn summary(&self) -> ServerSummary {
        ServerSummary {
            name: self.name.clone(),
            server_type: self.server_type,
            status: self.status(),
            command: self.command.clone(),
            url: self.url(),
            port: self.port,
            pid: self.pid,
            error: self.error(),
            started_at: self.started_at,
            uptime_secs: (Utc::now() - self.started_at).num_seconds(),
        }
    }
}

/// Serializable view of one managed server.
#[derive(Debug, Clone, Serialize)]
pub struct ServerSummary {
    /// Configured server name.
    pub name: String,
    /// Transport the server speaks.
    #[serde(rename = "type")]
    pub server_type: ServerType,
    /// Current lifecycle status.
    pub status: ServerStatus,
    /// Command line that launched the server, for locally spawned servers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Connection URL, present for network servers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Listen port, present for locally spawned network servers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// OS process id, present when this host spawned the process.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Failure description for FAILED or CRASHED servers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the server was started.
    pub started_at: DateTime<Utc>,
    /// Seconds since start.
    pub uptime_secs: i64,
}

/// Spawns and supervises server processes on behalf of the manager.
#[async_trait]
pub trait ProcessTracker: Send + Sync {
    /// Spawns a stdio server with stdin/stdout/stderr piped and registers it
    /// in STARTING state.
    async fn start_stdio_server(
        &self,
        name: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        working_dir: Option<&str>,
    ) -> GantryResult<Arc<ManagedServer>>;

    /// Spawns a network server that listens on `port`. Only stderr is piped;
    /// the transport connects over the network, not the pipes.
    #[allow(clippy::too_many_arguments)]
    async fn start_network_server(
        &self,
        name: &str,
        server_type: ServerType,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        working_dir: Option<&str>,
        port: u16,
    ) -> GantryResult<Arc<ManagedServer>>;

    /// Registers a remote network server this host does not launch. The
    /// entry has no process handle; its URL is the configured endpoint.
    async fn register_remote_server(
        &self,
        name: &str,
        server_type: ServerType,
        url: &str,
    ) -> GantryResult<Arc<ManagedServer>>;

    /// Looks up a tracked server by name.
    async fn get_server(&self, name: &str) -> Option<Arc<ManagedServer>>;

    /// All tracked servers, including stopped and failed ones.
    async fn servers(&self) -> Vec<Arc<ManagedServer>>;

    /// Kills the server's process if it is still running and marks the entry
    /// STOPPED (terminal statuses are preserved). Unknown names are a no-op.
    async fn stop_server(&self, name: &str) -> GantryResult<()>;

    /// Stops every tracked server.
    async fn stop_all(&self);

    /// Picks a free TCP port on the loopback interface.
    async fn allocate_port(&self) -> GantryResult<u16>;
}

/// Default tracker that runs servers as local child processes.
#[derive(Default)]
pub struct SubprocessTracker {
    servers: tokio::sync::RwLock<HashMap<String, Arc<ManagedServer>>>,
}

impl SubprocessTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    fn build_command(
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        working_dir: Option<&str>,
    ) -> Command {
        let mut cmd = Command::new(command);
        cmd.args(args);
        cmd.envs(env);
        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }
        cmd.kill_on_drop(true);
        cmd
    }

    async fn insert(&self, name: &str, server: Arc<ManagedServer>) {
        let mut servers = self.servers.write().await;
        if let Some(old) = servers.insert(name.to_string(), server) {
            if let Some(old_handle) = &old.process {
                let mut old_child = old_handle.child.lock().await;
                if matches!(old_child.try_wait(), Ok(None)) {
                    warn!(server = %name, "Replacing server with live process, killing old instance");
                    let _ = old_child.start_kill();
                }
            }
        }
    }

    async fn spawn_and_register(
        &self,
        name: &str,
        server_type: ServerType,
        mut cmd: Command,
        command: &str,
        port: Option<u16>,
    ) -> GantryResult<Arc<ManagedServer>> {
        let mut child = cmd.spawn().map_err(|e| {
            GantryError::Spawn(format!("failed to spawn '{command}' for '{name}': {e}"))
        })?;
        let pid = child.id();
        let stderr = child.stderr.take();
        let handle = ProcessHandle {
            child: Arc::new(tokio::sync::Mutex::new(child)),
            stderr: Arc::new(tokio::sync::Mutex::new(stderr)),
        };
        let server = Arc::new(ManagedServer::new(
            name,
            server_type,
            Some(command.to_string()),
            Some(handle),
            port,
            pid,
        ));
        self.insert(name, server.clone()).await;
        info!(server = %name, transport = %server_type, command = %command, pid = ?pid, "Spawned server process");
        Ok(server)
    }
}

#[async_trait]
impl ProcessTracker for SubprocessTracker {
    async fn start_stdio_server(
        &self,
        name: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        working_dir: Option<&str>,
    ) -> GantryResult<Arc<ManagedServer>> {
        let mut cmd = Self::build_command(command, args, env, working_dir);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        self.spawn_and_register(name, ServerType::Stdio, cmd, command, None)
            .await
    }

    async fn start_network_server(
        &self,
        name: &str,
        server_type: ServerType,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        working_dir: Option<&str>,
        port: u16,
    ) -> GantryResult<Arc<ManagedServer>> {
        let mut cmd = Self::build_command(command, args, env, working_dir);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        self.spawn_and_register(name, server_type, cmd, command, Some(port))
            .await
    }

    async fn register_remote_server(
        &self,
        name: &str,
        server_type: ServerType,
        url: &str,
    ) -> GantryResult<Arc<ManagedServer>> {
        let server = Arc::new(ManagedServer::new(name, server_type, None, None, None, None));
        server.set_url(url.to_string());
        self.insert(name, server.clone()).await;
        info!(server = %name, transport = %server_type, url = %url, "Registered remote server");
        Ok(server)
    }

    async fn get_server(&self, name: &str) -> Option<Arc<ManagedServer>> {
        self.servers.read().await.get(name).cloned()
    }

    async fn servers(&self) -> Vec<Arc<ManagedServer>> {
        self.servers.read().await.values().cloned().collect()
    }

    async fn stop_server(&self, name: &str) -> GantryResult<()> {
        let Some(server) = self.get_server(name).await else {
            debug!(server = %name, "Stop requested for untracked server");
            return Ok(());
        };

        if let Some(handle) = &server.process {
            let mut child = handle.child.lock().await;
            match child.try_wait() {
                Ok(Some(status)) => {
                    debug!(server = %name, exit = ?status.code(), "Process already exited");
                }
                _ => {
                    if let Err(e) = child.start_kill() {
                        warn!(server = %name, error = %e, "Failed to kill server process");
                    }
                }
            }
        }
        server.mark_stopped();
        info!(server = %name, status = %server.status(), "Stopped server");
        Ok(())
    }

    async fn stop_all(&self) {
        let names: Vec<String> = self.servers.read().await.keys().cloned().collect();
        for name in names {
            let _ = self.stop_server(&name).await;
        }
    }

    async fn allocate_port(&self) -> GantryResult<u16> {
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
        Ok(listener.local_addr()?.port())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_spawn_and_stop_stdio_server() {
        let tracker = SubprocessTracker::new();
        let server = tracker
            .start_stdio_server(
                "sleeper",
                "sh",
                &["-c".into(), "sleep 30".into()],
                &HashMap::new(),
                None,
            )
            .await
            .unwrap();

        assert_eq!(server.status(), ServerStatus::Starting);
        assert!(server.pid.is_some());
        let handle = server.process.as_ref().unwrap();
        assert!(matches!(handle.child.lock().await.try_wait(), Ok(None)));

        tracker.stop_server("sleeper").await.unwrap();
        assert_eq!(
            tracker.get_server("sleeper").await.unwrap().status(),
            ServerStatus::Stopped
        );
    }

    #[tokio::test]
    async fn test_stop_preserves_terminal_status() {
        let tracker = SubprocessTracker::new();
        tracker
            .start_stdio_server(
                "doomed",
                "sh",
                &["-c".into(), "exit 1".into()],
                &HashMap::new(),
                None,
            )
            .await
            .unwrap();

        let server = tracker.get_server("doomed").await.unwrap();
        server.mark_failed("handshake never completed");
        tracker.stop_server("doomed").await.unwrap();

        assert_eq!(server.status(), ServerStatus::Failed);
        assert_eq!(server.error().as_deref(), Some("handshake never completed"));
    }

    #[tokio::test]
    async fn test_stop_unknown_server_is_noop() {
        let tracker = SubprocessTracker::new();
        assert!(tracker.stop_server("ghost").await.is_ok());
    }

    #[tokio::test]
    async fn test_register_remote_server_has_no_process() {
        let tracker = SubprocessTracker::new();
        let server = tracker
            .register_remote_server("cloud", ServerType::Http, "https://mcp.example.com/mcp")
            .await
            .unwrap();
        assert!(server.process.is_none());
        assert!(server.pid.is_none());
        assert_eq!(server.url().as_deref(), Some("https://mcp.example.com/mcp"));
    }

    #[tokio::test]
    async fn test_allocate_port_returns_free_port() {
        let tracker = SubprocessTracker::new();
        let port = tracker.allocate_port().await.unwrap();
        assert!(port > 0);
    }

    #[tokio::test]
    async fn test_spawn_missing_binary_is_spawn_error() {
        let tracker = SubprocessTracker::new();
        let err = tracker
            .start_stdio_server("nope", "/no/such/binary", &[], &HashMap::new(), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn test_summary_serializes_with_renamed_type_field() {
        let server = ManagedServer::new("files", ServerType::Stdio, Some("npx".into()), None, None, Some(42));
        server.mark_running();
        let json = serde_json::to_value(server.summary()).unwrap();
        assert_eq!(json["type"], "stdio");
        assert_eq!(json["status"], "RUNNING");
        assert_eq!(json["command"], "npx");
        assert_eq!(json["pid"], 42);
        assert!(json.get("url").is_none());
    }
}

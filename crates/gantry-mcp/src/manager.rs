//! Server lifecycle control and the public tool/resource/prompt API.
//!
//! [`McpServerManager`] owns every connection, the per-server tool cache,
//! and resource subscriptions. Process supervision is delegated to a
//! [`ProcessTracker`] and optional package installation to a
//! [`ServerInstaller`]; everything protocol-shaped lives here or in the
//! transport modules.

use crate::connection::{Connection, ServerNotification};
use crate::diagnostics;
use crate::http::HttpConnection;
use crate::install::{InstallOutcome, ServerInstaller};
use crate::process::{ManagedServer, ProcessTracker, ServerSummary, SubprocessTracker};
use crate::protocol::{initialize_params, InitializeResult, McpCallResult, McpToolInfo};
use crate::sse::SseConnection;
use crate::stdio::StdioConnection;
use crate::ws::WebSocketConnection;
use gantry_core::{GantryError, GantryResult, ServerStatus, ServerType};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

/// Extra headroom granted on top of a caller-supplied tool timeout, so the
/// server gets a chance to answer before the transport gives up.
const CALL_TIMEOUT_SLACK: Duration = Duration::from_secs(30);
/// How often the readiness probe retries a freshly allocated port.
const PORT_POLL_INTERVAL: Duration = Duration::from_millis(300);

/// Flags Chrome needs inside the sandbox: it runs as root with no display
/// and refuses to start without them.
const CHROME_SANDBOX_FLAGS: [&str; 3] = ["--no-sandbox", "--disable-dev-shm-usage", "--headless"];

fn default_handshake_timeout() -> u64 {
    30
}

fn default_discovery_timeout() -> u64 {
    15
}

fn default_call_timeout() -> u64 {
    60
}

fn default_idle_timeout() -> u64 {
    300
}

fn default_port_wait() -> u64 {
    15
}

fn default_endpoint_timeout() -> u64 {
    10
}

/// Manager-wide timing knobs. Defaults match production values; tests
/// shrink them to keep failure paths fast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Budget for the initialize exchange on any transport.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    /// Budget for `tools/list`, deliberately shorter than a tool call.
    #[serde(default = "default_discovery_timeout")]
    pub discovery_timeout_secs: u64,
    /// Default budget for `tools/call` and the wrapper methods.
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
    /// Quiet stretch after which a stdio reader parks itself.
    #[serde(default = "default_idle_timeout")]
    pub stdio_idle_timeout_secs: u64,
    /// How long to wait for a spawned network server's port to open.
    #[serde(default = "default_port_wait")]
    pub port_wait_secs: u64,
    /// How long an SSE server may take to announce its POST endpoint.
    #[serde(default = "default_endpoint_timeout")]
    pub sse_endpoint_timeout_secs: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: default_handshake_timeout(),
            discovery_timeout_secs: default_discovery_timeout(),
            call_timeout_secs: default_call_timeout(),
            stdio_idle_timeout_secs: default_idle_timeout(),
            port_wait_secs: default_port_wait(),
            sse_endpoint_timeout_secs: default_endpoint_timeout(),
        }
    }
}

impl ManagerConfig {
    fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery_timeout_secs)
    }

    fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    fn stdio_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.stdio_idle_timeout_secs)
    }

    fn port_wait(&self) -> Duration {
        Duration::from_secs(self.port_wait_secs)
    }

    fn sse_endpoint_timeout(&self) -> Duration {
        Duration::from_secs(self.sse_endpoint_timeout_secs)
    }
}

/// Per-server launch configuration, supplied by the caller on install/start.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Executable to launch. Remote servers omit it and set `url` instead.
    #[serde(default)]
    pub command: Option<String>,
    /// Arguments passed to the command.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variables for the spawned process.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Endpoint URL. Synthesized from the allocated port when omitted.
    #[serde(default)]
    pub url: Option<String>,
    /// Working directory for the spawned process.
    #[serde(default)]
    pub working_dir: Option<String>,
}

/// What `start` reports back to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct StartOutcome {
    /// Whether the server came up (or, for remote servers, was registered).
    pub success: bool,
    /// Status the server ended up in.
    pub status: ServerStatus,
    /// OS process id for locally spawned servers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Listen port for locally spawned network servers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Connection URL for network servers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Failure description when `success` is false.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StartOutcome {
    fn started(server: &ManagedServer) -> Self {
        Self {
            success: true,
            status: server.status(),
            pid: server.pid,
            port: server.port,
            url: server.url(),
            error: None,
        }
    }

    fn failure(status: ServerStatus, error: String) -> Self {
        Self {
            success: false,
            status,
            pid: None,
            port: None,
            url: None,
            error: Some(error),
        }
    }
}

/// Multi-transport manager for user-configured MCP servers.
pub struct McpServerManager {
    tracker: Arc<dyn ProcessTracker>,
    installer: Option<Arc<dyn ServerInstaller>>,
    config: ManagerConfig,
    connections: RwLock<HashMap<String, Arc<Connection>>>,
    tool_cache: RwLock<HashMap<String, Vec<McpToolInfo>>>,
    subscriptions: RwLock<HashMap<String, HashMap<String, String>>>,
    http_client: parking_lot::Mutex<Option<reqwest::Client>>,
    notif_tx: mpsc::UnboundedSender<ServerNotification>,
    notif_rx: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<ServerNotification>>>,
}

impl Default for McpServerManager {
    fn default() -> Self {
        Self::new(ManagerConfig::default())
    }
}

impl McpServerManager {
    /// Creates a manager backed by the default [`SubprocessTracker`].
    pub fn new(config: ManagerConfig) -> Self {
        Self::with_tracker(Arc::new(SubprocessTracker::new()), config)
    }

    /// Creates a manager over a custom process tracker.
    pub fn with_tracker(tracker: Arc<dyn ProcessTracker>, config: ManagerConfig) -> Self {
        let (notif_tx, notif_rx) = mpsc::unbounded_channel();
        Self {
            tracker,
            installer: None,
            config,
            connections: RwLock::new(HashMap::new()),
            tool_cache: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(HashMap::new()),
            http_client: parking_lot::Mutex::new(None),
            notif_tx,
            notif_rx: tokio::sync::Mutex::new(Some(notif_rx)),
        }
    }

    /// Attaches a package installer.
    pub fn installer(mut self, installer: Arc<dyn ServerInstaller>) -> Self {
        self.installer = Some(installer);
        self
    }

    // --- Lifecycle ---

    /// Installs whatever the server's command needs. Remote servers and
    /// managers without an installer report success with nothing done.
    pub async fn install(
        &self,
        name: &str,
        server_type: ServerType,
        config: &ServerConfig,
    ) -> GantryResult<InstallOutcome> {
        let Some(command) = config.command.as_deref() else {
            debug!(server = %name, transport = %server_type, "No local command, nothing to install");
            return Ok(InstallOutcome::skipped());
        };
        match &self.installer {
            Some(installer) => {
                info!(server = %name, command = %command, "Installing server package");
                installer.install(command, &config.args, &config.env).await
            }
            None => {
                debug!(server = %name, "No installer configured, assuming preinstalled");
                Ok(InstallOutcome::skipped())
            }
        }
    }

    /// Starts a server, replacing any existing server under the same name.
    /// Spawn and handshake failures come back as a failed outcome, with the
    /// tracked server left in FAILED or CRASHED state.
    pub async fn start(
        &self,
        name: &str,
        server_type: ServerType,
        config: &ServerConfig,
    ) -> StartOutcome {
        info!(server = %name, transport = %server_type, "Starting server");
        if self.tracker.get_server(name).await.is_some() {
            debug!(server = %name, "Replacing existing server");
            let _ = self.stop(name).await;
        }

        let result = match server_type {
            ServerType::Stdio => self.start_stdio(name, config).await,
            _ => self.start_network(name, server_type, config).await,
        };
        match result {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(server = %name, error = %e, "Start failed");
                let status = match self.tracker.get_server(name).await {
                    Some(server) => {
                        if server.status() == ServerStatus::Starting {
                            server.mark_failed(e.to_string());
                        }
                        server.status()
                    }
                    None => ServerStatus::Failed,
                };
                StartOutcome::failure(status, e.to_string())
            }
        }
    }

    /// Stops a server: closes its connection, drops its caches and
    /// subscriptions, and kills its process. Idempotent.
    pub async fn stop(&self, name: &str) -> GantryResult<()> {
        let conn = self.connections.write().await.remove(name);
        if let Some(conn) = conn {
            conn.close().await;
        }
        self.tool_cache.write().await.remove(name);
        self.subscriptions.write().await.remove(name);
        self.tracker.stop_server(name).await?;
        info!(server = %name, "Server stopped");
        Ok(())
    }

    /// Summaries of every tracked server, stopped and failed ones included.
    pub async fn list_servers(&self) -> Vec<ServerSummary> {
        let mut summaries: Vec<ServerSummary> = self
            .tracker
            .servers()
            .await
            .iter()
            .map(|s| s.summary())
            .collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }

    /// Number of tracked servers.
    pub async fn server_count(&self) -> usize {
        self.tracker.servers().await.len()
    }

    /// Tears down every connection, releases the shared HTTP client, and
    /// stops all processes.
    pub async fn shutdown(&self) {
        info!("Shutting down MCP server manager");
        let conns: Vec<(String, Arc<Connection>)> =
            self.connections.write().await.drain().collect();
        for (name, conn) in conns {
            debug!(server = %name, "Closing connection");
            conn.close().await;
        }
        self.tool_cache.write().await.clear();
        self.subscriptions.write().await.clear();
        *self.http_client.lock() = None;
        self.tracker.stop_all().await;
        info!("MCP server manager shut down");
    }

    // --- Tool API ---

    /// Lists the server's tools and replaces the cached list. A server that
    /// cannot answer this within the discovery budget is broken enough to
    /// take down: it is marked FAILED or CRASHED and stopped before the
    /// error is raised.
    pub async fn discover_tools(&self, name: &str) -> GantryResult<Vec<McpToolInfo>> {
        let server = self.require_live(name).await?;
        let conn = self.connection(name).await?;

        match conn
            .send("tools/list", None, self.config.discovery_timeout())
            .await
        {
            Ok(result) => {
                let tools: Vec<McpToolInfo> = match result.get("tools") {
                    Some(list) => serde_json::from_value(list.clone())?,
                    None => Vec::new(),
                };
                self.tool_cache
                    .write()
                    .await
                    .insert(name.to_string(), tools.clone());
                info!(server = %name, count = tools.len(), "Discovered tools");
                Ok(tools)
            }
            // A protocol error means the server answered; it stays up.
            Err(e @ GantryError::Protocol(_)) => Err(e),
            Err(e) => {
                let err = self.classify_discovery_failure(name, &server, e).await;
                let _ = self.stop(name).await;
                Err(err)
            }
        }
    }

    /// Most recently discovered tools for a server, if any.
    pub async fn cached_tools(&self, name: &str) -> Option<Vec<McpToolInfo>> {
        self.tool_cache.read().await.get(name).cloned()
    }

    /// Invokes a tool. Timeouts are reported inside the result rather than
    /// raised: a crashed process yields a crash description, a live one an
    /// "unresponsive" description, and in the latter case the server is
    /// left running since the call may legitimately still be in progress.
    pub async fn call_tool(
        &self,
        name: &str,
        tool: &str,
        args: serde_json::Value,
    ) -> GantryResult<McpCallResult> {
        let server = self.require_live(name).await?;
        let conn = self.connection(name).await?;
        let timeout = call_timeout_for(&args, self.config.call_timeout());
        let params = json!({"name": tool, "arguments": args});

        match conn.send("tools/call", Some(params), timeout).await {
            Ok(result) => Ok(serde_json::from_value(result)?),
            Err(GantryError::Timeout(_)) => {
                if let Some(handle) = &server.process {
                    if !diagnostics::is_alive(&handle.child).await {
                        let code = diagnostics::exit_code(&handle.child).await;
                        let stderr = diagnostics::capture_stderr(&handle.stderr).await;
                        let summary = diagnostics::crash_summary(code, stderr.as_deref());
                        let msg = format!("'{name}' crashed during '{tool}': {summary}");
                        server.mark_crashed(msg.clone());
                        self.drop_connection(name).await;
                        return Ok(McpCallResult::error(msg));
                    }
                }
                Ok(McpCallResult::error(format!(
                    "'{tool}' on '{name}' did not finish within {}s; the server is still running and may complete it later",
                    timeout.as_secs()
                )))
            }
            Err(e @ GantryError::Crashed(_)) => {
                server.mark_crashed(e.to_string());
                self.drop_connection(name).await;
                Ok(McpCallResult::error(e.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    // --- Resource and prompt wrappers ---
    //
    // These degrade to neutral values on failure. Callers probing for
    // resources or prompts should not have to handle transport errors.

    /// Reads a resource by URI. `None` on any failure.
    pub async fn read_resource(&self, name: &str, uri: &str) -> Option<serde_json::Value> {
        match self
            .request_value(name, "resources/read", Some(json!({"uri": uri})))
            .await
        {
            Ok(result) => Some(result),
            Err(e) => {
                warn!(server = %name, uri = %uri, error = %e, "resources/read failed");
                None
            }
        }
    }

    /// Lists the server's resources. Empty on any failure.
    pub async fn list_resources(&self, name: &str) -> Vec<serde_json::Value> {
        match self.request_value(name, "resources/list", None).await {
            Ok(result) => result
                .get("resources")
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default(),
            Err(e) => {
                warn!(server = %name, error = %e, "resources/list failed");
                Vec::new()
            }
        }
    }

    /// Lists the server's resource templates. Empty on any failure.
    pub async fn list_resource_templates(&self, name: &str) -> Vec<serde_json::Value> {
        match self
            .request_value(name, "resources/templates/list", None)
            .await
        {
            Ok(result) => result
                .get("resourceTemplates")
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default(),
            Err(e) => {
                warn!(server = %name, error = %e, "resources/templates/list failed");
                Vec::new()
            }
        }
    }

    /// Lists the server's prompts. Empty on any failure.
    pub async fn list_prompts(&self, name: &str) -> Vec<serde_json::Value> {
        match self.request_value(name, "prompts/list", None).await {
            Ok(result) => result
                .get("prompts")
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default(),
            Err(e) => {
                warn!(server = %name, error = %e, "prompts/list failed");
                Vec::new()
            }
        }
    }

    /// Fetches a prompt by name. `None` on any failure.
    pub async fn get_prompt(
        &self,
        name: &str,
        prompt: &str,
        args: Option<serde_json::Value>,
    ) -> Option<serde_json::Value> {
        let mut params = json!({"name": prompt});
        if let Some(args) = args {
            params["arguments"] = args;
        }
        match self.request_value(name, "prompts/get", Some(params)).await {
            Ok(result) => Some(result),
            Err(e) => {
                warn!(server = %name, prompt = %prompt, error = %e, "prompts/get failed");
                None
            }
        }
    }

    /// Whether the server answers a protocol ping.
    pub async fn ping(&self, name: &str) -> bool {
        self.request_value(name, "ping", None).await.is_ok()
    }

    /// Asks the server to adjust its log level. `false` on any failure.
    pub async fn set_log_level(&self, name: &str, level: &str) -> bool {
        match self
            .request_value(name, "logging/setLevel", Some(json!({"level": level})))
            .await
        {
            Ok(_) => true,
            Err(e) => {
                warn!(server = %name, level = %level, error = %e, "logging/setLevel failed");
                false
            }
        }
    }

    // --- Subscriptions ---

    /// Subscribes to change notifications for a resource. Returns a local
    /// subscription id, or `None` if the server refused.
    pub async fn subscribe_resource(&self, name: &str, uri: &str) -> Option<String> {
        match self
            .request_value(name, "resources/subscribe", Some(json!({"uri": uri})))
            .await
        {
            Ok(_) => {
                let id = uuid::Uuid::new_v4().to_string();
                self.subscriptions
                    .write()
                    .await
                    .entry(name.to_string())
                    .or_default()
                    .insert(id.clone(), uri.to_string());
                info!(server = %name, uri = %uri, subscription = %id, "Subscribed to resource");
                Some(id)
            }
            Err(e) => {
                warn!(server = %name, uri = %uri, error = %e, "resources/subscribe failed");
                None
            }
        }
    }

    /// Cancels a subscription by id. The local entry is removed even when
    /// the server cannot be told; a dead server keeps no subscriptions.
    pub async fn unsubscribe_resource(&self, name: &str, subscription_id: &str) -> bool {
        let uri = self
            .subscriptions
            .write()
            .await
            .get_mut(name)
            .and_then(|subs| subs.remove(subscription_id));
        let Some(uri) = uri else {
            debug!(server = %name, subscription = %subscription_id, "Unknown subscription");
            return false;
        };

        match self
            .request_value(name, "resources/unsubscribe", Some(json!({"uri": uri})))
            .await
        {
            Ok(_) => true,
            Err(e) => {
                warn!(server = %name, uri = %uri, error = %e, "resources/unsubscribe failed");
                false
            }
        }
    }

    /// Active subscriptions for a server, keyed by subscription id.
    pub async fn get_active_subscriptions(&self, name: &str) -> HashMap<String, String> {
        self.subscriptions
            .read()
            .await
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    // --- Notification routing ---

    /// Spawns the background task that consumes server-initiated
    /// notifications from every connection. Call once after construction.
    pub fn start_notification_loop(self: Arc<Self>) {
        tokio::spawn(async move {
            let rx = self.notif_rx.lock().await.take();
            let Some(mut rx) = rx else {
                warn!("Notification loop already running");
                return;
            };
            info!("Notification loop started");
            while let Some(note) = rx.recv().await {
                self.handle_notification(note).await;
            }
            debug!("Notification loop ended");
        });
    }

    async fn handle_notification(&self, note: ServerNotification) {
        match note.method.as_str() {
            "notifications/tools/list_changed" => {
                self.tool_cache.write().await.remove(&note.server);
                info!(server = %note.server, "Tool list changed, cache invalidated");
            }
            "notifications/resources/updated" => {
                let uri = note
                    .params
                    .as_ref()
                    .and_then(|p| p.get("uri"))
                    .and_then(|u| u.as_str())
                    .unwrap_or("");
                info!(server = %note.server, uri = %uri, "Resource updated");
            }
            method if method.starts_with("notifications/") => {
                debug!(server = %note.server, method = %method, "Server notification");
            }
            method => {
                debug!(server = %note.server, method = %method, "Ignoring server-initiated request");
            }
        }
    }

    // --- Start paths ---

    async fn start_stdio(&self, name: &str, config: &ServerConfig) -> GantryResult<StartOutcome> {
        let command = config.command.as_deref().ok_or_else(|| {
            GantryError::Config(format!("stdio server '{name}' requires a command"))
        })?;
        let args = inject_chrome_flags(command, &config.args);
        let server = self
            .tracker
            .start_stdio_server(name, command, &args, &config.env, config.working_dir.as_deref())
            .await?;
        let handle = server.process.clone().ok_or_else(|| {
            GantryError::Spawn(format!("tracker returned no process for '{name}'"))
        })?;

        let conn = StdioConnection::new(
            name,
            &handle,
            self.config.stdio_idle_timeout(),
            self.notif_tx.clone(),
        )
        .await?;
        let conn = Arc::new(Connection::Stdio(conn));

        if let Err(e) = self.handshake(name, &conn).await {
            conn.close().await;
            let err = if matches!(e, GantryError::Crashed(_)) {
                server.mark_crashed(e.to_string());
                e
            } else {
                let stderr = diagnostics::capture_stderr(&handle.stderr).await;
                let msg = match stderr {
                    Some(s) => format!("'{name}': {e}; stderr: {s}"),
                    None => format!("'{name}': {e}"),
                };
                server.mark_failed(msg.clone());
                GantryError::Handshake(msg)
            };
            let _ = self.tracker.stop_server(name).await;
            return Err(err);
        }

        self.connections
            .write()
            .await
            .insert(name.to_string(), conn);
        server.mark_running();
        info!(server = %name, pid = ?server.pid, "Stdio server started");
        Ok(StartOutcome::started(&server))
    }

    async fn start_network(
        &self,
        name: &str,
        server_type: ServerType,
        config: &ServerConfig,
    ) -> GantryResult<StartOutcome> {
        match config.command.as_deref() {
            Some(command) => {
                self.start_local_network(name, server_type, command, config)
                    .await
            }
            None => self.start_remote_network(name, server_type, config).await,
        }
    }

    async fn start_local_network(
        &self,
        name: &str,
        server_type: ServerType,
        command: &str,
        config: &ServerConfig,
    ) -> GantryResult<StartOutcome> {
        let port = self.tracker.allocate_port().await?;
        let args = inject_chrome_flags(command, &config.args);
        let server = self
            .tracker
            .start_network_server(
                name,
                server_type,
                command,
                &args,
                &config.env,
                config.working_dir.as_deref(),
                port,
            )
            .await?;
        let url = match &config.url {
            Some(url) => url.clone(),
            None => default_url(server_type, port),
        };
        server.set_url(url.clone());

        self.wait_for_port(name, port).await;

        let connected = match self.open_connection(name, server_type, &url).await {
            Ok(conn) => match self.handshake(name, &conn).await {
                Ok(()) => Ok(conn),
                Err(e) => {
                    conn.close().await;
                    Err(e)
                }
            },
            Err(e) => Err(e),
        };
        match connected {
            Ok(conn) => {
                self.connections
                    .write()
                    .await
                    .insert(name.to_string(), conn);
                server.mark_running();
                info!(server = %name, url = %url, "Network server started");
                Ok(StartOutcome::started(&server))
            }
            Err(e) => {
                let err = self.classify_network_failure(name, &server, e).await;
                let _ = self.tracker.stop_server(name).await;
                Err(err)
            }
        }
    }

    /// Remote servers are tracked as RUNNING immediately; an unreachable
    /// endpoint is not fatal since it may come up later. The connection is
    /// retried on the first call that needs it.
    async fn start_remote_network(
        &self,
        name: &str,
        server_type: ServerType,
        config: &ServerConfig,
    ) -> GantryResult<StartOutcome> {
        let url = config.url.clone().ok_or_else(|| {
            GantryError::Config(format!("network server '{name}' needs a command or a url"))
        })?;
        let server = self
            .tracker
            .register_remote_server(name, server_type, &url)
            .await?;
        server.mark_running();

        match self.open_connection(name, server_type, &url).await {
            Ok(conn) => match self.handshake(name, &conn).await {
                Ok(()) => {
                    self.connections
                        .write()
                        .await
                        .insert(name.to_string(), conn);
                    info!(server = %name, url = %url, "Remote server connected");
                }
                Err(e) => {
                    conn.close().await;
                    warn!(server = %name, error = %e, "Remote handshake failed, will retry on demand");
                }
            },
            Err(e) => {
                warn!(server = %name, error = %e, "Remote server unreachable, will retry on demand");
            }
        }
        Ok(StartOutcome::started(&server))
    }

    // --- Internals ---

    /// Runs the initialize exchange and the initialized notification on a
    /// fresh connection.
    async fn handshake(&self, name: &str, conn: &Connection) -> GantryResult<()> {
        let result = conn
            .send(
                "initialize",
                Some(initialize_params()),
                self.config.handshake_timeout(),
            )
            .await?;
        match serde_json::from_value::<InitializeResult>(result) {
            Ok(init) => {
                let remote = init.server_info.map(|i| i.name).unwrap_or_default();
                info!(server = %name, protocol = %init.protocol_version, remote = %remote, "Handshake complete");
            }
            Err(e) => {
                debug!(server = %name, error = %e, "Unparseable initialize result, proceeding");
            }
        }
        conn.notify("notifications/initialized", None).await?;
        conn.mark_initialized();
        Ok(())
    }

    /// Returns the live connection for a server, reconnecting network
    /// transports on demand.
    async fn connection(&self, name: &str) -> GantryResult<Arc<Connection>> {
        if let Some(conn) = self.connections.read().await.get(name).cloned() {
            return Ok(conn);
        }

        let Some(server) = self.tracker.get_server(name).await else {
            return Err(GantryError::Unavailable(format!(
                "'{name}' is not a managed server"
            )));
        };
        if server.status() != ServerStatus::Running {
            return Err(GantryError::Unavailable(format!(
                "'{name}' is {} and cannot serve requests",
                server.status()
            )));
        }
        if !server.server_type.is_network() {
            return Err(GantryError::ConnectionClosed(format!(
                "stdio connection to '{name}' is gone; restart the server"
            )));
        }
        let url = server.url().ok_or_else(|| {
            GantryError::Config(format!("network server '{name}' has no URL"))
        })?;

        let conn = self.open_connection(name, server.server_type, &url).await?;
        self.handshake(name, &conn).await?;

        let mut conns = self.connections.write().await;
        if let Some(existing) = conns.get(name).cloned() {
            drop(conns);
            conn.close().await;
            return Ok(existing);
        }
        conns.insert(name.to_string(), conn.clone());
        info!(server = %name, "Reconnected on demand");
        Ok(conn)
    }

    async fn open_connection(
        &self,
        name: &str,
        server_type: ServerType,
        url: &str,
    ) -> GantryResult<Arc<Connection>> {
        let conn = match server_type {
            ServerType::Websocket => Connection::Websocket(
                WebSocketConnection::connect(name, url, self.notif_tx.clone()).await?,
            ),
            ServerType::Sse => Connection::Sse(
                SseConnection::connect(
                    name,
                    url,
                    self.http_client()?,
                    self.config.sse_endpoint_timeout(),
                    self.notif_tx.clone(),
                )
                .await?,
            ),
            ServerType::Http => {
                Connection::Http(HttpConnection::new(name, url, self.http_client()?))
            }
            ServerType::Stdio => {
                return Err(GantryError::Config(format!(
                    "stdio server '{name}' cannot be reached over a URL"
                )));
            }
        };
        Ok(Arc::new(conn))
    }

    /// Shared HTTP client, created on first use so managers that never talk
    /// to a network server never build one.
    fn http_client(&self) -> GantryResult<reqwest::Client> {
        let mut guard = self.http_client.lock();
        if let Some(client) = &*guard {
            return Ok(client.clone());
        }
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| GantryError::Config(format!("cannot build HTTP client: {e}")))?;
        *guard = Some(client.clone());
        Ok(client)
    }

    /// Checks status and, for local processes, actual liveness. A process
    /// found dead here is marked CRASHED on the spot; the cached RUNNING
    /// status may be stale since death is asynchronous.
    async fn require_live(&self, name: &str) -> GantryResult<Arc<ManagedServer>> {
        let Some(server) = self.tracker.get_server(name).await else {
            return Err(GantryError::Unavailable(format!(
                "'{name}' is not a managed server"
            )));
        };
        if server.status() != ServerStatus::Running {
            return Err(GantryError::Unavailable(format!(
                "'{name}' is {} and cannot serve requests",
                server.status()
            )));
        }
        if let Some(handle) = &server.process {
            if !diagnostics::is_alive(&handle.child).await {
                let code = diagnostics::exit_code(&handle.child).await;
                let stderr = diagnostics::capture_stderr(&handle.stderr).await;
                let summary = diagnostics::crash_summary(code, stderr.as_deref());
                let msg = format!("'{name}' {summary}");
                server.mark_crashed(msg.clone());
                self.drop_connection(name).await;
                return Err(GantryError::Crashed(msg));
            }
        }
        Ok(server)
    }

    /// RUNNING-gated request used by the wrapper methods.
    async fn request_value(
        &self,
        name: &str,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> GantryResult<serde_json::Value> {
        self.require_live(name).await?;
        let conn = self.connection(name).await?;
        conn.send(method, params, self.config.call_timeout()).await
    }

    async fn drop_connection(&self, name: &str) {
        if let Some(conn) = self.connections.write().await.remove(name) {
            conn.close().await;
        }
    }

    async fn classify_discovery_failure(
        &self,
        name: &str,
        server: &ManagedServer,
        e: GantryError,
    ) -> GantryError {
        if matches!(e, GantryError::Crashed(_)) {
            server.mark_crashed(e.to_string());
            return e;
        }
        match &server.process {
            Some(handle) if !diagnostics::is_alive(&handle.child).await => {
                let code = diagnostics::exit_code(&handle.child).await;
                let stderr = diagnostics::capture_stderr(&handle.stderr).await;
                let summary = diagnostics::crash_summary(code, stderr.as_deref());
                let msg = format!("'{name}' {summary}");
                server.mark_crashed(msg.clone());
                GantryError::Crashed(msg)
            }
            Some(handle) => {
                let stderr = diagnostics::capture_stderr(&handle.stderr).await;
                let msg = match stderr {
                    Some(s) => format!("'{name}' did not answer tools/list: {e}; stderr: {s}"),
                    None => format!("'{name}' did not answer tools/list: {e}"),
                };
                server.mark_failed(msg.clone());
                GantryError::Unavailable(msg)
            }
            None => {
                server.mark_failed(e.to_string());
                e
            }
        }
    }

    async fn classify_network_failure(
        &self,
        name: &str,
        server: &ManagedServer,
        e: GantryError,
    ) -> GantryError {
        let Some(handle) = &server.process else {
            server.mark_failed(e.to_string());
            return e;
        };
        if diagnostics::is_alive(&handle.child).await {
            let stderr = diagnostics::capture_stderr(&handle.stderr).await;
            let msg = match stderr {
                Some(s) => format!("'{name}': {e}; stderr: {s}"),
                None => format!("'{name}': {e}"),
            };
            server.mark_failed(msg.clone());
            GantryError::Handshake(msg)
        } else {
            let code = diagnostics::exit_code(&handle.child).await;
            let stderr = diagnostics::capture_stderr(&handle.stderr).await;
            let summary = diagnostics::crash_summary(code, stderr.as_deref());
            let msg = format!("'{name}' {summary}");
            server.mark_crashed(msg.clone());
            GantryError::Crashed(msg)
        }
    }

    /// Best-effort readiness probe for a freshly spawned network server.
    /// Times out with a warning instead of failing; the handshake is the
    /// real test.
    async fn wait_for_port(&self, name: &str, port: u16) {
        let deadline = tokio::time::Instant::now() + self.config.port_wait();
        while tokio::time::Instant::now() < deadline {
            if tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
                debug!(server = %name, port, "Port is accepting connections");
                return;
            }
            tokio::time::sleep(PORT_POLL_INTERVAL).await;
        }
        warn!(server = %name, port, "Port never became ready, attempting handshake anyway");
    }
}

/// Default endpoint for a locally spawned network server.
fn default_url(server_type: ServerType, port: u16) -> String {
    match server_type {
        ServerType::Websocket => format!("ws://localhost:{port}/ws"),
        ServerType::Sse => format!("http://localhost:{port}/sse"),
        _ => format!("http://localhost:{port}/mcp"),
    }
}

/// Adds the sandbox flags Chrome requires when the command launches
/// `chrome-devtools-mcp`, skipping flags the caller already set.
fn inject_chrome_flags(command: &str, args: &[String]) -> Vec<String> {
    let mut args = args.to_vec();
    let targets_chrome = command.contains("chrome-devtools-mcp")
        || args.iter().any(|a| a.contains("chrome-devtools-mcp"));
    if !targets_chrome {
        return args;
    }
    for flag in CHROME_SANDBOX_FLAGS {
        let present = args
            .iter()
            .any(|a| a == flag || a.starts_with(&format!("{flag}=")));
        if !present {
            args.push(flag.to_string());
        }
    }
    args
}

/// Call timeout for one tool invocation: the caller's own `timeout`
/// argument plus slack when present, the configured default otherwise.
fn call_timeout_for(args: &serde_json::Value, default: Duration) -> Duration {
    match args.get("timeout").and_then(|v| v.as_f64()) {
        Some(secs) if secs > 0.0 => Duration::from_secs_f64(secs) + CALL_TIMEOUT_SLACK,
        _ => default,
    }
}

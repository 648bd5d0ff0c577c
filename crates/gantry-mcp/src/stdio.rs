//! Stdio transport: newline-delimited JSON-RPC over subprocess pipes.
//!
//! One background reader task per connection parses stdout lines and
//! resolves pending callers by request id. The reader parks itself after a
//! long quiet stretch and is revived by the next send. Parking, reviving,
//! and pending-request registration all happen under one lock, so a revive
//! can never race a park and strand a freshly sent request.

use crate::connection::{into_result, ServerNotification};
use crate::diagnostics;
use crate::process::ProcessHandle;
use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use gantry_core::{GantryError, GantryResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

/// How often a waiting caller re-checks that the process is still alive.
const DEATH_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Stdout handle held while no reader task is running, along with any
/// partial line left over from the previous reader.
struct ParkedStdout {
    stream: ChildStdout,
    residue: Vec<u8>,
}

/// Reader-side state. Guarded by a single lock so that "is a reader
/// running" and "is anything pending" are always observed together.
struct ReaderState {
    pending: HashMap<u64, oneshot::Sender<JsonRpcResponse>>,
    parked: Option<ParkedStdout>,
    reader_running: bool,
    /// Set on EOF, read failure, or explicit close. Permanent.
    closed: bool,
}

/// Connection to a subprocess MCP server over its stdin/stdout pipes.
pub struct StdioConnection {
    server: String,
    next_id: AtomicU64,
    state: Arc<Mutex<ReaderState>>,
    stdin: Arc<Mutex<ChildStdin>>,
    child: Arc<Mutex<Child>>,
    stderr: Arc<Mutex<Option<ChildStderr>>>,
    initialized: AtomicBool,
    idle_timeout: Duration,
    notif_tx: mpsc::UnboundedSender<ServerNotification>,
}

impl StdioConnection {
    /// Takes over the child's stdin/stdout pipes and starts the reader task.
    /// The reader runs before anything is sent, so the handshake response
    /// cannot slip past an unstarted reader.
    pub(crate) async fn new(
        server: &str,
        handle: &ProcessHandle,
        idle_timeout: Duration,
        notif_tx: mpsc::UnboundedSender<ServerNotification>,
    ) -> GantryResult<Self> {
        let (stdin, stdout) = {
            let mut child = handle.child.lock().await;
            (child.stdin.take(), child.stdout.take())
        };
        let stdin = stdin
            .ok_or_else(|| GantryError::Spawn(format!("'{server}' has no stdin pipe")))?;
        let stdout = stdout
            .ok_or_else(|| GantryError::Spawn(format!("'{server}' has no stdout pipe")))?;

        let conn = Self {
            server: server.to_string(),
            next_id: AtomicU64::new(0),
            state: Arc::new(Mutex::new(ReaderState {
                pending: HashMap::new(),
                parked: Some(ParkedStdout {
                    stream: stdout,
                    residue: Vec::new(),
                }),
                reader_running: false,
                closed: false,
            })),
            stdin: Arc::new(Mutex::new(stdin)),
            child: handle.child.clone(),
            stderr: handle.stderr.clone(),
            initialized: AtomicBool::new(false),
            idle_timeout,
            notif_tx,
        };

        let mut state = conn.state.lock().await;
        conn.revive_locked(&mut state);
        drop(state);
        Ok(conn)
    }

    pub(crate) fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_initialized(&self) {
        self.initialized.store(true, Ordering::SeqCst);
    }

    /// Sends a request and waits for its response, polling process liveness
    /// every half second so a crash unblocks the caller long before the
    /// full timeout.
    pub(crate) async fn send(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> GantryResult<serde_json::Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let request = JsonRpcRequest::new(id, method, params);
        let mut payload = serde_json::to_vec(&request)?;
        payload.push(b'\n');

        let (tx, mut rx) = oneshot::channel();
        {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(GantryError::ConnectionClosed(format!(
                    "stdio connection to '{}' is closed",
                    self.server
                )));
            }
            state.pending.insert(id, tx);
            self.revive_locked(&mut state);
        }

        let write_result = {
            let mut stdin = self.stdin.lock().await;
            match stdin.write_all(&payload).await {
                Ok(()) => stdin.flush().await,
                Err(e) => Err(e),
            }
        };
        if let Err(e) = write_result {
            self.state.lock().await.pending.remove(&id);
            if !diagnostics::is_alive(&self.child).await {
                return Err(self.crash_error(method).await);
            }
            return Err(GantryError::Io(e));
        }
        debug!(server = %self.server, id, method = %method, "Sent stdio request");

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let now = tokio::time::Instant::now();
            if now >= deadline {
                self.state.lock().await.pending.remove(&id);
                return Err(GantryError::Timeout(format!(
                    "request '{method}' to '{}' timed out after {}s",
                    self.server,
                    timeout.as_secs()
                )));
            }
            let slice = DEATH_POLL_INTERVAL.min(deadline - now);
            match tokio::time::timeout(slice, &mut rx).await {
                Ok(Ok(resp)) => return into_result(&self.server, resp),
                Ok(Err(_)) => return Err(self.classify_closed(method).await),
                Err(_) => {
                    if !diagnostics::is_alive(&self.child).await {
                        self.state.lock().await.pending.remove(&id);
                        return Err(self.crash_error(method).await);
                    }
                }
            }
        }
    }

    /// Sends a one-way notification.
    pub(crate) async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> GantryResult<()> {
        let notification = JsonRpcNotification::new(method, params);
        let mut payload = serde_json::to_vec(&notification)?;
        payload.push(b'\n');

        let mut stdin = self.stdin.lock().await;
        stdin.write_all(&payload).await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Marks the connection closed, unblocks every pending caller, and
    /// closes the child's stdin so it sees EOF. Safe to call repeatedly.
    pub(crate) async fn close(&self) {
        let drained = {
            let mut state = self.state.lock().await;
            state.closed = true;
            state.parked = None;
            std::mem::take(&mut state.pending)
        };
        if !drained.is_empty() {
            debug!(
                server = %self.server,
                in_flight = drained.len(),
                "Dropped in-flight requests on close"
            );
        }
        let mut stdin = self.stdin.lock().await;
        let _ = stdin.shutdown().await;
    }

    /// Starts a reader task for the parked stdout, if any. Caller holds the
    /// state lock, which is what makes revive-then-register atomic.
    fn revive_locked(&self, state: &mut ReaderState) {
        if state.closed || state.reader_running {
            return;
        }
        let Some(parked) = state.parked.take() else {
            return;
        };
        state.reader_running = true;
        let server = self.server.clone();
        let shared = self.state.clone();
        let notif_tx = self.notif_tx.clone();
        let idle = self.idle_timeout;
        tokio::spawn(read_loop(
            server,
            shared,
            parked.stream,
            parked.residue,
            notif_tx,
            idle,
        ));
        debug!(server = %self.server, "Reader task started");
    }

    async fn crash_error(&self, method: &str) -> GantryError {
        let code = diagnostics::exit_code(&self.child).await;
        let stderr = diagnostics::capture_stderr(&self.stderr).await;
        let summary = diagnostics::crash_summary(code, stderr.as_deref());
        GantryError::Crashed(format!(
            "'{}' died during '{method}': {summary}",
            self.server
        ))
    }

    async fn classify_closed(&self, method: &str) -> GantryError {
        if diagnostics::is_alive(&self.child).await {
            GantryError::ConnectionClosed(format!(
                "connection to '{}' closed before '{method}' completed",
                self.server
            ))
        } else {
            self.crash_error(method).await
        }
    }
}

/// Reads stdout until EOF, error, or an idle stretch with nothing pending.
/// Complete lines are dispatched; a partial line survives parking via the
/// residue buffer.
async fn read_loop(
    server: String,
    state: Arc<Mutex<ReaderState>>,
    mut stream: ChildStdout,
    mut buf: Vec<u8>,
    notif_tx: mpsc::UnboundedSender<ServerNotification>,
    idle_timeout: Duration,
) {
    let mut chunk = [0u8; 4096];
    loop {
        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buf.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line);
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                dispatch_line(&server, trimmed, &state, &notif_tx).await;
            }
        }

        match tokio::time::timeout(idle_timeout, stream.read(&mut chunk)).await {
            Err(_) => {
                let mut guard = state.lock().await;
                if guard.closed {
                    guard.reader_running = false;
                    return;
                }
                if guard.pending.is_empty() {
                    guard.parked = Some(ParkedStdout {
                        stream,
                        residue: buf,
                    });
                    guard.reader_running = false;
                    debug!(server = %server, idle_secs = idle_timeout.as_secs(), "Reader idle, parking stdout");
                    return;
                }
                // Requests still in flight, keep reading.
            }
            Ok(Ok(0)) => {
                let drained = {
                    let mut guard = state.lock().await;
                    guard.closed = true;
                    guard.reader_running = false;
                    std::mem::take(&mut guard.pending)
                };
                if !drained.is_empty() {
                    debug!(
                        server = %server,
                        in_flight = drained.len(),
                        "Stdout closed with requests in flight"
                    );
                }
                info!(server = %server, "Server closed stdout");
                return;
            }
            Ok(Ok(n)) => {
                buf.extend_from_slice(&chunk[..n]);
            }
            Ok(Err(e)) => {
                let mut guard = state.lock().await;
                guard.closed = true;
                guard.reader_running = false;
                guard.pending.clear();
                drop(guard);
                warn!(server = %server, error = %e, "Stdout read failed, closing connection");
                return;
            }
        }
    }
}

/// Parses one stdout line: responses resolve their pending caller, frames
/// carrying a `method` are forwarded as notifications, junk is skipped.
async fn dispatch_line(
    server: &str,
    raw: &str,
    state: &Arc<Mutex<ReaderState>>,
    notif_tx: &mpsc::UnboundedSender<ServerNotification>,
) {
    let value: serde_json::Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            debug!(server = %server, error = %e, "Skipping non-JSON stdout line");
            return;
        }
    };

    if let Some(method) = value.get("method").and_then(|m| m.as_str()) {
        let _ = notif_tx.send(ServerNotification {
            server: server.to_string(),
            method: method.to_string(),
            params: value.get("params").cloned(),
        });
        return;
    }

    match serde_json::from_value::<JsonRpcResponse>(value) {
        Ok(resp) => {
            let Some(id) = resp.id else {
                debug!(server = %server, "Dropping response without id");
                return;
            };
            let tx = state.lock().await.pending.remove(&id);
            match tx {
                Some(tx) => {
                    let _ = tx.send(resp);
                }
                None => {
                    debug!(server = %server, id, "Response for unknown request id ignored");
                }
            }
        }
        Err(e) => {
            debug!(server = %server, error = %e, "Skipping malformed response frame");
        }
    }
}

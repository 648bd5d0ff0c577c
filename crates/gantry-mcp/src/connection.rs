//! Transport dispatch and request correlation plumbing.
//!
//! A [`Connection`] wraps one live transport to a server. All four variants
//! satisfy the same send/notify contract; the manager picks the variant from
//! the server's configured [`ServerType`] and never inspects transport
//! internals itself.

use crate::http::HttpConnection;
use crate::protocol::JsonRpcResponse;
use crate::sse::SseConnection;
use crate::stdio::StdioConnection;
use crate::ws::WebSocketConnection;
use gantry_core::{GantryError, GantryResult, ServerType};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::debug;

/// Correlation table: in-flight request IDs to their awaiting callers.
///
/// An ID lives here only between send and resolve/timeout/close; dropping a
/// sender wakes its receiver with a recv error, which the wait side reports
/// as a closed connection.
pub(crate) type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

pub(crate) fn new_pending() -> PendingMap {
    Arc::new(Mutex::new(HashMap::new()))
}

/// Removes and returns the pending sender for `id`, if still registered.
pub(crate) async fn take_pending(
    pending: &PendingMap,
    id: u64,
) -> Option<oneshot::Sender<JsonRpcResponse>> {
    pending.lock().await.remove(&id)
}

/// Drops every pending sender, unblocking all waiting callers with a
/// connection-closed error. Returns how many callers were drained.
pub(crate) async fn drain_pending(pending: &PendingMap) -> usize {
    let drained = std::mem::take(&mut *pending.lock().await);
    drained.len()
}

/// A server-initiated notification (or request) observed by a reader loop.
#[derive(Debug, Clone)]
pub struct ServerNotification {
    /// Name of the server the frame arrived from.
    pub server: String,
    /// JSON-RPC method, e.g. `notifications/tools/list_changed`.
    pub method: String,
    /// Method params, if any.
    pub params: Option<serde_json::Value>,
}

/// Routes one inbound frame: responses resolve their pending caller by ID,
/// frames carrying a `method` are forwarded as server notifications, and
/// anything unparseable is skipped.
pub(crate) async fn route_frame(
    server: &str,
    raw: &str,
    pending: &PendingMap,
    notif_tx: &mpsc::UnboundedSender<ServerNotification>,
) {
    let value: serde_json::Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            debug!(server = %server, error = %e, "Skipping non-JSON-RPC frame");
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
            match take_pending(pending, id).await {
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

/// Awaits the oneshot receiver for request `id`, enforcing `timeout` and
/// deregistering the pending entry on timeout so a late response cannot
/// resolve an abandoned caller.
pub(crate) async fn await_response(
    server: &str,
    method: &str,
    pending: &PendingMap,
    id: u64,
    rx: oneshot::Receiver<JsonRpcResponse>,
    timeout: Duration,
) -> GantryResult<JsonRpcResponse> {
    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(resp)) => Ok(resp),
        Ok(Err(_)) => Err(GantryError::ConnectionClosed(format!(
            "connection to '{server}' closed before '{method}' completed"
        ))),
        Err(_) => {
            let _ = take_pending(pending, id).await;
            Err(GantryError::Timeout(format!(
                "request '{method}' to '{server}' timed out after {}s",
                timeout.as_secs()
            )))
        }
    }
}

/// Unwraps a JSON-RPC response into its result payload, converting the
/// `error` member into a protocol error that names the server.
pub(crate) fn into_result(server: &str, resp: JsonRpcResponse) -> GantryResult<serde_json::Value> {
    if let Some(err) = &resp.error {
        return Err(GantryError::Protocol(format!(
            "'{server}' returned MCP error {}: {}",
            err.code, err.message
        )));
    }
    Ok(resp.result.unwrap_or(serde_json::Value::Null))
}

/// One live transport connection to a managed server.
pub enum Connection {
    /// Newline-delimited JSON over subprocess pipes.
    Stdio(StdioConnection),
    /// Persistent WebSocket.
    Websocket(WebSocketConnection),
    /// Legacy SSE stream plus discovered POST endpoint.
    Sse(SseConnection),
    /// Stateless StreamableHTTP POSTs.
    Http(HttpConnection),
}

impl Connection {
    /// The transport tag this connection speaks.
    pub fn server_type(&self) -> ServerType {
        match self {
            Connection::Stdio(_) => ServerType::Stdio,
            Connection::Websocket(_) => ServerType::Websocket,
            Connection::Sse(_) => ServerType::Sse,
            Connection::Http(_) => ServerType::Http,
        }
    }

    /// Sends a request and awaits the correlated response's result payload.
    pub async fn send(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> GantryResult<serde_json::Value> {
        match self {
            Connection::Stdio(c) => c.send(method, params, timeout).await,
            Connection::Websocket(c) => c.send(method, params, timeout).await,
            Connection::Sse(c) => c.send(method, params, timeout).await,
            Connection::Http(c) => c.send(method, params, timeout).await,
        }
    }

    /// Sends a one-way notification; no response is expected.
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> GantryResult<()> {
        match self {
            Connection::Stdio(c) => c.notify(method, params).await,
            Connection::Websocket(c) => c.notify(method, params).await,
            Connection::Sse(c) => c.notify(method, params).await,
            Connection::Http(c) => c.notify(method, params).await,
        }
    }

    /// Cancels the reader task, closes the underlying socket/stream, and
    /// unblocks pending callers. Safe to call more than once.
    pub async fn close(&self) {
        match self {
            Connection::Stdio(c) => c.close().await,
            Connection::Websocket(c) => c.close().await,
            Connection::Sse(c) => c.close().await,
            Connection::Http(c) => c.close(),
        }
    }

    /// Whether the initialize handshake has completed on this connection.
    pub fn is_initialized(&self) -> bool {
        match self {
            Connection::Stdio(c) => c.is_initialized(),
            Connection::Websocket(c) => c.is_initialized(),
            Connection::Sse(c) => c.is_initialized(),
            Connection::Http(c) => c.is_initialized(),
        }
    }

    /// Records handshake completion.
    pub fn mark_initialized(&self) {
        match self {
            Connection::Stdio(c) => c.mark_initialized(),
            Connection::Websocket(c) => c.mark_initialized(),
            Connection::Sse(c) => c.mark_initialized(),
            Connection::Http(c) => c.mark_initialized(),
        }
    }
}

//! Legacy SSE transport: a persistent GET stream paired with a POST endpoint.
//!
//! The server announces where to POST via an `endpoint` event on the stream;
//! every response then arrives asynchronously as a `message` event and is
//! matched to its caller by request id, exactly like the stdio reader. The
//! POST itself only acknowledges receipt.

use crate::connection::{
    await_response, drain_pending, into_result, new_pending, route_frame, take_pending,
    PendingMap, ServerNotification,
};
use crate::protocol::{JsonRpcNotification, JsonRpcRequest};
use futures_util::StreamExt;
use gantry_core::{GantryError, GantryResult};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Connection to a legacy SSE MCP server.
pub struct SseConnection {
    server: String,
    messages_url: String,
    client: reqwest::Client,
    next_id: AtomicU64,
    pending: PendingMap,
    reader_task: JoinHandle<()>,
    initialized: AtomicBool,
    closed: AtomicBool,
}

impl SseConnection {
    /// Opens the event stream and waits for the server to announce its POST
    /// endpoint. Discovery has its own timeout, separate from the overall
    /// handshake budget.
    pub(crate) async fn connect(
        server: &str,
        sse_url: &str,
        client: reqwest::Client,
        endpoint_timeout: Duration,
        notif_tx: mpsc::UnboundedSender<ServerNotification>,
    ) -> GantryResult<Self> {
        let resp = client
            .get(sse_url)
            .header("Accept", "text/event-stream")
            .send()
            .await
            .map_err(|e| {
                GantryError::Unavailable(format!(
                    "SSE connect to {sse_url} for '{server}' failed: {e}"
                ))
            })?;
        if !resp.status().is_success() {
            return Err(GantryError::Http(format!(
                "'{server}' SSE stream returned HTTP {}",
                resp.status()
            )));
        }

        let pending = new_pending();
        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        let reader_task = tokio::spawn(read_loop(
            server.to_string(),
            resp,
            pending.clone(),
            endpoint_tx,
            notif_tx,
        ));

        let endpoint = match tokio::time::timeout(endpoint_timeout, endpoint_rx).await {
            Ok(Ok(endpoint)) => endpoint,
            Ok(Err(_)) => {
                reader_task.abort();
                return Err(GantryError::Handshake(format!(
                    "SSE stream for '{server}' closed before announcing an endpoint"
                )));
            }
            Err(_) => {
                reader_task.abort();
                return Err(GantryError::Handshake(format!(
                    "'{server}' did not announce an SSE endpoint within {}s",
                    endpoint_timeout.as_secs()
                )));
            }
        };
        let messages_url = resolve_endpoint(sse_url, &endpoint)?;
        info!(server = %server, messages_url = %messages_url, "SSE endpoint discovered");

        Ok(Self {
            server: server.to_string(),
            messages_url,
            client,
            next_id: AtomicU64::new(0),
            pending,
            reader_task,
            initialized: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_initialized(&self) {
        self.initialized.store(true, Ordering::SeqCst);
    }

    /// POSTs a request to the discovered endpoint and waits for its response
    /// to arrive on the event stream.
    pub(crate) async fn send(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> GantryResult<serde_json::Value> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GantryError::ConnectionClosed(format!(
                "SSE connection to '{}' is closed",
                self.server
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let request = JsonRpcRequest::new(id, method, params);

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let post = self
            .client
            .post(&self.messages_url)
            .timeout(timeout)
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await;
        match post {
            Ok(resp) if resp.status().as_u16() >= 400 => {
                take_pending(&self.pending, id).await;
                return Err(GantryError::Http(format!(
                    "'{}' rejected '{method}' POST with HTTP {}",
                    self.server,
                    resp.status()
                )));
            }
            Ok(_) => {}
            Err(e) => {
                take_pending(&self.pending, id).await;
                return Err(GantryError::Unavailable(format!(
                    "POST to '{}' messages endpoint failed: {e}",
                    self.server
                )));
            }
        }
        debug!(server = %self.server, id, method = %method, "Sent SSE request");

        let resp = await_response(&self.server, method, &self.pending, id, rx, timeout).await?;
        into_result(&self.server, resp)
    }

    /// POSTs a one-way notification. Failures are logged, not raised.
    pub(crate) async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> GantryResult<()> {
        let notification = JsonRpcNotification::new(method, params);
        let post = self
            .client
            .post(&self.messages_url)
            .timeout(Duration::from_secs(30))
            .header("Content-Type", "application/json")
            .json(&notification)
            .send()
            .await;
        match post {
            Ok(resp) if !resp.status().is_success() => {
                warn!(
                    server = %self.server,
                    method = %method,
                    status = %resp.status(),
                    "Notification rejected"
                );
            }
            Ok(_) => {}
            Err(e) => {
                warn!(server = %self.server, method = %method, error = %e, "Notification POST failed");
            }
        }
        Ok(())
    }

    /// Drops the event stream and unblocks pending callers.
    pub(crate) async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.reader_task.abort();
        let drained = drain_pending(&self.pending).await;
        if drained > 0 {
            debug!(server = %self.server, in_flight = drained, "Dropped in-flight requests on close");
        }
        info!(server = %self.server, "SSE connection closed");
    }
}

/// Parses the persistent event stream. The first `endpoint` event resolves
/// the discovery channel; `message` events are routed like stdio lines.
async fn read_loop(
    server: String,
    resp: reqwest::Response,
    pending: PendingMap,
    endpoint_tx: oneshot::Sender<String>,
    notif_tx: mpsc::UnboundedSender<ServerNotification>,
) {
    let mut endpoint_tx = Some(endpoint_tx);
    let mut stream = resp.bytes_stream();
    let mut buffer = String::new();
    let mut event_type = String::new();
    let mut data = String::new();

    loop {
        let chunk = match stream.next().await {
            Some(Ok(chunk)) => chunk,
            Some(Err(e)) => {
                warn!(server = %server, error = %e, "SSE stream read failed");
                break;
            }
            None => {
                info!(server = %server, "SSE stream ended");
                break;
            }
        };
        buffer.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(line_end) = buffer.find('\n') {
            let line = buffer[..line_end].trim_end_matches('\r').to_string();
            buffer.drain(..=line_end);

            if let Some(value) = line.strip_prefix("event:") {
                event_type = value.trim().to_string();
            } else if let Some(value) = line.strip_prefix("data:") {
                if !data.is_empty() {
                    data.push('\n');
                }
                data.push_str(value.trim_start());
            } else if line.is_empty() {
                if !event_type.is_empty() || !data.is_empty() {
                    handle_event(
                        &server,
                        &event_type,
                        &data,
                        &pending,
                        &mut endpoint_tx,
                        &notif_tx,
                    )
                    .await;
                }
                event_type.clear();
                data.clear();
            }
        }
    }

    let drained = drain_pending(&pending).await;
    if drained > 0 {
        debug!(server = %server, in_flight = drained, "Unblocked pending callers after stream end");
    }
}

async fn handle_event(
    server: &str,
    event_type: &str,
    data: &str,
    pending: &PendingMap,
    endpoint_tx: &mut Option<oneshot::Sender<String>>,
    notif_tx: &mpsc::UnboundedSender<ServerNotification>,
) {
    match event_type {
        "endpoint" => {
            if let Some(tx) = endpoint_tx.take() {
                let _ = tx.send(data.to_string());
            } else {
                debug!(server = %server, "Duplicate endpoint event ignored");
            }
        }
        // An absent event field means "message" per the SSE framing rules.
        "message" | "" => route_frame(server, data, pending, notif_tx).await,
        other => {
            debug!(server = %server, event = %other, "Ignoring unknown SSE event");
        }
    }
}

/// Turns the announced endpoint into an absolute messages URL. Relative
/// paths resolve against the SSE URL's scheme and host; some servers wrap
/// the endpoint in a JSON object.
fn resolve_endpoint(sse_url: &str, data: &str) -> GantryResult<String> {
    let data = data.trim();
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(data) {
        if let Some(inner) = value.get("endpoint").and_then(|v| v.as_str()) {
            return resolve_endpoint(sse_url, inner);
        }
    }
    if data.starts_with("http://") || data.starts_with("https://") {
        return Ok(data.to_string());
    }

    let base = reqwest::Url::parse(sse_url)
        .map_err(|e| GantryError::Config(format!("invalid SSE URL '{sse_url}': {e}")))?;
    let joined = base.join(data).map_err(|e| {
        GantryError::Protocol(format!(
            "cannot resolve SSE endpoint '{data}' against '{sse_url}': {e}"
        ))
    })?;
    Ok(joined.to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::resolve_endpoint;

    #[test]
    fn test_relative_endpoint_resolves_against_sse_host() {
        let url = resolve_endpoint("http://localhost:9300/sse", "/messages?id=1").unwrap();
        assert_eq!(url, "http://localhost:9300/messages?id=1");
    }

    #[test]
    fn test_absolute_endpoint_passes_through() {
        let url = resolve_endpoint("http://localhost:9300/sse", "http://other:9999/rpc").unwrap();
        assert_eq!(url, "http://other:9999/rpc");
    }

    #[test]
    fn test_json_wrapped_endpoint() {
        let url =
            resolve_endpoint("https://mcp.example.com/sse", r#"{"endpoint":"/messages"}"#).unwrap();
        assert_eq!(url, "https://mcp.example.com/messages");
    }

    #[test]
    fn test_invalid_base_url_is_an_error() {
        assert!(resolve_endpoint("not a url", "/messages").is_err());
    }
}

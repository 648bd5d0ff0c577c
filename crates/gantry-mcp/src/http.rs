//! StreamableHTTP transport: one POST per request, no persistent stream.
//!
//! Each call POSTs a JSON-RPC body and reads the reply inline, either as a
//! plain JSON body or as a single-shot SSE stream. Servers may issue an
//! `Mcp-Session-Id` header; it is captured and echoed on every later
//! request. Transient failures (5xx, refused connections) are retried with
//! exponential backoff; 4xx means the request itself is wrong and fails at
//! once.

use crate::connection::into_result;
use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use futures_util::StreamExt;
use gantry_core::{GantryError, GantryResult};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

const MAX_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);
const NOTIFY_TIMEOUT: Duration = Duration::from_secs(30);
const SESSION_HEADER: &str = "Mcp-Session-Id";

/// Connection to a StreamableHTTP MCP server.
pub struct HttpConnection {
    server: String,
    url: String,
    client: reqwest::Client,
    next_id: AtomicU64,
    session: parking_lot::RwLock<Option<String>>,
    initialized: AtomicBool,
}

impl HttpConnection {
    pub(crate) fn new(server: &str, url: &str, client: reqwest::Client) -> Self {
        Self {
            server: server.to_string(),
            url: url.to_string(),
            client,
            next_id: AtomicU64::new(0),
            session: parking_lot::RwLock::new(None),
            initialized: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_initialized(&self) {
        self.initialized.store(true, Ordering::SeqCst);
    }

    /// Session token issued by the server, if any.
    pub(crate) fn session_id(&self) -> Option<String> {
        self.session.read().clone()
    }

    /// POSTs a request, retrying transient failures, and extracts the
    /// response matching this request's id from whichever body shape the
    /// server chose.
    pub(crate) async fn send(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> GantryResult<serde_json::Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let request = JsonRpcRequest::new(id, method, params);
        let mut last_error = String::new();

        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                let delay = RETRY_BASE_DELAY * (1 << (attempt - 1));
                debug!(
                    server = %self.server,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying request"
                );
                tokio::time::sleep(delay).await;
            }

            let mut req = self
                .client
                .post(&self.url)
                .timeout(timeout)
                .header("Content-Type", "application/json")
                .header("Accept", "application/json, text/event-stream");
            if let Some(session) = self.session_id() {
                req = req.header(SESSION_HEADER, session);
            }

            let resp = match req.json(&request).send().await {
                Ok(resp) => resp,
                Err(e) if e.is_timeout() => {
                    return Err(GantryError::Timeout(format!(
                        "request '{method}' to '{}' timed out after {}s",
                        self.server,
                        timeout.as_secs()
                    )));
                }
                Err(e) => {
                    last_error = format!("POST to {} failed: {e}", self.url);
                    warn!(server = %self.server, attempt = attempt + 1, error = %e, "Request failed");
                    continue;
                }
            };

            let status = resp.status();
            if status.is_server_error() {
                last_error = format!("HTTP {status} from {}", self.url);
                warn!(server = %self.server, attempt = attempt + 1, status = %status, "Server error");
                continue;
            }
            if status.is_client_error() {
                return Err(GantryError::Http(format!(
                    "'{}' rejected '{method}' with HTTP {status}",
                    self.server
                )));
            }

            if let Some(session) = resp
                .headers()
                .get(SESSION_HEADER)
                .and_then(|v| v.to_str().ok())
            {
                *self.session.write() = Some(session.to_string());
            }

            let content_type = resp
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();

            let response = if content_type.starts_with("text/event-stream") {
                self.read_sse_body(resp, id).await?
            } else {
                self.parse_json_body(resp, id).await?
            };
            return into_result(&self.server, response);
        }

        Err(GantryError::Unavailable(format!(
            "'{}' unreachable after {MAX_ATTEMPTS} attempts: {last_error}",
            self.server
        )))
    }

    /// POSTs a notification. Failures are logged, never raised: there is no
    /// response to correlate and nothing for the caller to recover.
    pub(crate) async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> GantryResult<()> {
        let notification = JsonRpcNotification::new(method, params);
        let mut req = self
            .client
            .post(&self.url)
            .timeout(NOTIFY_TIMEOUT)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream");
        if let Some(session) = self.session_id() {
            req = req.header(SESSION_HEADER, session);
        }

        match req.json(&notification).send().await {
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

    /// Forgets the session token. The shared HTTP client stays open; it
    /// belongs to the manager.
    pub(crate) fn close(&self) {
        *self.session.write() = None;
    }

    async fn parse_json_body(
        &self,
        resp: reqwest::Response,
        id: u64,
    ) -> GantryResult<JsonRpcResponse> {
        let body: serde_json::Value = resp.json().await.map_err(|e| {
            GantryError::Protocol(format!("invalid JSON body from '{}': {e}", self.server))
        })?;

        match body {
            serde_json::Value::Array(entries) => {
                for entry in entries {
                    if entry.get("id").and_then(|v| v.as_u64()) == Some(id) {
                        return Ok(serde_json::from_value(entry)?);
                    }
                }
                Err(GantryError::Protocol(format!(
                    "batch response from '{}' is missing id {id}",
                    self.server
                )))
            }
            other => Ok(serde_json::from_value(other)?),
        }
    }

    /// Reads a single-shot SSE response body until a data payload carries
    /// the response for `id`.
    async fn read_sse_body(
        &self,
        resp: reqwest::Response,
        id: u64,
    ) -> GantryResult<JsonRpcResponse> {
        let mut stream = resp.bytes_stream();
        let mut buffer = String::new();
        let mut data = String::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| {
                GantryError::Http(format!("SSE body read from '{}' failed: {e}", self.server))
            })?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(line_end) = buffer.find('\n') {
                let line = buffer[..line_end].trim_end_matches('\r').to_string();
                buffer.drain(..=line_end);

                if let Some(payload) = line.strip_prefix("data:") {
                    if !data.is_empty() {
                        data.push('\n');
                    }
                    data.push_str(payload.trim_start());
                } else if line.is_empty() && !data.is_empty() {
                    if let Some(resp) = match_response(&data, id) {
                        return Ok(resp);
                    }
                    data.clear();
                }
            }
        }

        Err(GantryError::Protocol(format!(
            "SSE body from '{}' ended without a response for id {id}",
            self.server
        )))
    }
}

/// Parses an SSE data payload and returns the response matching `id`, if
/// this payload carries it. Batch arrays are searched entry by entry.
fn match_response(data: &str, id: u64) -> Option<JsonRpcResponse> {
    let value: serde_json::Value = serde_json::from_str(data).ok()?;
    match value {
        serde_json::Value::Array(entries) => {
            for entry in entries {
                if let Ok(resp) = serde_json::from_value::<JsonRpcResponse>(entry) {
                    if resp.id == Some(id) {
                        return Some(resp);
                    }
                }
            }
            None
        }
        other => {
            let resp: JsonRpcResponse = serde_json::from_value(other).ok()?;
            (resp.id == Some(id)).then_some(resp)
        }
    }
}

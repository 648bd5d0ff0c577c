//! WebSocket transport: one persistent socket, one reader task.
//!
//! The pending entry for a request is registered before the frame goes out.
//! The reader may otherwise see the response, find nobody waiting, and drop
//! it on the floor.

use crate::connection::{
    await_response, drain_pending, into_result, new_pending, route_frame, take_pending,
    PendingMap, ServerNotification,
};
use crate::protocol::{JsonRpcNotification, JsonRpcRequest};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use gantry_core::{GantryError, GantryResult};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Connection to a WebSocket MCP server.
pub struct WebSocketConnection {
    server: String,
    next_id: AtomicU64,
    pending: PendingMap,
    writer: Arc<Mutex<WsSink>>,
    reader_task: JoinHandle<()>,
    initialized: AtomicBool,
    closed: AtomicBool,
}

impl WebSocketConnection {
    /// Opens the socket and starts the reader task.
    pub(crate) async fn connect(
        server: &str,
        url: &str,
        notif_tx: mpsc::UnboundedSender<ServerNotification>,
    ) -> GantryResult<Self> {
        let (ws_stream, _) = connect_async(url).await.map_err(|e| {
            GantryError::Unavailable(format!(
                "websocket connect to {url} for '{server}' failed: {e}"
            ))
        })?;
        info!(server = %server, url = %url, "Websocket connected");

        let (write, read) = ws_stream.split();
        let pending = new_pending();
        let reader_task = tokio::spawn(read_loop(
            server.to_string(),
            read,
            pending.clone(),
            notif_tx,
        ));

        Ok(Self {
            server: server.to_string(),
            next_id: AtomicU64::new(0),
            pending,
            writer: Arc::new(Mutex::new(write)),
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

    /// Sends a request and awaits the matching response from the reader.
    pub(crate) async fn send(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> GantryResult<serde_json::Value> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GantryError::ConnectionClosed(format!(
                "websocket connection to '{}' is closed",
                self.server
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let request = JsonRpcRequest::new(id, method, params);
        let payload = serde_json::to_string(&request)?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if let Err(e) = self.writer.lock().await.send(Message::Text(payload)).await {
            take_pending(&self.pending, id).await;
            return Err(GantryError::ConnectionClosed(format!(
                "websocket send to '{}' failed: {e}",
                self.server
            )));
        }
        debug!(server = %self.server, id, method = %method, "Sent websocket request");

        let resp = await_response(&self.server, method, &self.pending, id, rx, timeout).await?;
        into_result(&self.server, resp)
    }

    /// Sends a one-way notification frame.
    pub(crate) async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> GantryResult<()> {
        let notification = JsonRpcNotification::new(method, params);
        let payload = serde_json::to_string(&notification)?;
        self.writer
            .lock()
            .await
            .send(Message::Text(payload))
            .await
            .map_err(|e| {
                GantryError::ConnectionClosed(format!(
                    "websocket send to '{}' failed: {e}",
                    self.server
                ))
            })
    }

    /// Sends a close frame, stops the reader, and unblocks pending callers.
    pub(crate) async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut writer = self.writer.lock().await;
            let _ = writer.send(Message::Close(None)).await;
        }
        self.reader_task.abort();
        let drained = drain_pending(&self.pending).await;
        if drained > 0 {
            debug!(server = %self.server, in_flight = drained, "Dropped in-flight requests on close");
        }
        info!(server = %self.server, "Websocket connection closed");
    }
}

async fn read_loop(
    server: String,
    mut read: WsSource,
    pending: PendingMap,
    notif_tx: mpsc::UnboundedSender<ServerNotification>,
) {
    while let Some(msg) = read.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                route_frame(&server, &text, &pending, &notif_tx).await;
            }
            Ok(Message::Close(_)) => {
                info!(server = %server, "Websocket closed by server");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(server = %server, error = %e, "Websocket read failed");
                break;
            }
        }
    }

    let drained = drain_pending(&pending).await;
    if drained > 0 {
        debug!(server = %server, in_flight = drained, "Unblocked pending callers after socket close");
    }
}

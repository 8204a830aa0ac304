//! JSON-RPC wire session: envelope encode/decode and request correlation.
//!
//! The engine above this layer talks to a [`WireSession`]: it sends requests
//! and notifications, and receives [`SessionEvent`]s. [`JsonRpcSession`] is
//! the implementation over a byte [`Transport`].

use crate::config::ConnectionConfig;
use crate::error::McpError;
use crate::framer::JsonObjectCodec;
use crate::transport::{Transport, reap_child};
use bytes::Bytes;
use conduit_types::{
    CancelledParams, ErrorObject, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, RequestId, methods,
};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// A boxed future, as returned by [`WireSession`] methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// What the protocol engine needs from a JSON-RPC session.
///
/// Dyn-compatible so connections hold an `Arc<dyn WireSession>`.
pub trait WireSession: Send + Sync {
    /// Send a request and wait for the peer's correlated reply.
    fn send_request<'a>(
        &'a self,
        method: &'a str,
        params: Option<Value>,
    ) -> BoxFuture<'a, Result<Value, McpError>>;

    /// Send a notification. No reply is expected.
    fn send_notification<'a>(
        &'a self,
        method: &'a str,
        params: Option<Value>,
    ) -> BoxFuture<'a, Result<(), McpError>>;

    /// Stop the session. Pending and later calls fail with `ConnectionClosed`.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Something the peer sent that the engine has to look at.
#[derive(Debug)]
pub enum SessionEvent {
    Notification {
        method: String,
        params: Option<Value>,
    },
    Request {
        id: RequestId,
        method: String,
        params: Option<Value>,
        responder: Responder,
    },
    /// The transport failed or reached EOF. Sent at most once.
    TransportError(McpError),
}

/// Answers one inbound request. Consumed by use, so it can answer at most once.
///
/// Dropping it unanswered sends an internal error to the peer.
#[derive(Debug)]
pub struct Responder {
    id: RequestId,
    reply_to: Option<ReplyTo>,
}

#[derive(Debug)]
enum ReplyTo {
    Wire(mpsc::Sender<Bytes>),
    Channel(oneshot::Sender<Result<Value, ErrorObject>>),
}

impl Responder {
    fn wire(id: RequestId, outbound: mpsc::Sender<Bytes>) -> Self {
        Self {
            id,
            reply_to: Some(ReplyTo::Wire(outbound)),
        }
    }

    /// A responder whose reply lands on a channel instead of the wire, for
    /// other [`WireSession`] implementations and for tests.
    pub fn channel(id: RequestId) -> (Self, oneshot::Receiver<Result<Value, ErrorObject>>) {
        let (tx, rx) = oneshot::channel();
        let responder = Self {
            id,
            reply_to: Some(ReplyTo::Channel(tx)),
        };
        (responder, rx)
    }

    pub fn id(&self) -> &RequestId {
        &self.id
    }

    pub fn respond(mut self, outcome: Result<Value, ErrorObject>) {
        self.deliver(outcome);
    }

    pub fn respond_ok<T: Serialize>(self, result: &T) {
        match serde_json::to_value(result) {
            Ok(value) => self.respond(Ok(value)),
            Err(e) => self.respond(Err(ErrorObject::internal_error(format!(
                "Failed to serialize result: {e}"
            )))),
        }
    }

    pub fn respond_err(self, error: ErrorObject) {
        self.respond(Err(error));
    }

    fn deliver(&mut self, outcome: Result<Value, ErrorObject>) {
        let Some(reply_to) = self.reply_to.take() else {
            return;
        };
        match reply_to {
            ReplyTo::Channel(tx) => {
                let _ = tx.send(outcome);
            }
            ReplyTo::Wire(outbound) => {
                let response = JsonRpcResponse::from_outcome(self.id.clone(), outcome);
                let bytes = match serde_json::to_vec(&response) {
                    Ok(bytes) => Bytes::from(bytes),
                    Err(e) => {
                        tracing::warn!("Failed to serialize response to {}: {e}", self.id);
                        return;
                    }
                };
                // Queue synchronously so a reply made just before `close` is
                // still flushed by the writer.
                match outbound.try_send(bytes) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(bytes)) => {
                        if let Ok(handle) = tokio::runtime::Handle::try_current() {
                            handle.spawn(async move {
                                let _ = outbound.send(bytes).await;
                            });
                        }
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        tracing::debug!("Reply to request {} dropped: session closed", self.id);
                    }
                }
            }
        }
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if self.reply_to.is_some() {
            self.deliver(Err(ErrorObject::internal_error(
                "request was dropped without a response",
            )));
        }
    }
}

type PendingMap = Arc<Mutex<HashMap<RequestId, oneshot::Sender<JsonRpcResponse>>>>;

/// Newline-delimited JSON-RPC 2.0 over a byte transport.
pub struct JsonRpcSession {
    next_id: AtomicI64,
    outbound: mpsc::Sender<Bytes>,
    pending: PendingMap,
    closed: CancellationToken,
    request_timeout: Duration,
    writer_handle: Mutex<Option<JoinHandle<()>>>,
    child: Mutex<Option<Child>>,
}

impl JsonRpcSession {
    /// Start the reader and writer tasks. Events are buffered from this point
    /// on, so nothing is lost before the caller starts reading them.
    ///
    /// Tasks run in the caller's current tracing span.
    pub fn start(
        transport: Transport,
        config: &ConnectionConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SessionEvent>) {
        let Transport {
            reader,
            writer,
            child,
        } = transport;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::channel::<Bytes>(config.write_buffer.max(1));
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = CancellationToken::new();

        let writer_handle = tokio::spawn(
            write_loop(
                FramedWrite::new(writer, JsonObjectCodec::new()),
                outbound_rx,
                events_tx.clone(),
                closed.clone(),
            )
            .in_current_span(),
        );

        tokio::spawn(
            read_loop(
                FramedRead::new(reader, JsonObjectCodec::new()),
                ReadContext {
                    events: events_tx,
                    outbound: outbound_tx.clone(),
                    pending: Arc::clone(&pending),
                    closed: closed.clone(),
                },
            )
            .in_current_span(),
        );

        let session = Arc::new(Self {
            next_id: AtomicI64::new(1),
            outbound: outbound_tx,
            pending,
            closed,
            request_timeout: config.request_timeout(),
            writer_handle: Mutex::new(Some(writer_handle)),
            child: Mutex::new(child),
        });
        (session, events_rx)
    }

    async fn enqueue<T: Serialize>(&self, message: &T) -> Result<(), McpError> {
        enqueue(&self.outbound, &self.closed, message).await
    }

    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        if self.closed.is_cancelled() {
            return Err(McpError::ConnectionClosed);
        }

        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        let request = JsonRpcRequest::new(id.clone(), method, params);
        if let Err(e) = self.enqueue(&request).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        tokio::select! {
            biased;
            reply = rx => match reply {
                Ok(response) => response.into_result().map_err(McpError::from),
                Err(_) => Err(McpError::ConnectionClosed),
            },
            _ = self.closed.cancelled() => {
                self.pending.lock().await.remove(&id);
                Err(McpError::ConnectionClosed)
            }
            _ = tokio::time::sleep(self.request_timeout) => {
                self.pending.lock().await.remove(&id);
                let cancelled = CancelledParams {
                    request_id: id,
                    reason: Some("request timed out".to_string()),
                    meta: None,
                };
                let notification = JsonRpcNotification::new(
                    methods::CANCELLED,
                    serde_json::to_value(&cancelled).ok(),
                );
                if let Err(e) = self.enqueue(&notification).await {
                    tracing::debug!("Could not send cancellation for '{method}': {e}");
                }
                Err(McpError::Timeout {
                    method: method.to_string(),
                    timeout_ms: self.request_timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Close the session, then wait for a spawned server to exit (killing it
    /// after a grace period).
    pub async fn shutdown(&self) {
        self.close();
        if let Some(handle) = self.writer_handle.lock().await.take() {
            let _ = handle.await;
        }
        if let Some(child) = self.child.lock().await.take() {
            reap_child(child, SHUTDOWN_GRACE).await;
        }
    }
}

impl WireSession for JsonRpcSession {
    fn send_request<'a>(
        &'a self,
        method: &'a str,
        params: Option<Value>,
    ) -> BoxFuture<'a, Result<Value, McpError>> {
        Box::pin(self.request(method, params))
    }

    fn send_notification<'a>(
        &'a self,
        method: &'a str,
        params: Option<Value>,
    ) -> BoxFuture<'a, Result<(), McpError>> {
        Box::pin(async move {
            let notification = JsonRpcNotification::new(method, params);
            self.enqueue(&notification).await
        })
    }

    fn close(&self) {
        self.closed.cancel();
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl Drop for JsonRpcSession {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

async fn enqueue<T: Serialize>(
    outbound: &mpsc::Sender<Bytes>,
    closed: &CancellationToken,
    message: &T,
) -> Result<(), McpError> {
    if closed.is_cancelled() {
        return Err(McpError::ConnectionClosed);
    }
    let bytes = Bytes::from(serde_json::to_vec(message)?);
    tokio::select! {
        sent = outbound.send(bytes) => sent.map_err(|_| McpError::ConnectionClosed),
        _ = closed.cancelled() => Err(McpError::ConnectionClosed),
    }
}

async fn write_loop<W>(
    mut sink: FramedWrite<W, JsonObjectCodec>,
    mut outbound: mpsc::Receiver<Bytes>,
    events: mpsc::UnboundedSender<SessionEvent>,
    closed: CancellationToken,
) where
    W: tokio::io::AsyncWrite + Unpin,
{
    loop {
        let message = tokio::select! {
            biased;
            message = outbound.recv() => message,
            _ = closed.cancelled() => None,
        };
        let Some(message) = message else { break };
        if let Err(e) = sink.send(message).await {
            tracing::warn!("MCP write failed: {e}");
            if !closed.is_cancelled() {
                let _ = events.send(SessionEvent::TransportError(e));
            }
            closed.cancel();
            return;
        }
    }

    // Flush whatever was queued before the close, then signal EOF.
    while let Ok(message) = outbound.try_recv() {
        if sink.feed(message).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}

struct ReadContext {
    events: mpsc::UnboundedSender<SessionEvent>,
    outbound: mpsc::Sender<Bytes>,
    pending: PendingMap,
    closed: CancellationToken,
}

async fn read_loop<R>(mut frames: FramedRead<R, JsonObjectCodec>, ctx: ReadContext)
where
    R: tokio::io::AsyncRead + Unpin,
{
    loop {
        let frame = tokio::select! {
            biased;
            _ = ctx.closed.cancelled() => break,
            frame = frames.next() => frame,
        };
        match frame {
            Some(Ok(bytes)) => ctx.handle_frame(&bytes).await,
            Some(Err(e)) => {
                tracing::warn!("MCP transport error: {e}");
                let _ = ctx.events.send(SessionEvent::TransportError(e));
                break;
            }
            None => {
                tracing::debug!("MCP transport reached EOF");
                let _ = ctx
                    .events
                    .send(SessionEvent::TransportError(McpError::ConnectionClosed));
                break;
            }
        }
    }

    ctx.closed.cancel();
    // Dropping the senders fails every in-flight call.
    ctx.pending.lock().await.clear();
}

impl ReadContext {
    async fn handle_frame(&self, bytes: &[u8]) {
        let value: Value = match serde_json::from_slice(bytes) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(
                    "Failed to parse MCP message: {e}: {}",
                    String::from_utf8_lossy(bytes)
                );
                return;
            }
        };

        match JsonRpcMessage::classify(value) {
            Ok(JsonRpcMessage::Request(request)) => self.dispatch_request(request),
            Ok(JsonRpcMessage::Notification(notification)) => {
                let _ = self.events.send(SessionEvent::Notification {
                    method: notification.method,
                    params: notification.params,
                });
            }
            Ok(JsonRpcMessage::Response(response)) => self.complete(response).await,
            Err((Some(id), e)) => {
                tracing::warn!("Invalid MCP message with id {id}: {e}");
                let reply = JsonRpcResponse::failure(Some(id), ErrorObject::from(&e));
                if let Err(e) = enqueue(&self.outbound, &self.closed, &reply).await {
                    tracing::debug!("Could not reject invalid message: {e}");
                }
            }
            Err((None, e)) => tracing::warn!("Dropping invalid MCP message: {e}"),
        }
    }

    fn dispatch_request(&self, request: JsonRpcRequest) {
        let responder = Responder::wire(request.id.clone(), self.outbound.clone());
        let _ = self.events.send(SessionEvent::Request {
            id: request.id,
            method: request.method,
            params: request.params,
            responder,
        });
    }

    async fn complete(&self, response: JsonRpcResponse) {
        let Some(id) = response.id.clone() else {
            tracing::warn!("MCP error response without id: {:?}", response.error);
            return;
        };
        match self.pending.lock().await.remove(&id) {
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => tracing::debug!("Response for unknown or expired request {id}"),
        }
    }
}

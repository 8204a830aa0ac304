//! The `initialize` / `initialized` exchange, for both roles.

use crate::connection::IncomingRequest;
use crate::error::McpError;
use crate::session::WireSession;
use conduit_types::{
    ClientRequest, ErrorObject, Implementation, InitializeParams, InitializeResult, Message,
    PROTOCOL_VERSION, ServerCapabilities, methods,
};
use std::fmt;
use tokio::sync::{mpsc, watch};

/// Where a connection is in the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Unconnected,
    /// Client: `initialize` sent, waiting for the result.
    AwaitingInitializeResult,
    /// Client: result accepted, `initialized` being sent.
    AwaitingAcknowledgementSent,
    /// Server: waiting for the client's `initialize`.
    AwaitingInitialize,
    Ready,
    Failed,
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unconnected => "unconnected",
            Self::AwaitingInitializeResult => "awaiting initialize result",
            Self::AwaitingAcknowledgementSent => "sending initialized",
            Self::AwaitingInitialize => "awaiting initialize",
            Self::Ready => "ready",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Observable handshake state. Operations gate on [`ensure_ready`](Self::ensure_ready).
#[derive(Debug)]
pub struct HandshakeTracker {
    tx: watch::Sender<HandshakeState>,
}

impl HandshakeTracker {
    pub fn new(initial: HandshakeState) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    pub fn state(&self) -> HandshakeState {
        *self.tx.borrow()
    }

    pub fn advance(&self, next: HandshakeState) {
        tracing::debug!("Handshake: {} -> {next}", self.state());
        self.tx.send_replace(next);
    }

    /// Fail locally unless the handshake has completed.
    pub fn ensure_ready(&self) -> Result<(), McpError> {
        match self.state() {
            HandshakeState::Ready => Ok(()),
            _ => Err(McpError::NotInitialized),
        }
    }

    /// Wait until the handshake completes. Errors if it fails instead.
    pub async fn wait_ready(&self) -> Result<(), McpError> {
        let mut rx = self.tx.subscribe();
        let state = rx
            .wait_for(|s| matches!(s, HandshakeState::Ready | HandshakeState::Failed))
            .await
            .map_err(|_| McpError::ConnectionClosed)?;
        match *state {
            HandshakeState::Ready => Ok(()),
            _ => Err(McpError::NotInitialized),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<HandshakeState> {
        self.tx.subscribe()
    }
}

/// Run the client side: send `initialize`, check the version, send
/// `initialized`. A mismatched version fails without acknowledging.
pub async fn initiate(
    session: &dyn WireSession,
    tracker: &HandshakeTracker,
    params: InitializeParams,
) -> Result<InitializeResult, McpError> {
    let result = initiate_inner(session, tracker, params).await;
    if result.is_err() {
        tracker.advance(HandshakeState::Failed);
    }
    result
}

async fn initiate_inner(
    session: &dyn WireSession,
    tracker: &HandshakeTracker,
    params: InitializeParams,
) -> Result<InitializeResult, McpError> {
    tracker.advance(HandshakeState::AwaitingInitializeResult);
    let raw = session
        .send_request(methods::INITIALIZE, Some(serde_json::to_value(&params)?))
        .await?;
    let result: InitializeResult = serde_json::from_value(raw)?;

    if result.protocol_version != params.protocol_version {
        return Err(McpError::VersionMismatch {
            expected: params.protocol_version,
            received: result.protocol_version,
        });
    }

    tracker.advance(HandshakeState::AwaitingAcknowledgementSent);
    session
        .send_notification(methods::INITIALIZED, Some(serde_json::json!({})))
        .await?;
    tracker.advance(HandshakeState::Ready);

    tracing::info!(
        "MCP handshake complete with {} v{}",
        result.server_info.name,
        result.server_info.version
    );
    Ok(result)
}

/// What a server answers `initialize` with.
#[derive(Debug, Clone, Default)]
pub struct ServerReply {
    pub info: Implementation,
    pub capabilities: ServerCapabilities,
    pub instructions: Option<String>,
}

/// Run the server side: answer every request with an internal error until an
/// `initialize` arrives, run `hook` on it, then reply.
///
/// A hook error is sent to the client as an internal error and aborts setup.
pub async fn respond<F>(
    requests: &mut mpsc::UnboundedReceiver<IncomingRequest<ClientRequest>>,
    tracker: &HandshakeTracker,
    reply: ServerReply,
    hook: F,
) -> Result<InitializeParams, McpError>
where
    F: FnOnce(&InitializeParams) -> Result<(), String>,
{
    tracker.advance(HandshakeState::AwaitingInitialize);
    loop {
        let Some(incoming) = requests.recv().await else {
            tracker.advance(HandshakeState::Failed);
            return Err(McpError::ConnectionClosed);
        };

        let params = match incoming.request {
            ClientRequest::Initialize(params) => params,
            other => {
                let err = McpError::UnexpectedRequest {
                    method: other.method().to_string(),
                };
                tracing::warn!("{err}");
                incoming
                    .responder
                    .respond_err(ErrorObject::internal_error(err.to_string()));
                continue;
            }
        };

        if let Err(reason) = hook(&params) {
            tracing::warn!("Initialize rejected: {reason}");
            incoming
                .responder
                .respond_err(ErrorObject::internal_error(reason.clone()));
            tracker.advance(HandshakeState::Failed);
            return Err(McpError::InitializeRejected(reason));
        }

        if params.protocol_version != PROTOCOL_VERSION {
            tracing::warn!(
                "Client requested protocol {}, answering with {PROTOCOL_VERSION}",
                params.protocol_version
            );
        }
        incoming.responder.respond_ok(&InitializeResult {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: reply.capabilities,
            server_info: reply.info,
            instructions: reply.instructions,
            meta: None,
        });
        tracker.advance(HandshakeState::Ready);
        tracing::info!(
            "MCP handshake complete with {} v{}",
            params.client_info.name,
            params.client_info.version
        );
        return Ok(params);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::connection::{ServerConnection, connection_span};
    use crate::test_support::{WAIT, session_pair};
    use conduit_types::ClientCapabilities;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn client_params() -> InitializeParams {
        InitializeParams {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: ClientCapabilities::default(),
            client_info: Implementation::new("test-client", "1.0"),
            meta: None,
        }
    }

    #[tokio::test]
    async fn initiate_acknowledges_matching_version() {
        let (session, _events, mut peer) = session_pair(ConnectionConfig::default());
        let tracker = Arc::new(HandshakeTracker::new(HandshakeState::Unconnected));

        let task = tokio::spawn({
            let tracker = Arc::clone(&tracker);
            async move { initiate(session.as_ref(), &tracker, client_params()).await }
        });

        let init = peer.expect("initialize").await;
        assert_eq!(init["params"]["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(init["params"]["clientInfo"]["name"], "test-client");
        peer.reply(
            &init,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "srv", "version": "0.1"}
            }),
        )
        .await;

        let ack = peer.expect("notifications/initialized").await;
        assert!(ack.get("id").is_none());
        let result = task.await.unwrap().unwrap();
        assert_eq!(result.server_info.name, "srv");
        assert_eq!(tracker.state(), HandshakeState::Ready);
        tracker.ensure_ready().unwrap();
    }

    #[tokio::test]
    async fn version_mismatch_fails_without_acknowledging() {
        let (session, _events, mut peer) = session_pair(ConnectionConfig::default());
        let tracker = Arc::new(HandshakeTracker::new(HandshakeState::Unconnected));

        let task = tokio::spawn({
            let tracker = Arc::clone(&tracker);
            async move { initiate(session.as_ref(), &tracker, client_params()).await }
        });

        let init = peer.expect("initialize").await;
        peer.reply(
            &init,
            json!({
                "protocolVersion": "1999-01-01",
                "capabilities": {},
                "serverInfo": {"name": "old", "version": "0"}
            }),
        )
        .await;

        match task.await.unwrap() {
            Err(McpError::VersionMismatch { expected, received }) => {
                assert_eq!(expected, PROTOCOL_VERSION);
                assert_eq!(received, "1999-01-01");
            }
            other => panic!("expected VersionMismatch, got {other:?}"),
        }
        assert_eq!(tracker.state(), HandshakeState::Failed);
        assert!(matches!(tracker.ensure_ready(), Err(McpError::NotInitialized)));
        peer.assert_silent(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn wait_ready_resolves_on_failure() {
        let tracker = Arc::new(HandshakeTracker::new(HandshakeState::AwaitingInitialize));
        let waiter = tokio::spawn({
            let tracker = Arc::clone(&tracker);
            async move { tracker.wait_ready().await }
        });
        tracker.advance(HandshakeState::Failed);
        let result = tokio::time::timeout(WAIT, waiter).await.unwrap().unwrap();
        assert!(matches!(result, Err(McpError::NotInitialized)));
    }

    fn server_side() -> (ServerConnection, crate::test_support::Peer) {
        let config = ConnectionConfig::default();
        let (session, events, peer) = session_pair(config.clone());
        let connection = ServerConnection::new(session, events, config, connection_span("server"));
        (connection, peer)
    }

    #[tokio::test]
    async fn requests_before_initialize_are_rejected() {
        let (connection, mut peer) = server_side();
        let mut requests = connection.take_requests().unwrap();
        let tracker = Arc::new(HandshakeTracker::new(HandshakeState::Unconnected));

        let task = tokio::spawn({
            let tracker = Arc::clone(&tracker);
            async move {
                let result =
                    respond(&mut requests, &tracker, ServerReply::default(), |_| Ok(())).await;
                (result, requests)
            }
        });

        peer.send(json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}))
            .await;
        let reply = peer.recv().await;
        assert_eq!(reply["id"], 1);
        assert_eq!(reply["error"]["code"], ErrorObject::INTERNAL_ERROR);
        assert!(
            reply["error"]["message"]
                .as_str()
                .unwrap()
                .contains("before initialization")
        );
        assert_eq!(tracker.state(), HandshakeState::AwaitingInitialize);

        peer.send(json!({
            "jsonrpc": "2.0", "id": 2, "method": "initialize",
            "params": serde_json::to_value(client_params()).unwrap()
        }))
        .await;
        let reply = peer.recv().await;
        assert_eq!(reply["id"], 2);
        assert_eq!(reply["result"]["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(reply["result"]["serverInfo"]["name"], "conduit");

        let (result, _requests) = task.await.unwrap();
        assert_eq!(result.unwrap().client_info.name, "test-client");
        assert_eq!(tracker.state(), HandshakeState::Ready);
    }

    #[tokio::test]
    async fn hook_error_rejects_initialize() {
        let (connection, mut peer) = server_side();
        let mut requests = connection.take_requests().unwrap();
        let tracker = Arc::new(HandshakeTracker::new(HandshakeState::Unconnected));

        let task = tokio::spawn({
            let tracker = Arc::clone(&tracker);
            async move {
                respond(&mut requests, &tracker, ServerReply::default(), |params| {
                    Err(format!("client {} is not allowed", params.client_info.name))
                })
                .await
            }
        });

        peer.send(json!({
            "jsonrpc": "2.0", "id": 1, "method": "initialize",
            "params": serde_json::to_value(client_params()).unwrap()
        }))
        .await;
        let reply = peer.recv().await;
        assert_eq!(reply["error"]["code"], ErrorObject::INTERNAL_ERROR);
        assert_eq!(reply["error"]["message"], "client test-client is not allowed");

        match task.await.unwrap() {
            Err(McpError::InitializeRejected(reason)) => assert!(reason.contains("not allowed")),
            other => panic!("expected InitializeRejected, got {other:?}"),
        }
        assert_eq!(tracker.state(), HandshakeState::Failed);
    }
}

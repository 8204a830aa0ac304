//! MCP server: answers one client over one connection.
//!
//! The engine handles the handshake, `ping`, `logging/setLevel` and requests
//! for capabilities the server never declared. Everything else reaches the
//! application through [`McpServer::take_requests`].

use crate::config::ConnectionConfig;
use crate::connection::{IncomingRequest, ServerConnection, connection_span};
use crate::error::McpError;
use crate::fanout::Subscription;
use crate::handshake::{self, HandshakeState, HandshakeTracker, ServerReply};
use crate::registry::{CapabilityStatus, DeclaresLists, ListKind};
use crate::session::{JsonRpcSession, SessionEvent, WireSession};
use crate::transport::Transport;
use conduit_types::{
    ClientCapabilities, ClientNotification, ClientRequest, CreateMessageParams,
    CreateMessageResult, EmptyParams, ErrorObject, Implementation, InitializeParams,
    ListRootsResult, LoggingLevel, LoggingMessageParams, Message, ProgressParams, ProgressToken,
    Reference, ResourceUpdatedParams, Root, ServerCapabilities, methods,
};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tracing::Instrument;

/// How the server introduces itself.
#[derive(Debug, Clone, Default)]
pub struct ServerOptions {
    pub info: Implementation,
    pub capabilities: ServerCapabilities,
    pub instructions: Option<String>,
}

/// A ready server connection.
pub struct McpServer {
    connection: ServerConnection,
    handshake: HandshakeTracker,
    client: InitializeParams,
    capabilities: ServerCapabilities,
    requests: Mutex<Option<mpsc::UnboundedReceiver<IncomingRequest<ClientRequest>>>>,
    log_level: watch::Receiver<Option<LoggingLevel>>,
    owned_session: Option<Arc<JsonRpcSession>>,
}

impl McpServer {
    /// Accept a client over a byte transport, e.g. [`Transport::stdio`].
    ///
    /// `hook` sees the client's `initialize` before it is answered; an error
    /// rejects the client.
    pub async fn accept<F>(
        transport: Transport,
        options: ServerOptions,
        config: ConnectionConfig,
        hook: F,
    ) -> Result<Self, McpError>
    where
        F: FnOnce(&InitializeParams) -> Result<(), String>,
    {
        let span = connection_span("server");
        let (session, events) = span.in_scope(|| JsonRpcSession::start(transport, &config));
        let shared: Arc<dyn WireSession> = session.clone();
        let mut server = Self::establish(shared, events, options, config, span, hook).await?;
        server.owned_session = Some(session);
        Ok(server)
    }

    /// Accept a client over any [`WireSession`].
    pub async fn accept_with<F>(
        session: Arc<dyn WireSession>,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        options: ServerOptions,
        config: ConnectionConfig,
        hook: F,
    ) -> Result<Self, McpError>
    where
        F: FnOnce(&InitializeParams) -> Result<(), String>,
    {
        let span = connection_span("server");
        Self::establish(session, events, options, config, span, hook).await
    }

    async fn establish<F>(
        session: Arc<dyn WireSession>,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        options: ServerOptions,
        config: ConnectionConfig,
        span: tracing::Span,
        hook: F,
    ) -> Result<Self, McpError>
    where
        F: FnOnce(&InitializeParams) -> Result<(), String>,
    {
        let connection = ServerConnection::new(session, events, config, span.clone());
        let mut inbound = connection
            .take_requests()
            .ok_or_else(|| McpError::Protocol("request stream already taken".into()))?;
        let handshake = HandshakeTracker::new(HandshakeState::Unconnected);
        let reply = ServerReply {
            info: options.info,
            capabilities: options.capabilities.clone(),
            instructions: options.instructions,
        };

        let client = match handshake::respond(&mut inbound, &handshake, reply, hook).await {
            Ok(client) => client,
            Err(e) => {
                connection.close();
                return Err(e);
            }
        };

        let (level_tx, level_rx) = watch::channel(None);
        let (forward_tx, forward_rx) = mpsc::unbounded_channel();
        let router = RequestRouter {
            capabilities: options.capabilities.clone(),
            log_level: level_tx,
            forward: forward_tx,
        };
        tokio::spawn(router.run(inbound).instrument(span));

        connection.populate_in_background(client.capabilities.declared(&[ListKind::Roots]));

        Ok(Self {
            connection,
            handshake,
            client,
            capabilities: options.capabilities,
            requests: Mutex::new(Some(forward_rx)),
            log_level: level_rx,
            owned_session: None,
        })
    }

    fn gate(&self, declared: bool, capability: &str) -> Result<(), McpError> {
        self.handshake.ensure_ready()?;
        if declared {
            Ok(())
        } else {
            Err(McpError::unsupported(capability))
        }
    }

    // -- Accessors --

    pub fn client_info(&self) -> &Implementation {
        &self.client.client_info
    }

    pub fn client_capabilities(&self) -> &ClientCapabilities {
        &self.client.capabilities
    }

    pub fn handshake_state(&self) -> HandshakeState {
        self.handshake.state()
    }

    pub fn connection(&self) -> &ServerConnection {
        &self.connection
    }

    /// The minimum level the client asked for, if it set one.
    pub fn log_level(&self) -> Option<LoggingLevel> {
        *self.log_level.borrow()
    }

    /// The client's roots, refreshed on `notifications/roots/list_changed`.
    pub fn roots(&self) -> watch::Receiver<CapabilityStatus<Vec<Root>>> {
        self.connection.registry().roots.subscribe()
    }

    /// Client requests the application must answer. Must be drained: an
    /// unread request is never answered.
    pub fn take_requests(&self) -> Option<mpsc::UnboundedReceiver<IncomingRequest<ClientRequest>>> {
        self.requests.lock().ok()?.take()
    }

    pub fn take_notifications(&self) -> Option<Subscription<ClientNotification>> {
        self.connection.take_notifications()
    }

    /// Stop buffering the primary notification stream.
    pub fn discard_notifications(&self) {
        self.connection.discard_notifications();
    }

    pub fn subscribe_notifications(&self) -> Subscription<ClientNotification> {
        self.connection.subscribe_notifications()
    }

    // -- Requests to the client --

    pub async fn create_message(
        &self,
        params: &CreateMessageParams,
    ) -> Result<CreateMessageResult, McpError> {
        self.gate(self.client.capabilities.sampling.is_some(), "sampling")?;
        self.connection
            .request(methods::SAMPLING_CREATE_MESSAGE, params)
            .await
    }

    pub async fn list_roots(&self) -> Result<Vec<Root>, McpError> {
        self.gate(self.client.capabilities.roots.is_some(), "roots")?;
        let result: ListRootsResult = self
            .connection
            .request(methods::ROOTS_LIST, &EmptyParams::default())
            .await?;
        Ok(result.roots)
    }

    pub async fn ping(&self) -> Result<(), McpError> {
        self.handshake.ensure_ready()?;
        self.connection.ping().await
    }

    // -- Notifications to the client --

    pub async fn notify_tool_list_changed(&self) -> Result<(), McpError> {
        self.gate(self.capabilities.tools.is_some(), "tools")?;
        self.connection
            .notify(methods::TOOL_LIST_CHANGED, &EmptyParams::default())
            .await
    }

    pub async fn notify_prompt_list_changed(&self) -> Result<(), McpError> {
        self.gate(self.capabilities.prompts.is_some(), "prompts")?;
        self.connection
            .notify(methods::PROMPT_LIST_CHANGED, &EmptyParams::default())
            .await
    }

    pub async fn notify_resource_list_changed(&self) -> Result<(), McpError> {
        self.gate(self.capabilities.resources.is_some(), "resources")?;
        self.connection
            .notify(methods::RESOURCE_LIST_CHANGED, &EmptyParams::default())
            .await
    }

    pub async fn notify_resource_updated(&self, uri: &str) -> Result<(), McpError> {
        self.gate(self.capabilities.resources.is_some(), "resources")?;
        let params = ResourceUpdatedParams {
            uri: uri.to_string(),
            meta: None,
        };
        self.connection
            .notify(methods::RESOURCE_UPDATED, &params)
            .await
    }

    /// Report progress against a token the client attached to a request.
    pub async fn notify_progress(
        &self,
        token: ProgressToken,
        progress: f64,
        total: Option<f64>,
    ) -> Result<(), McpError> {
        self.handshake.ensure_ready()?;
        let params = ProgressParams {
            progress_token: token,
            progress,
            total,
            meta: None,
        };
        self.connection.notify(methods::PROGRESS, &params).await
    }

    /// Send a log message, unless it is below the level the client selected.
    pub async fn log(
        &self,
        level: LoggingLevel,
        logger: Option<&str>,
        data: Value,
    ) -> Result<(), McpError> {
        self.gate(self.capabilities.logging.is_some(), "logging")?;
        if self.log_level().is_some_and(|min| level < min) {
            return Ok(());
        }
        let params = LoggingMessageParams {
            level,
            logger: logger.map(str::to_string),
            data,
            meta: None,
        };
        self.connection
            .notify(methods::LOGGING_MESSAGE, &params)
            .await
    }

    /// Close the connection, flushing queued messages first.
    pub async fn close(&self) {
        match &self.owned_session {
            Some(session) => session.shutdown().await,
            None => self.connection.close(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.connection.is_closed()
    }
}

/// Requests the engine answers itself once the handshake is done.
struct RequestRouter {
    capabilities: ServerCapabilities,
    log_level: watch::Sender<Option<LoggingLevel>>,
    forward: mpsc::UnboundedSender<IncomingRequest<ClientRequest>>,
}

impl RequestRouter {
    async fn run(self, mut inbound: mpsc::UnboundedReceiver<IncomingRequest<ClientRequest>>) {
        while let Some(incoming) = inbound.recv().await {
            if let Some(incoming) = self.intercept(incoming) {
                if self.forward.send(incoming).is_err() {
                    tracing::debug!("Server dropped; no listener for client requests");
                }
            }
        }
    }

    /// Answer what the engine handles; hand back the rest.
    fn intercept(
        &self,
        incoming: IncomingRequest<ClientRequest>,
    ) -> Option<IncomingRequest<ClientRequest>> {
        if matches!(incoming.request, ClientRequest::Initialize(_)) {
            let err = McpError::AlreadyInitialized;
            tracing::warn!("Rejecting second initialize: {err}");
            incoming
                .responder
                .respond_err(ErrorObject::internal_error(err.to_string()));
            return None;
        }

        if let Some(capability) = self.undeclared(&incoming.request) {
            tracing::debug!(
                "Rejecting '{}': {capability} not declared",
                incoming.request.method()
            );
            incoming
                .responder
                .respond_err(ErrorObject::method_not_found(incoming.request.method()));
            return None;
        }

        if let ClientRequest::SetLogLevel(params) = &incoming.request {
            self.log_level.send_replace(Some(params.level));
            tracing::debug!("Client log level set to {}", params.level);
            incoming
                .responder
                .respond(Ok(Value::Object(Default::default())));
            return None;
        }

        Some(incoming)
    }

    /// The capability `request` needs, if this server did not declare it.
    fn undeclared(&self, request: &ClientRequest) -> Option<&'static str> {
        let caps = &self.capabilities;
        let (declared, name) = match request {
            ClientRequest::Initialize(_) => return None,
            ClientRequest::ListPrompts(_) | ClientRequest::GetPrompt(_) => {
                (caps.prompts.is_some(), "prompts")
            }
            ClientRequest::ListResources(_)
            | ClientRequest::ListResourceTemplates(_)
            | ClientRequest::ReadResource(_) => (caps.resources.is_some(), "resources"),
            ClientRequest::Subscribe(_) | ClientRequest::Unsubscribe(_) => {
                (caps.supports_resource_subscribe(), "resources.subscribe")
            }
            ClientRequest::ListTools(_) | ClientRequest::CallTool(_) => {
                (caps.tools.is_some(), "tools")
            }
            ClientRequest::Complete(params) => match params.reference {
                Reference::Prompt { .. } => (caps.prompts.is_some(), "prompts"),
                Reference::Resource { .. } => (caps.resources.is_some(), "resources"),
            },
            ClientRequest::SetLogLevel(_) => (caps.logging.is_some(), "logging"),
        };
        (!declared).then_some(name)
    }
}

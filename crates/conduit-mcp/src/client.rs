//! MCP client: one connection to one server.
//!
//! Connecting runs the handshake and fetches every list the server declared.
//! After that, every operation is checked against the server's declared
//! capabilities before anything is written to the wire.

use crate::config::ConnectionConfig;
use crate::connection::{ClientConnection, IncomingRequest, connection_span};
use crate::error::McpError;
use crate::fanout::Subscription;
use crate::handshake::{self, HandshakeState, HandshakeTracker};
use crate::pagination::list_all;
use crate::registry::{CapabilityStatus, DeclaresLists, ListKind};
use crate::session::{JsonRpcSession, SessionEvent, WireSession};
use crate::transport::Transport;
use conduit_types::{
    CallToolParams, CallToolResult, ClientCapabilities, CompleteParams, CompleteResult,
    CompletionArgument, EmptyParams, GetPromptParams, GetPromptResult, Implementation,
    InitializeParams, InitializeResult, ListPromptsResult, ListResourceTemplatesResult,
    ListResourcesResult, ListToolsResult, LoggingLevel, PROTOCOL_VERSION, PaginatedParams, Prompt,
    ReadResourceResult, Reference, Resource, ResourceTemplate, ResourceUriParams,
    ServerCapabilities, ServerNotification, ServerRequest, SetLevelParams, Tool, methods,
};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// How the client introduces itself.
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    pub info: Implementation,
    pub capabilities: ClientCapabilities,
}

/// A ready client connection.
pub struct McpClient {
    connection: ClientConnection,
    handshake: HandshakeTracker,
    init: InitializeResult,
    capabilities: ClientCapabilities,
    /// Set when the client owns its session and can flush it on close.
    owned_session: Option<Arc<JsonRpcSession>>,
}

impl McpClient {
    /// Connect over a byte transport, e.g. [`Transport::spawn`].
    pub async fn connect(
        transport: Transport,
        options: ClientOptions,
        config: ConnectionConfig,
    ) -> Result<Self, McpError> {
        let span = connection_span("client");
        let (session, events) = span.in_scope(|| JsonRpcSession::start(transport, &config));
        let shared: Arc<dyn WireSession> = session.clone();
        let mut client = Self::establish(shared, events, options, config, span).await?;
        client.owned_session = Some(session);
        Ok(client)
    }

    /// Connect over any [`WireSession`].
    pub async fn connect_with(
        session: Arc<dyn WireSession>,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        options: ClientOptions,
        config: ConnectionConfig,
    ) -> Result<Self, McpError> {
        Self::establish(session, events, options, config, connection_span("client")).await
    }

    async fn establish(
        session: Arc<dyn WireSession>,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        options: ClientOptions,
        config: ConnectionConfig,
        span: tracing::Span,
    ) -> Result<Self, McpError> {
        let connection = ClientConnection::new(session, events, config, span);
        let handshake = HandshakeTracker::new(HandshakeState::Unconnected);
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: options.capabilities.clone(),
            client_info: options.info,
            meta: None,
        };

        let init =
            match handshake::initiate(connection.session().as_ref(), &handshake, params).await {
                Ok(init) => init,
                Err(e) => {
                    connection.close();
                    return Err(e);
                }
            };

        let lists = init.capabilities.declared(&ListKind::SERVER_LISTS);
        if let Err(e) = connection.populate(lists).await {
            tracing::warn!("Initial capability fetch failed: {e}");
            connection.close();
            return Err(e);
        }

        Ok(Self {
            connection,
            handshake,
            init,
            capabilities: options.capabilities,
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

    fn server_caps(&self) -> &ServerCapabilities {
        &self.init.capabilities
    }

    // -- Accessors --

    pub fn server_info(&self) -> &Implementation {
        &self.init.server_info
    }

    pub fn server_capabilities(&self) -> &ServerCapabilities {
        &self.init.capabilities
    }

    pub fn instructions(&self) -> Option<&str> {
        self.init.instructions.as_deref()
    }

    pub fn protocol_version(&self) -> &str {
        &self.init.protocol_version
    }

    pub fn handshake_state(&self) -> HandshakeState {
        self.handshake.state()
    }

    pub fn connection(&self) -> &ClientConnection {
        &self.connection
    }

    // -- Observables --

    pub fn tools(&self) -> watch::Receiver<CapabilityStatus<Vec<Tool>>> {
        self.connection.registry().tools.subscribe()
    }

    pub fn prompts(&self) -> watch::Receiver<CapabilityStatus<Vec<Prompt>>> {
        self.connection.registry().prompts.subscribe()
    }

    pub fn resources(&self) -> watch::Receiver<CapabilityStatus<Vec<Resource>>> {
        self.connection.registry().resources.subscribe()
    }

    pub fn resource_templates(&self) -> watch::Receiver<CapabilityStatus<Vec<ResourceTemplate>>> {
        self.connection.registry().resource_templates.subscribe()
    }

    /// Server-initiated requests (`sampling/createMessage`, `roots/list`).
    /// Must be drained: an unread request is never answered.
    pub fn take_requests(&self) -> Option<mpsc::UnboundedReceiver<IncomingRequest<ServerRequest>>> {
        self.connection.take_requests()
    }

    pub fn take_notifications(&self) -> Option<Subscription<ServerNotification>> {
        self.connection.take_notifications()
    }

    /// Stop buffering the primary notification stream.
    pub fn discard_notifications(&self) {
        self.connection.discard_notifications();
    }

    pub fn subscribe_notifications(&self) -> Subscription<ServerNotification> {
        self.connection.subscribe_notifications()
    }

    // -- Tools --

    pub async fn list_tools(&self) -> Result<Vec<Tool>, McpError> {
        self.gate(self.server_caps().tools.is_some(), "tools")?;
        list_all::<ListToolsResult>(
            self.connection.session().as_ref(),
            methods::TOOLS_LIST,
            &PaginatedParams::default(),
        )
        .await
    }

    /// Call a tool. A tool that fails reports it in-band through
    /// [`CallToolResult::is_error`], not as an `Err`.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Map<String, Value>>,
    ) -> Result<CallToolResult, McpError> {
        self.gate(self.server_caps().tools.is_some(), "tools")?;
        self.connection
            .request(methods::TOOLS_CALL, &CallToolParams::new(name, arguments))
            .await
    }

    pub async fn call_tool_with_progress<F>(
        &self,
        name: &str,
        arguments: Option<Map<String, Value>>,
        on_progress: F,
    ) -> Result<CallToolResult, McpError>
    where
        F: Fn(f64, Option<f64>) + Send + Sync + 'static,
    {
        self.gate(self.server_caps().tools.is_some(), "tools")?;
        let params = serde_json::to_value(CallToolParams::new(name, arguments))?;
        let raw = self
            .connection
            .request_with_progress(methods::TOOLS_CALL, Some(params), on_progress)
            .await?;
        Ok(serde_json::from_value(raw)?)
    }

    // -- Prompts --

    pub async fn list_prompts(&self) -> Result<Vec<Prompt>, McpError> {
        self.gate(self.server_caps().prompts.is_some(), "prompts")?;
        list_all::<ListPromptsResult>(
            self.connection.session().as_ref(),
            methods::PROMPTS_LIST,
            &PaginatedParams::default(),
        )
        .await
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<HashMap<String, String>>,
    ) -> Result<GetPromptResult, McpError> {
        self.gate(self.server_caps().prompts.is_some(), "prompts")?;
        let params = GetPromptParams {
            name: name.to_string(),
            arguments,
            meta: None,
        };
        self.connection.request(methods::PROMPTS_GET, &params).await
    }

    // -- Resources --

    pub async fn list_resources(&self) -> Result<Vec<Resource>, McpError> {
        self.gate(self.server_caps().resources.is_some(), "resources")?;
        list_all::<ListResourcesResult>(
            self.connection.session().as_ref(),
            methods::RESOURCES_LIST,
            &PaginatedParams::default(),
        )
        .await
    }

    pub async fn list_resource_templates(&self) -> Result<Vec<ResourceTemplate>, McpError> {
        self.gate(self.server_caps().resources.is_some(), "resources")?;
        list_all::<ListResourceTemplatesResult>(
            self.connection.session().as_ref(),
            methods::RESOURCES_TEMPLATES_LIST,
            &PaginatedParams::default(),
        )
        .await
    }

    pub async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult, McpError> {
        self.gate(self.server_caps().resources.is_some(), "resources")?;
        self.connection
            .request(methods::RESOURCES_READ, &ResourceUriParams::new(uri))
            .await
    }

    /// Ask for `notifications/resources/updated` about `uri`.
    pub async fn subscribe_resource(&self, uri: &str) -> Result<(), McpError> {
        self.gate(
            self.server_caps().supports_resource_subscribe(),
            "resources.subscribe",
        )?;
        self.connection
            .request_value(
                methods::RESOURCES_SUBSCRIBE,
                Some(serde_json::to_value(ResourceUriParams::new(uri))?),
            )
            .await?;
        Ok(())
    }

    pub async fn unsubscribe_resource(&self, uri: &str) -> Result<(), McpError> {
        self.gate(
            self.server_caps().supports_resource_subscribe(),
            "resources.subscribe",
        )?;
        self.connection
            .request_value(
                methods::RESOURCES_UNSUBSCRIBE,
                Some(serde_json::to_value(ResourceUriParams::new(uri))?),
            )
            .await?;
        Ok(())
    }

    // -- Completion, logging --

    /// Complete a prompt argument or a resource template variable. Gated on
    /// the capability the reference points into.
    pub async fn complete(
        &self,
        reference: Reference,
        argument: CompletionArgument,
    ) -> Result<CompleteResult, McpError> {
        match &reference {
            Reference::Prompt { .. } => {
                self.gate(self.server_caps().prompts.is_some(), "prompts")?
            }
            Reference::Resource { .. } => {
                self.gate(self.server_caps().resources.is_some(), "resources")?
            }
        }
        let params = CompleteParams {
            reference,
            argument,
            meta: None,
        };
        self.connection
            .request(methods::COMPLETION_COMPLETE, &params)
            .await
    }

    pub async fn set_log_level(&self, level: LoggingLevel) -> Result<(), McpError> {
        self.gate(self.server_caps().logging.is_some(), "logging")?;
        let params = SetLevelParams { level, meta: None };
        self.connection
            .request_value(
                methods::LOGGING_SET_LEVEL,
                Some(serde_json::to_value(params)?),
            )
            .await?;
        Ok(())
    }

    // -- Misc --

    pub async fn ping(&self) -> Result<(), McpError> {
        self.handshake.ensure_ready()?;
        self.connection.ping().await
    }

    /// Tell the server our roots changed. Requires `roots.listChanged` in our
    /// own capabilities.
    pub async fn notify_roots_list_changed(&self) -> Result<(), McpError> {
        self.gate(
            self.capabilities.supports_roots_list_changed(),
            "roots.listChanged",
        )?;
        self.connection
            .notify(methods::ROOTS_LIST_CHANGED, &EmptyParams::default())
            .await
    }

    /// Send any request with a progress callback attached.
    pub async fn request_with_progress<F>(
        &self,
        method: &str,
        params: Option<Value>,
        on_progress: F,
    ) -> Result<Value, McpError>
    where
        F: Fn(f64, Option<f64>) + Send + Sync + 'static,
    {
        self.handshake.ensure_ready()?;
        self.connection
            .request_with_progress(method, params, on_progress)
            .await
    }

    /// Close the connection. Queued messages are flushed and a spawned server
    /// process is reaped.
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

//! Protocol connection: typed routing on top of a [`WireSession`].
//!
//! One task per connection owns the progress table and the capability caches.
//! Handles talk to it over a control channel. Session events are always drained before
//! control messages, so a progress notification that arrived ahead of a
//! response is dispatched before the caller's token is retired.

use crate::config::ConnectionConfig;
use crate::error::McpError;
use crate::fanout::{Fanout, Subscription};
use crate::progress::{ProgressHandler, ProgressRouter};
use crate::registry::{CapabilityRegistry, ListKind, ListUpdate, fetch};
use crate::session::{Responder, SessionEvent, WireSession};
use conduit_types::{
    ClientNotification, ClientRequest, ErrorObject, Message, ProgressParams, ProgressToken,
    RequestId, ServerNotification, ServerRequest, attach_progress_token, methods, progress_token,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{Instrument, Span};

/// Connection held by a client: receives server requests and notifications.
pub type ClientConnection = Connection<ServerRequest, ServerNotification>;

/// Connection held by a server: receives client requests and notifications.
pub type ServerConnection = Connection<ClientRequest, ClientNotification>;

/// The span every task of one connection runs in.
pub fn connection_span(role: &'static str) -> Span {
    tracing::info_span!("mcp_connection", role)
}

/// A decoded inbound request and the means to answer it.
#[derive(Debug)]
pub struct IncomingRequest<R> {
    pub id: RequestId,
    pub request: R,
    /// `_meta.progressToken` of the request, if the peer asked for progress.
    pub progress_token: Option<ProgressToken>,
    pub responder: Responder,
}

/// Notification unions the connection task needs to look inside.
pub trait PeerNotification: Message + Clone + fmt::Debug {
    fn progress(&self) -> Option<&ProgressParams>;

    /// Cached lists this notification invalidates.
    fn refreshes(&self) -> &'static [ListKind];
}

impl PeerNotification for ServerNotification {
    fn progress(&self) -> Option<&ProgressParams> {
        match self {
            Self::Progress(params) => Some(params),
            _ => None,
        }
    }

    fn refreshes(&self) -> &'static [ListKind] {
        match self {
            Self::ToolListChanged(_) => &[ListKind::Tools],
            Self::PromptListChanged(_) => &[ListKind::Prompts],
            Self::ResourceListChanged(_) => &[ListKind::Resources, ListKind::ResourceTemplates],
            _ => &[],
        }
    }
}

impl PeerNotification for ClientNotification {
    fn progress(&self) -> Option<&ProgressParams> {
        match self {
            Self::Progress(params) => Some(params),
            _ => None,
        }
    }

    fn refreshes(&self) -> &'static [ListKind] {
        match self {
            Self::RootsListChanged(_) => &[ListKind::Roots],
            _ => &[],
        }
    }
}

type Done = oneshot::Sender<Result<(), McpError>>;

enum Control {
    RegisterProgress {
        token: ProgressToken,
        handler: ProgressHandler,
        ack: oneshot::Sender<bool>,
    },
    RetireProgress(ProgressToken),
    Populate {
        lists: Vec<(ListKind, bool)>,
        done: Option<Done>,
    },
    Fetched {
        results: Vec<(ListKind, Result<ListUpdate, McpError>)>,
        done: Option<Done>,
    },
}

/// Send `ping` and wait at most `timeout` for the reply. On expiry the
/// session is closed, failing every pending call.
pub async fn ping(session: &dyn WireSession, timeout: Duration) -> Result<(), McpError> {
    let timeout_ms = match tokio::time::timeout(timeout, session.send_request(methods::PING, None)).await {
        Ok(Ok(_)) => return Ok(()),
        // The request timeout fired first.
        Ok(Err(McpError::Timeout { timeout_ms, .. })) => timeout_ms,
        Ok(Err(e)) => return Err(e),
        Err(_) => timeout.as_millis() as u64,
    };
    tracing::warn!("Ping timed out after {timeout_ms}ms, closing connection");
    session.close();
    Err(McpError::PingTimeout { timeout_ms })
}

/// Bidirectional typed router over a wire session.
///
/// `Req` and `Notif` are the unions this side receives. Dropping the
/// connection closes the session.
pub struct Connection<Req, Notif> {
    session: Arc<dyn WireSession>,
    control: mpsc::UnboundedSender<Control>,
    requests: Mutex<Option<mpsc::UnboundedReceiver<IncomingRequest<Req>>>>,
    fanout: Arc<Mutex<Fanout<Notif>>>,
    notifications: Mutex<Option<Subscription<Notif>>>,
    registry: Arc<CapabilityRegistry>,
    config: ConnectionConfig,
    span: Span,
}

impl<Req, Notif> Connection<Req, Notif>
where
    Req: Message,
    Notif: PeerNotification,
{
    /// Start routing `events`. The connection task begins consuming at once;
    /// events that arrive before anyone reads the streams are buffered.
    pub fn new(
        session: Arc<dyn WireSession>,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        config: ConnectionConfig,
        span: Span,
    ) -> Self {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let mut fanout = Fanout::new();
        let notifications = fanout.subscribe();
        let fanout = Arc::new(Mutex::new(fanout));
        let registry = Arc::new(CapabilityRegistry::new());

        let task = ConnectionTask {
            session: Arc::clone(&session),
            events,
            control: control_rx,
            control_tx: control_tx.clone(),
            requests: requests_tx,
            fanout: Arc::clone(&fanout),
            progress: ProgressRouter::new(),
            registry: Arc::clone(&registry),
            tracked: HashMap::new(),
            in_flight: HashSet::new(),
            stale: HashSet::new(),
        };
        tokio::spawn(
            task.run(config.keepalive_interval(), config.ping_timeout())
                .instrument(span.clone()),
        );

        Self {
            session,
            control: control_tx,
            requests: Mutex::new(Some(requests_rx)),
            fanout,
            notifications: Mutex::new(Some(notifications)),
            registry,
            config,
            span,
        }
    }

    pub fn session(&self) -> &Arc<dyn WireSession> {
        &self.session
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    /// The inbound request stream. Returns `Some` exactly once.
    ///
    /// Every request must be answered through its responder; a request that is
    /// never read is never answered.
    pub fn take_requests(&self) -> Option<mpsc::UnboundedReceiver<IncomingRequest<Req>>> {
        self.requests.lock().ok()?.take()
    }

    /// The primary notification stream, buffered from connection start.
    /// Returns `Some` exactly once.
    pub fn take_notifications(&self) -> Option<Subscription<Notif>> {
        self.notifications.lock().ok()?.take()
    }

    /// Drop the primary notification stream without reading it. A connection
    /// nobody reads from should call this, or the stream buffers every
    /// notification for the life of the connection.
    pub fn discard_notifications(&self) {
        let primary = match self.notifications.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(primary);
    }

    /// An additional, independent notification stream starting from now.
    pub fn subscribe_notifications(&self) -> Subscription<Notif> {
        match self.fanout.lock() {
            Ok(mut fanout) => fanout.subscribe(),
            Err(poisoned) => poisoned.into_inner().subscribe(),
        }
    }

    pub async fn request_value(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, McpError> {
        self.session.send_request(method, params).await
    }

    pub async fn request<P, R>(&self, method: &str, params: &P) -> Result<R, McpError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let raw = self
            .session
            .send_request(method, Some(serde_json::to_value(params)?))
            .await?;
        Ok(serde_json::from_value(raw)?)
    }

    pub async fn notify<P>(&self, method: &str, params: &P) -> Result<(), McpError>
    where
        P: Serialize + ?Sized,
    {
        self.session
            .send_notification(method, Some(serde_json::to_value(params)?))
            .await
    }

    /// Send a request carrying a fresh progress token. `on_progress` sees every
    /// progress notification for it until the call returns, however it returns.
    pub async fn request_with_progress<F>(
        &self,
        method: &str,
        params: Option<Value>,
        on_progress: F,
    ) -> Result<Value, McpError>
    where
        F: Fn(f64, Option<f64>) + Send + Sync + 'static,
    {
        let token = ProgressRouter::mint_token();
        let mut params = params.unwrap_or(Value::Null);
        if !attach_progress_token(&mut params, &token) {
            return Err(McpError::Protocol(format!(
                "params for '{method}' must be an object to carry a progress token"
            )));
        }

        let _guard = self.register_progress(token, Arc::new(on_progress)).await?;
        self.session.send_request(method, Some(params)).await
    }

    /// Route progress for `token` to `handler` until the guard is dropped.
    /// A token that is already registered is refused and left untouched.
    async fn register_progress(
        &self,
        token: ProgressToken,
        handler: ProgressHandler,
    ) -> Result<ProgressGuard, McpError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.control
            .send(Control::RegisterProgress {
                token: token.clone(),
                handler,
                ack: ack_tx,
            })
            .map_err(|_| McpError::ConnectionClosed)?;
        if !ack_rx.await.map_err(|_| McpError::ConnectionClosed)? {
            return Err(McpError::Protocol(format!(
                "progress token {token} already in use"
            )));
        }
        Ok(ProgressGuard {
            control: self.control.clone(),
            token,
        })
    }

    /// Ping the peer, bounded by `ping_timeout_ms`.
    pub async fn ping(&self) -> Result<(), McpError> {
        ping(self.session.as_ref(), self.config.ping_timeout()).await
    }

    /// Fetch the given lists and start tracking them. `bool` says whether the
    /// peer declared the capability. Resolves once every list is stored.
    pub async fn populate(&self, lists: Vec<(ListKind, bool)>) -> Result<(), McpError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.control
            .send(Control::Populate {
                lists,
                done: Some(done_tx),
            })
            .map_err(|_| McpError::ConnectionClosed)?;
        done_rx.await.map_err(|_| McpError::ConnectionClosed)?
    }

    /// Like [`populate`](Self::populate), without waiting for the result.
    pub fn populate_in_background(&self, lists: Vec<(ListKind, bool)>) {
        if self
            .control
            .send(Control::Populate { lists, done: None })
            .is_err()
        {
            tracing::debug!("Populate requested on a finished connection");
        }
    }

    pub fn close(&self) {
        self.session.close();
    }

    pub fn is_closed(&self) -> bool {
        self.session.is_closed()
    }
}

impl<Req, Notif> Drop for Connection<Req, Notif> {
    fn drop(&mut self) {
        self.session.close();
    }
}

struct ProgressGuard {
    control: mpsc::UnboundedSender<Control>,
    token: ProgressToken,
}

impl Drop for ProgressGuard {
    fn drop(&mut self) {
        let _ = self
            .control
            .send(Control::RetireProgress(self.token.clone()));
    }
}

struct ConnectionTask<Req, Notif> {
    session: Arc<dyn WireSession>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    control: mpsc::UnboundedReceiver<Control>,
    control_tx: mpsc::UnboundedSender<Control>,
    requests: mpsc::UnboundedSender<IncomingRequest<Req>>,
    fanout: Arc<Mutex<Fanout<Notif>>>,
    progress: ProgressRouter,
    registry: Arc<CapabilityRegistry>,
    /// Lists being tracked, with whether the peer declared them.
    tracked: HashMap<ListKind, bool>,
    in_flight: HashSet<ListKind>,
    /// Lists invalidated while a fetch was already running.
    stale: HashSet<ListKind>,
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

impl<Req, Notif> ConnectionTask<Req, Notif>
where
    Req: Message,
    Notif: PeerNotification,
{
    async fn run(mut self, keepalive: Option<Duration>, ping_timeout: Duration) {
        let mut keepalive = keepalive.map(|period| {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        let mut keepalive_ping: Option<JoinHandle<()>> = None;

        loop {
            tokio::select! {
                biased;
                event = self.events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
                Some(control) = self.control.recv() => self.handle_control(control),
                _ = tick(&mut keepalive) => {
                    if keepalive_ping.as_ref().is_some_and(|h| !h.is_finished()) {
                        continue;
                    }
                    let session = Arc::clone(&self.session);
                    keepalive_ping = Some(tokio::spawn(
                        async move {
                            if let Err(e) = ping(session.as_ref(), ping_timeout).await {
                                tracing::warn!("Keepalive ping failed: {e}");
                            }
                        }
                        .in_current_span(),
                    ));
                }
            }
        }

        if let Some(handle) = keepalive_ping {
            handle.abort();
        }
        tracing::debug!("MCP connection task finished");
    }

    fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Notification { method, params } => {
                match Notif::decode(&method, params) {
                    Ok(notification) => self.handle_notification(notification),
                    Err(e) => tracing::warn!("Dropping undecodable notification '{method}': {e}"),
                }
            }
            SessionEvent::Request {
                id,
                method,
                params,
                responder,
            } => self.handle_request(id, method, params, responder),
            SessionEvent::TransportError(e) => {
                tracing::warn!("MCP connection closed: {e}");
            }
        }
    }

    fn handle_notification(&mut self, notification: Notif) {
        if let Some(params) = notification.progress() {
            self.progress.dispatch(params);
        }
        for &kind in notification.refreshes() {
            self.refresh(kind);
        }
        match self.fanout.lock() {
            Ok(mut fanout) => fanout.publish(notification),
            Err(poisoned) => poisoned.into_inner().publish(notification),
        }
    }

    fn handle_request(
        &mut self,
        id: RequestId,
        method: String,
        params: Option<Value>,
        responder: Responder,
    ) {
        if method == methods::PING {
            responder.respond(Ok(Value::Object(Default::default())));
            return;
        }

        let progress_token = progress_token(params.as_ref());
        match Req::decode(&method, params) {
            Ok(request) => {
                let incoming = IncomingRequest {
                    id,
                    request,
                    progress_token,
                    responder,
                };
                if self.requests.send(incoming).is_err() {
                    tracing::debug!("No listener for request '{method}'");
                }
            }
            Err(e) => {
                tracing::debug!("Rejecting request '{method}': {e}");
                responder.respond_err(ErrorObject::from(&e));
            }
        }
    }

    fn handle_control(&mut self, control: Control) {
        match control {
            Control::RegisterProgress { token, handler, ack } => {
                let _ = ack.send(self.progress.register(token, handler));
            }
            Control::RetireProgress(token) => {
                self.progress.retire(&token);
            }
            Control::Populate { lists, done } => {
                for &(kind, declared) in &lists {
                    self.tracked.insert(kind, declared);
                    self.in_flight.insert(kind);
                }
                self.spawn_fetch(lists, done);
            }
            Control::Fetched { results, done } => self.store(results, done),
        }
    }

    /// Re-fetch one list after a list-changed notification.
    fn refresh(&mut self, kind: ListKind) {
        let Some(&declared) = self.tracked.get(&kind) else {
            tracing::debug!("Ignoring {kind} change for an untracked list");
            return;
        };
        if !self.in_flight.insert(kind) {
            self.stale.insert(kind);
            return;
        }
        self.spawn_fetch(vec![(kind, declared)], None);
    }

    fn spawn_fetch(&self, lists: Vec<(ListKind, bool)>, done: Option<Done>) {
        let session = Arc::clone(&self.session);
        let control = self.control_tx.clone();
        tokio::spawn(
            async move {
                let mut results = Vec::with_capacity(lists.len());
                for (kind, declared) in lists {
                    results.push((kind, fetch(session.as_ref(), kind, declared).await));
                }
                let _ = control.send(Control::Fetched { results, done });
            }
            .in_current_span(),
        );
    }

    fn store(&mut self, results: Vec<(ListKind, Result<ListUpdate, McpError>)>, done: Option<Done>) {
        let mut first_error = None;
        for (kind, result) in results {
            self.in_flight.remove(&kind);
            match result {
                Ok(update) => {
                    if self.registry.apply(update) {
                        tracing::debug!("Cached {kind} list updated");
                    }
                }
                Err(e) => {
                    tracing::warn!("Failed to fetch {kind}: {e}");
                    first_error.get_or_insert(e);
                }
            }
            if self.stale.remove(&kind) {
                self.refresh(kind);
            }
        }
        if let Some(done) = done {
            let _ = done.send(first_error.map_or(Ok(()), Err));
        }
    }
}

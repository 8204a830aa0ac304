//! Per-capability cached lists, exposed as deduplicated watch channels.

use crate::error::McpError;
use crate::pagination::list_all;
use crate::session::WireSession;
use conduit_types::{
    ClientCapabilities, ListPromptsResult, ListResourceTemplatesResult, ListResourcesResult,
    ListRootsResult, ListToolsResult, PaginatedParams, Prompt, Resource, ResourceTemplate, Root,
    ServerCapabilities, Tool, methods,
};
use std::fmt;
use tokio::sync::watch;

/// Whether the peer supports a listable capability, and if so its current list.
#[derive(Debug, Clone, PartialEq)]
pub enum CapabilityStatus<T> {
    Supported(T),
    NotSupported,
}

impl<T> CapabilityStatus<T> {
    pub fn is_supported(&self) -> bool {
        matches!(self, Self::Supported(_))
    }

    pub fn supported(&self) -> Option<&T> {
        match self {
            Self::Supported(value) => Some(value),
            Self::NotSupported => None,
        }
    }

    pub fn into_supported(self) -> Option<T> {
        match self {
            Self::Supported(value) => Some(value),
            Self::NotSupported => None,
        }
    }
}

/// The lists a peer can advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListKind {
    Tools,
    Prompts,
    Resources,
    ResourceTemplates,
    Roots,
}

impl ListKind {
    /// Lists a client tracks on the server.
    pub const SERVER_LISTS: [ListKind; 4] = [
        ListKind::Tools,
        ListKind::Prompts,
        ListKind::Resources,
        ListKind::ResourceTemplates,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Tools => "tools",
            Self::Prompts => "prompts",
            Self::Resources => "resources",
            Self::ResourceTemplates => "resource templates",
            Self::Roots => "roots",
        }
    }

    pub fn method(self) -> &'static str {
        match self {
            Self::Tools => methods::TOOLS_LIST,
            Self::Prompts => methods::PROMPTS_LIST,
            Self::Resources => methods::RESOURCES_LIST,
            Self::ResourceTemplates => methods::RESOURCES_TEMPLATES_LIST,
            Self::Roots => methods::ROOTS_LIST,
        }
    }
}

impl fmt::Display for ListKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Capability sets that say which lists the peer serves.
pub trait DeclaresLists {
    fn declares(&self, kind: ListKind) -> bool;

    /// Pair each kind with whether it was declared.
    fn declared(&self, kinds: &[ListKind]) -> Vec<(ListKind, bool)> {
        kinds.iter().map(|&k| (k, self.declares(k))).collect()
    }
}

impl DeclaresLists for ServerCapabilities {
    fn declares(&self, kind: ListKind) -> bool {
        match kind {
            ListKind::Tools => self.tools.is_some(),
            ListKind::Prompts => self.prompts.is_some(),
            ListKind::Resources | ListKind::ResourceTemplates => self.resources.is_some(),
            ListKind::Roots => false,
        }
    }
}

impl DeclaresLists for ClientCapabilities {
    fn declares(&self, kind: ListKind) -> bool {
        kind == ListKind::Roots && self.roots.is_some()
    }
}

/// One watch cell. Setting an equal value notifies nobody.
#[derive(Debug)]
pub struct StatusCell<T> {
    tx: watch::Sender<CapabilityStatus<Vec<T>>>,
}

impl<T: Clone + PartialEq> StatusCell<T> {
    fn new() -> Self {
        let (tx, _) = watch::channel(CapabilityStatus::NotSupported);
        Self { tx }
    }

    /// Returns whether the value changed.
    fn set(&self, status: CapabilityStatus<Vec<T>>) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<CapabilityStatus<Vec<T>>> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> CapabilityStatus<Vec<T>> {
        self.tx.borrow().clone()
    }
}

/// A freshly fetched status for one list.
#[derive(Debug, Clone, PartialEq)]
pub enum ListUpdate {
    Tools(CapabilityStatus<Vec<Tool>>),
    Prompts(CapabilityStatus<Vec<Prompt>>),
    Resources(CapabilityStatus<Vec<Resource>>),
    ResourceTemplates(CapabilityStatus<Vec<ResourceTemplate>>),
    Roots(CapabilityStatus<Vec<Root>>),
}

impl ListUpdate {
    fn not_supported(kind: ListKind) -> Self {
        match kind {
            ListKind::Tools => Self::Tools(CapabilityStatus::NotSupported),
            ListKind::Prompts => Self::Prompts(CapabilityStatus::NotSupported),
            ListKind::Resources => Self::Resources(CapabilityStatus::NotSupported),
            ListKind::ResourceTemplates => Self::ResourceTemplates(CapabilityStatus::NotSupported),
            ListKind::Roots => Self::Roots(CapabilityStatus::NotSupported),
        }
    }

    pub fn kind(&self) -> ListKind {
        match self {
            Self::Tools(_) => ListKind::Tools,
            Self::Prompts(_) => ListKind::Prompts,
            Self::Resources(_) => ListKind::Resources,
            Self::ResourceTemplates(_) => ListKind::ResourceTemplates,
            Self::Roots(_) => ListKind::Roots,
        }
    }
}

/// Fetch the full list for `kind`. Undeclared capabilities resolve to
/// `NotSupported` without touching the wire.
pub async fn fetch(
    session: &dyn WireSession,
    kind: ListKind,
    declared: bool,
) -> Result<ListUpdate, McpError> {
    if !declared {
        return Ok(ListUpdate::not_supported(kind));
    }
    let params = PaginatedParams::default();
    let method = kind.method();
    let update = match kind {
        ListKind::Tools => ListUpdate::Tools(CapabilityStatus::Supported(
            list_all::<ListToolsResult>(session, method, &params).await?,
        )),
        ListKind::Prompts => ListUpdate::Prompts(CapabilityStatus::Supported(
            list_all::<ListPromptsResult>(session, method, &params).await?,
        )),
        ListKind::Resources => ListUpdate::Resources(CapabilityStatus::Supported(
            list_all::<ListResourcesResult>(session, method, &params).await?,
        )),
        ListKind::ResourceTemplates => ListUpdate::ResourceTemplates(CapabilityStatus::Supported(
            list_all::<ListResourceTemplatesResult>(session, method, &params).await?,
        )),
        ListKind::Roots => {
            let raw = session.send_request(method, None).await?;
            let result: ListRootsResult = serde_json::from_value(raw)?;
            ListUpdate::Roots(CapabilityStatus::Supported(result.roots))
        }
    };
    Ok(update)
}

/// All cached lists of one connection.
///
/// Only the connection task writes; everyone else subscribes.
#[derive(Debug)]
pub struct CapabilityRegistry {
    pub tools: StatusCell<Tool>,
    pub prompts: StatusCell<Prompt>,
    pub resources: StatusCell<Resource>,
    pub resource_templates: StatusCell<ResourceTemplate>,
    pub roots: StatusCell<Root>,
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self {
            tools: StatusCell::new(),
            prompts: StatusCell::new(),
            resources: StatusCell::new(),
            resource_templates: StatusCell::new(),
            roots: StatusCell::new(),
        }
    }
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an update. Returns whether the observable value changed.
    pub(crate) fn apply(&self, update: ListUpdate) -> bool {
        match update {
            ListUpdate::Tools(status) => self.tools.set(status),
            ListUpdate::Prompts(status) => self.prompts.set(status),
            ListUpdate::Resources(status) => self.resources.set(status),
            ListUpdate::ResourceTemplates(status) => self.resource_templates.set(status),
            ListUpdate::Roots(status) => self.roots.set(status),
        }
    }
}

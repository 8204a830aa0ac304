//! The four direction-specific message unions and their method tables.
//!
//! Decoding is a closed match on the method name: every variant owns its
//! typed params, and an unrecognized method is a decode failure. `ping` is
//! absent from every union; the connection layer answers it.

use crate::completion::CompleteParams;
use crate::error::DecodeError;
use crate::initialize::InitializeParams;
use crate::logging::{LoggingMessageParams, SetLevelParams};
use crate::meta::EmptyParams;
use crate::notification::{CancelledParams, ProgressParams, ResourceUpdatedParams};
use crate::pagination::PaginatedParams;
use crate::prompt::GetPromptParams;
use crate::resource::ResourceUriParams;
use crate::sampling::CreateMessageParams;
use crate::tool::CallToolParams;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Method names on the wire.
pub mod methods {
    pub const PING: &str = "ping";
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "notifications/initialized";

    pub const PROMPTS_LIST: &str = "prompts/list";
    pub const PROMPTS_GET: &str = "prompts/get";
    pub const RESOURCES_LIST: &str = "resources/list";
    pub const RESOURCES_TEMPLATES_LIST: &str = "resources/templates/list";
    pub const RESOURCES_READ: &str = "resources/read";
    pub const RESOURCES_SUBSCRIBE: &str = "resources/subscribe";
    pub const RESOURCES_UNSUBSCRIBE: &str = "resources/unsubscribe";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
    pub const COMPLETION_COMPLETE: &str = "completion/complete";
    pub const LOGGING_SET_LEVEL: &str = "logging/setLevel";

    pub const SAMPLING_CREATE_MESSAGE: &str = "sampling/createMessage";
    pub const ROOTS_LIST: &str = "roots/list";

    pub const CANCELLED: &str = "notifications/cancelled";
    pub const PROGRESS: &str = "notifications/progress";
    pub const LOGGING_MESSAGE: &str = "notifications/message";
    pub const RESOURCE_UPDATED: &str = "notifications/resources/updated";
    pub const RESOURCE_LIST_CHANGED: &str = "notifications/resources/list_changed";
    pub const TOOL_LIST_CHANGED: &str = "notifications/tools/list_changed";
    pub const PROMPT_LIST_CHANGED: &str = "notifications/prompts/list_changed";
    pub const ROOTS_LIST_CHANGED: &str = "notifications/roots/list_changed";
}

/// A member of one of the typed message unions.
pub trait Message: Sized + Send + 'static {
    /// Decode `(method, params)` into the matching variant.
    fn decode(method: &str, params: Option<Value>) -> Result<Self, DecodeError>;

    /// The wire method name of this variant.
    fn method(&self) -> &'static str;

    /// The variant's params as JSON.
    fn params(&self) -> Result<Option<Value>, serde_json::Error>;
}

/// Missing or `null` params decode as an empty object so param types made
/// entirely of optional fields still parse.
fn parse<T: DeserializeOwned>(method: &str, params: Option<Value>) -> Result<T, DecodeError> {
    let params = match params {
        None | Some(Value::Null) => Value::Object(Default::default()),
        Some(value) => value,
    };
    serde_json::from_value(params).map_err(|source| DecodeError::InvalidParams {
        method: method.to_string(),
        source,
    })
}

fn encode<T: Serialize>(params: &T) -> Result<Option<Value>, serde_json::Error> {
    serde_json::to_value(params).map(Some)
}

fn unknown(method: &str) -> DecodeError {
    DecodeError::UnknownMethod {
        method: method.to_string(),
    }
}

/// Requests a server receives from a client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientRequest {
    Initialize(InitializeParams),
    ListPrompts(PaginatedParams),
    GetPrompt(GetPromptParams),
    ListResources(PaginatedParams),
    ListResourceTemplates(PaginatedParams),
    ReadResource(ResourceUriParams),
    Subscribe(ResourceUriParams),
    Unsubscribe(ResourceUriParams),
    ListTools(PaginatedParams),
    CallTool(CallToolParams),
    Complete(CompleteParams),
    SetLogLevel(SetLevelParams),
}

impl Message for ClientRequest {
    fn decode(method: &str, params: Option<Value>) -> Result<Self, DecodeError> {
        use methods::*;
        match method {
            INITIALIZE => parse(method, params).map(Self::Initialize),
            PROMPTS_LIST => parse(method, params).map(Self::ListPrompts),
            PROMPTS_GET => parse(method, params).map(Self::GetPrompt),
            RESOURCES_LIST => parse(method, params).map(Self::ListResources),
            RESOURCES_TEMPLATES_LIST => parse(method, params).map(Self::ListResourceTemplates),
            RESOURCES_READ => parse(method, params).map(Self::ReadResource),
            RESOURCES_SUBSCRIBE => parse(method, params).map(Self::Subscribe),
            RESOURCES_UNSUBSCRIBE => parse(method, params).map(Self::Unsubscribe),
            TOOLS_LIST => parse(method, params).map(Self::ListTools),
            TOOLS_CALL => parse(method, params).map(Self::CallTool),
            COMPLETION_COMPLETE => parse(method, params).map(Self::Complete),
            LOGGING_SET_LEVEL => parse(method, params).map(Self::SetLogLevel),
            _ => Err(unknown(method)),
        }
    }

    fn method(&self) -> &'static str {
        use methods::*;
        match self {
            Self::Initialize(_) => INITIALIZE,
            Self::ListPrompts(_) => PROMPTS_LIST,
            Self::GetPrompt(_) => PROMPTS_GET,
            Self::ListResources(_) => RESOURCES_LIST,
            Self::ListResourceTemplates(_) => RESOURCES_TEMPLATES_LIST,
            Self::ReadResource(_) => RESOURCES_READ,
            Self::Subscribe(_) => RESOURCES_SUBSCRIBE,
            Self::Unsubscribe(_) => RESOURCES_UNSUBSCRIBE,
            Self::ListTools(_) => TOOLS_LIST,
            Self::CallTool(_) => TOOLS_CALL,
            Self::Complete(_) => COMPLETION_COMPLETE,
            Self::SetLogLevel(_) => LOGGING_SET_LEVEL,
        }
    }

    fn params(&self) -> Result<Option<Value>, serde_json::Error> {
        match self {
            Self::Initialize(p) => encode(p),
            Self::ListPrompts(p)
            | Self::ListResources(p)
            | Self::ListResourceTemplates(p)
            | Self::ListTools(p) => encode(p),
            Self::GetPrompt(p) => encode(p),
            Self::ReadResource(p) | Self::Subscribe(p) | Self::Unsubscribe(p) => encode(p),
            Self::CallTool(p) => encode(p),
            Self::Complete(p) => encode(p),
            Self::SetLogLevel(p) => encode(p),
        }
    }
}

/// Notifications a server receives from a client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientNotification {
    Cancelled(CancelledParams),
    Progress(ProgressParams),
    Initialized(EmptyParams),
    RootsListChanged(EmptyParams),
}

impl Message for ClientNotification {
    fn decode(method: &str, params: Option<Value>) -> Result<Self, DecodeError> {
        use methods::*;
        match method {
            CANCELLED => parse(method, params).map(Self::Cancelled),
            PROGRESS => parse(method, params).map(Self::Progress),
            INITIALIZED => parse(method, params).map(Self::Initialized),
            ROOTS_LIST_CHANGED => parse(method, params).map(Self::RootsListChanged),
            _ => Err(unknown(method)),
        }
    }

    fn method(&self) -> &'static str {
        use methods::*;
        match self {
            Self::Cancelled(_) => CANCELLED,
            Self::Progress(_) => PROGRESS,
            Self::Initialized(_) => INITIALIZED,
            Self::RootsListChanged(_) => ROOTS_LIST_CHANGED,
        }
    }

    fn params(&self) -> Result<Option<Value>, serde_json::Error> {
        match self {
            Self::Cancelled(p) => encode(p),
            Self::Progress(p) => encode(p),
            Self::Initialized(p) | Self::RootsListChanged(p) => encode(p),
        }
    }
}

/// Requests a client receives from a server.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerRequest {
    CreateMessage(CreateMessageParams),
    ListRoots(EmptyParams),
}

impl Message for ServerRequest {
    fn decode(method: &str, params: Option<Value>) -> Result<Self, DecodeError> {
        use methods::*;
        match method {
            SAMPLING_CREATE_MESSAGE => parse(method, params).map(Self::CreateMessage),
            ROOTS_LIST => parse(method, params).map(Self::ListRoots),
            _ => Err(unknown(method)),
        }
    }

    fn method(&self) -> &'static str {
        match self {
            Self::CreateMessage(_) => methods::SAMPLING_CREATE_MESSAGE,
            Self::ListRoots(_) => methods::ROOTS_LIST,
        }
    }

    fn params(&self) -> Result<Option<Value>, serde_json::Error> {
        match self {
            Self::CreateMessage(p) => encode(p),
            Self::ListRoots(p) => encode(p),
        }
    }
}

/// Notifications a client receives from a server.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerNotification {
    Cancelled(CancelledParams),
    Progress(ProgressParams),
    LoggingMessage(LoggingMessageParams),
    ResourceUpdated(ResourceUpdatedParams),
    ResourceListChanged(EmptyParams),
    ToolListChanged(EmptyParams),
    PromptListChanged(EmptyParams),
}

impl Message for ServerNotification {
    fn decode(method: &str, params: Option<Value>) -> Result<Self, DecodeError> {
        use methods::*;
        match method {
            CANCELLED => parse(method, params).map(Self::Cancelled),
            PROGRESS => parse(method, params).map(Self::Progress),
            LOGGING_MESSAGE => parse(method, params).map(Self::LoggingMessage),
            RESOURCE_UPDATED => parse(method, params).map(Self::ResourceUpdated),
            RESOURCE_LIST_CHANGED => parse(method, params).map(Self::ResourceListChanged),
            TOOL_LIST_CHANGED => parse(method, params).map(Self::ToolListChanged),
            PROMPT_LIST_CHANGED => parse(method, params).map(Self::PromptListChanged),
            _ => Err(unknown(method)),
        }
    }

    fn method(&self) -> &'static str {
        use methods::*;
        match self {
            Self::Cancelled(_) => CANCELLED,
            Self::Progress(_) => PROGRESS,
            Self::LoggingMessage(_) => LOGGING_MESSAGE,
            Self::ResourceUpdated(_) => RESOURCE_UPDATED,
            Self::ResourceListChanged(_) => RESOURCE_LIST_CHANGED,
            Self::ToolListChanged(_) => TOOL_LIST_CHANGED,
            Self::PromptListChanged(_) => PROMPT_LIST_CHANGED,
        }
    }

    fn params(&self) -> Result<Option<Value>, serde_json::Error> {
        match self {
            Self::Cancelled(p) => encode(p),
            Self::Progress(p) => encode(p),
            Self::LoggingMessage(p) => encode(p),
            Self::ResourceUpdated(p) => encode(p),
            Self::ResourceListChanged(p) | Self::ToolListChanged(p) | Self::PromptListChanged(p) => {
                encode(p)
            }
        }
    }
}

//! Wire data model for the Model Context Protocol: JSON-RPC envelopes,
//! capability descriptors, entity types and the typed message unions.

pub mod capabilities;
pub mod completion;
pub mod content;
pub mod error;
pub mod initialize;
pub mod jsonrpc;
pub mod logging;
pub mod message;
pub mod meta;
pub mod notification;
pub mod pagination;
pub mod prompt;
pub mod resource;
pub mod roots;
pub mod sampling;
pub mod tool;

pub use capabilities::*;
pub use completion::*;
pub use content::*;
pub use error::DecodeError;
pub use initialize::*;
pub use jsonrpc::*;
pub use logging::*;
pub use message::{
    ClientNotification, ClientRequest, Message, ServerNotification, ServerRequest, methods,
};
pub use meta::*;
pub use notification::*;
pub use pagination::*;
pub use prompt::*;
pub use resource::*;
pub use roots::*;
pub use sampling::*;
pub use tool::*;

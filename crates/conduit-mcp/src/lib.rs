//! Model Context Protocol engine.
//!
//! Frames JSON-RPC messages off a byte stream, correlates requests with
//! responses, runs the `initialize` handshake, tracks the peer's declared
//! capabilities and routes progress notifications. [`McpClient`] and
//! [`McpServer`] are the two ends built on top.

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod fanout;
pub mod framer;
pub mod handshake;
pub mod manager;
pub mod pagination;
pub mod progress;
pub mod registry;
pub mod server;
pub mod session;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use client::{ClientOptions, McpClient};
pub use config::{ConduitConfig, ConnectionConfig, ServerCommand};
pub use connection::{ClientConnection, Connection, IncomingRequest, ServerConnection};
pub use error::McpError;
pub use fanout::{Fanout, Subscription};
pub use framer::{JsonFramer, JsonObjectCodec};
pub use handshake::HandshakeState;
pub use manager::McpManager;
pub use registry::{CapabilityStatus, ListKind};
pub use server::{McpServer, ServerOptions};
pub use session::{JsonRpcSession, Responder, SessionEvent, WireSession};
pub use transport::Transport;

pub use conduit_types as types;

//! Error type for the protocol engine.

use conduit_types::{DecodeError, ErrorObject};
use serde_json::Value;
use thiserror::Error;

/// Errors from MCP connections.
#[derive(Debug, Error)]
pub enum McpError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Stream ended inside an unterminated JSON object ({pending_bytes} bytes pending)")]
    Truncated { pending_bytes: usize },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Protocol version mismatch: expected '{expected}', peer answered '{received}'")]
    VersionMismatch { expected: String, received: String },

    #[error("Unexpected request before initialization: {method}")]
    UnexpectedRequest { method: String },

    #[error("Connection is already initialized")]
    AlreadyInitialized,

    #[error("Initialize rejected: {0}")]
    InitializeRejected(String),

    #[error("Connection is not initialized")]
    NotInitialized,

    #[error("MCP protocol error: {0}")]
    Protocol(String),

    #[error("Capability not supported by peer: {capability}")]
    CapabilityNotSupported { capability: String },

    #[error("JSON-RPC error (code {code}): {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    #[error("Request '{method}' timed out after {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u64 },

    #[error("Ping timed out after {timeout_ms}ms")]
    PingTimeout { timeout_ms: u64 },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to spawn MCP server '{command}': {source}")]
    SpawnFailed {
        command: String,
        source: std::io::Error,
    },
}

impl McpError {
    pub(crate) fn unsupported(capability: &str) -> Self {
        Self::CapabilityNotSupported {
            capability: capability.to_string(),
        }
    }

    /// Whether the connection is unusable after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::Transport(_)
                | Self::ConnectionClosed
                | Self::Truncated { .. }
                | Self::PingTimeout { .. }
        )
    }
}

impl From<ErrorObject> for McpError {
    fn from(err: ErrorObject) -> Self {
        Self::Rpc {
            code: err.code,
            message: err.message,
            data: err.data,
        }
    }
}

//! Configuration for connections and spawned servers.

use crate::error::McpError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

fn default_request_timeout() -> u64 {
    30000
}

fn default_ping_timeout() -> u64 {
    10000
}

fn default_write_buffer() -> usize {
    64
}

/// Per-connection tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Bound on every outbound request in milliseconds (default: 30000).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    /// Bound on `ping` in milliseconds (default: 10000).
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_ms: u64,
    /// Ping the peer on this interval when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keepalive_interval_ms: Option<u64>,
    /// Capacity of the outbound writer queue (default: 64).
    #[serde(default = "default_write_buffer")]
    pub write_buffer: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout(),
            ping_timeout_ms: default_ping_timeout(),
            keepalive_interval_ms: None,
            write_buffer: default_write_buffer(),
        }
    }
}

impl ConnectionConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn keepalive_interval(&self) -> Option<Duration> {
        self.keepalive_interval_ms.map(Duration::from_millis)
    }
}

/// How to launch a stdio MCP server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerCommand {
    /// Command to run (e.g., "npx", "python").
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variables to set for the server process.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl ServerCommand {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// Top-level configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConduitConfig {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub servers: HashMap<String, ServerCommand>,
}

impl ConduitConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, McpError> {
        let config: Self = toml::from_str(s).map_err(|e| McpError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, McpError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| McpError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&contents)
    }

    fn validate(&self) -> Result<(), McpError> {
        if self.connection.write_buffer == 0 {
            return Err(McpError::Config("write_buffer must be at least 1".into()));
        }
        if self.connection.request_timeout_ms == 0 || self.connection.ping_timeout_ms == 0 {
            return Err(McpError::Config("timeouts must be non-zero".into()));
        }
        if let Some((name, _)) = self.servers.iter().find(|(_, s)| s.command.trim().is_empty()) {
            return Err(McpError::Config(format!("server '{name}' has an empty command")));
        }
        Ok(())
    }
}

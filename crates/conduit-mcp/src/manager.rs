//! Connections to every server named in a [`ConduitConfig`].

use crate::client::{ClientOptions, McpClient};
use crate::config::ConduitConfig;
use crate::error::McpError;
use crate::transport::Transport;
use conduit_types::Tool;

/// A set of named client connections.
pub struct McpManager {
    clients: Vec<(String, McpClient)>,
}

impl McpManager {
    /// Spawn and connect every configured server, in name order.
    ///
    /// Servers that fail to start are logged and skipped; the manager holds
    /// whatever servers came up.
    pub async fn start(config: &ConduitConfig, options: &ClientOptions) -> Self {
        let mut names: Vec<&String> = config.servers.keys().collect();
        names.sort();

        let mut clients = Vec::new();
        for name in names {
            let command = &config.servers[name];
            match Self::connect_one(command, options, config).await {
                Ok(client) => {
                    tracing::info!(
                        "MCP server '{name}' started ({} v{})",
                        client.server_info().name,
                        client.server_info().version
                    );
                    clients.push((name.clone(), client));
                }
                Err(e) => tracing::warn!("Failed to start MCP server '{name}': {e}"),
            }
        }

        Self { clients }
    }

    async fn connect_one(
        command: &crate::config::ServerCommand,
        options: &ClientOptions,
        config: &ConduitConfig,
    ) -> Result<McpClient, McpError> {
        let transport = Transport::spawn(command)?;
        let client =
            McpClient::connect(transport, options.clone(), config.connection.clone()).await?;
        // Nothing here reads notifications; cached lists still refresh.
        client.discard_notifications();
        Ok(client)
    }

    pub fn get(&self, name: &str) -> Option<&McpClient> {
        self.clients
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, client)| client)
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Every cached tool of every server, with the server's name.
    pub fn tools(&self) -> Vec<(&str, Tool)> {
        let mut all = Vec::new();
        for (name, client) in &self.clients {
            if let Some(tools) = client.tools().borrow().supported() {
                all.extend(tools.iter().cloned().map(|t| (name.as_str(), t)));
            }
        }
        all
    }

    /// Server names with their cached tool counts.
    pub fn server_summary(&self) -> Vec<(&str, usize)> {
        self.clients
            .iter()
            .map(|(name, client)| {
                let count = client.tools().borrow().supported().map_or(0, Vec::len);
                (name.as_str(), count)
            })
            .collect()
    }

    /// Close every connection and reap the server processes.
    pub async fn shutdown(self) {
        for (name, client) in &self.clients {
            tracing::debug!("Shutting down MCP server '{name}'");
            client.close().await;
        }
    }
}

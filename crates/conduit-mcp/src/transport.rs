//! Byte transports: a duplex pair of async streams, optionally owned by a
//! child process.

use crate::config::ServerCommand;
use crate::error::McpError;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Raw byte channel to a peer. Framing is applied by the session.
pub struct Transport {
    pub(crate) reader: BoxedReader,
    pub(crate) writer: BoxedWriter,
    pub(crate) child: Option<Child>,
}

impl Transport {
    /// Wrap any async byte pair, e.g. the halves of `tokio::io::duplex`.
    pub fn from_streams<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            child: None,
        }
    }

    /// This process's stdin/stdout, for a server launched by its client.
    pub fn stdio() -> Self {
        Self::from_streams(tokio::io::stdin(), tokio::io::stdout())
    }

    /// Spawn a server process and talk to it over its stdin/stdout.
    ///
    /// stderr is discarded and the child is killed if the transport is dropped.
    pub fn spawn(command: &ServerCommand) -> Result<Self, McpError> {
        let mut cmd = Command::new(&command.command);
        cmd.args(&command.args)
            .envs(&command.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
            command: command.command.clone(),
            source: e,
        })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(McpError::Transport(
                "child process has no piped stdio".to_string(),
            ));
        };

        tracing::debug!("Spawned MCP server '{}'", command.command);
        Ok(Self {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            child: Some(child),
        })
    }

    pub fn has_child(&self) -> bool {
        self.child.is_some()
    }
}

/// Wait for a child to exit after its stdin closed, killing it if it lingers.
pub(crate) async fn reap_child(mut child: Child, grace: Duration) {
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => tracing::debug!("MCP server exited: {status}"),
        Ok(Err(e)) => tracing::warn!("Failed to wait for MCP server: {e}"),
        Err(_) => {
            tracing::warn!("MCP server did not exit within {grace:?}, killing");
            let _ = child.kill().await;
        }
    }
}

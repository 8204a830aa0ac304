//! In-memory peer used by the unit tests.

use crate::config::ConnectionConfig;
use crate::framer::JsonObjectCodec;
use crate::session::{JsonRpcSession, SessionEvent};
use crate::transport::Transport;
use futures_util::StreamExt;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;

pub(crate) const WAIT: Duration = Duration::from_secs(5);

/// The far end of a session, speaking raw JSON lines.
pub(crate) struct Peer {
    frames: FramedRead<DuplexStream, JsonObjectCodec>,
    writer: DuplexStream,
}

impl Peer {
    pub(crate) async fn recv(&mut self) -> Value {
        let frame = tokio::time::timeout(WAIT, self.frames.next())
            .await
            .expect("peer timed out waiting for a message")
            .expect("stream ended")
            .unwrap();
        serde_json::from_slice(&frame).unwrap()
    }

    /// Receive and check the method.
    pub(crate) async fn expect(&mut self, method: &str) -> Value {
        let msg = self.recv().await;
        assert_eq!(msg["method"], method, "unexpected message: {msg}");
        msg
    }

    pub(crate) async fn send(&mut self, value: Value) {
        let mut line = serde_json::to_vec(&value).unwrap();
        line.push(b'\n');
        self.writer.write_all(&line).await.unwrap();
    }

    pub(crate) async fn reply(&mut self, request: &Value, result: Value) {
        self.send(json!({"jsonrpc": "2.0", "id": request["id"], "result": result}))
            .await;
    }

    pub(crate) async fn notify(&mut self, method: &str, params: Value) {
        self.send(json!({"jsonrpc": "2.0", "method": method, "params": params}))
            .await;
    }

    /// Nothing arrives within `window`.
    pub(crate) async fn assert_silent(&mut self, window: Duration) {
        if let Ok(Some(frame)) = tokio::time::timeout(window, self.frames.next()).await {
            panic!("expected silence, got {:?}", frame.map(|f| f.to_vec()));
        }
    }
}

pub(crate) fn session_pair(
    config: ConnectionConfig,
) -> (
    Arc<JsonRpcSession>,
    mpsc::UnboundedReceiver<SessionEvent>,
    Peer,
) {
    let (our_write, their_read) = tokio::io::duplex(4096);
    let (their_write, our_read) = tokio::io::duplex(4096);
    let (session, events) =
        JsonRpcSession::start(Transport::from_streams(our_read, our_write), &config);
    let peer = Peer {
        frames: FramedRead::new(their_read, JsonObjectCodec::new()),
        writer: their_write,
    };
    (session, events, peer)
}

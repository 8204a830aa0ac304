//! Scripted MCP peer speaking raw JSON lines over an in-memory pipe.

#![allow(dead_code)]

use conduit_mcp::types::PROTOCOL_VERSION;
use conduit_mcp::{JsonObjectCodec, Transport};
use futures_util::StreamExt;
use serde_json::{Value, json};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio_util::codec::FramedRead;

pub const WAIT: Duration = Duration::from_secs(5);

pub struct ScriptedPeer {
    frames: FramedRead<DuplexStream, JsonObjectCodec>,
    writer: DuplexStream,
}

/// A transport for the engine and the peer on its other end.
pub fn pipe() -> (Transport, ScriptedPeer) {
    let (engine_write, peer_read) = tokio::io::duplex(64 * 1024);
    let (peer_write, engine_read) = tokio::io::duplex(64 * 1024);
    let peer = ScriptedPeer {
        frames: FramedRead::new(peer_read, JsonObjectCodec::new()),
        writer: peer_write,
    };
    (Transport::from_streams(engine_read, engine_write), peer)
}

impl ScriptedPeer {
    pub async fn recv(&mut self) -> Value {
        let frame = tokio::time::timeout(WAIT, self.frames.next())
            .await
            .expect("timed out waiting for a message")
            .expect("stream ended")
            .expect("framing error");
        serde_json::from_slice(&frame).expect("invalid JSON from engine")
    }

    pub async fn expect(&mut self, method: &str) -> Value {
        let msg = self.recv().await;
        assert_eq!(msg["method"], method, "unexpected message: {msg}");
        msg
    }

    pub async fn send(&mut self, value: Value) {
        let mut line = serde_json::to_vec(&value).unwrap();
        line.push(b'\n');
        self.writer.write_all(&line).await.unwrap();
    }

    /// Send raw bytes, for framing tests.
    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
    }

    pub async fn reply(&mut self, request: &Value, result: Value) {
        self.send(json!({"jsonrpc": "2.0", "id": request["id"], "result": result}))
            .await;
    }

    pub async fn reply_error(&mut self, request: &Value, code: i64, message: &str) {
        self.send(json!({
            "jsonrpc": "2.0",
            "id": request["id"],
            "error": {"code": code, "message": message}
        }))
        .await;
    }

    pub async fn notify(&mut self, method: &str, params: Value) {
        self.send(json!({"jsonrpc": "2.0", "method": method, "params": params}))
            .await;
    }

    /// Nothing arrives within `window`. A closed stream counts as silence.
    pub async fn assert_silent(&mut self, window: Duration) {
        if let Ok(Some(frame)) = tokio::time::timeout(window, self.frames.next()).await {
            panic!("expected silence, got {frame:?}");
        }
    }

    /// Play the server side of the handshake with `capabilities`.
    pub async fn accept_initialize(&mut self, capabilities: Value) -> Value {
        let init = self.expect("initialize").await;
        self.reply(
            &init,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": capabilities,
                "serverInfo": {"name": "scripted-server", "version": "1.0"}
            }),
        )
        .await;
        self.expect("notifications/initialized").await;
        init
    }

    /// Answer the next `method` request with an empty list under `key`.
    pub async fn answer_empty_list(&mut self, method: &str, key: &str) {
        let request = self.expect(method).await;
        let mut body = serde_json::Map::new();
        body.insert(key.to_string(), json!([]));
        self.reply(&request, Value::Object(body)).await;
    }

    /// Play the client side of the handshake.
    pub async fn initialize(&mut self, capabilities: Value) -> Value {
        self.send(json!({
            "jsonrpc": "2.0", "id": "init", "method": "initialize",
            "params": {
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": capabilities,
                "clientInfo": {"name": "scripted-client", "version": "1.0"}
            }
        }))
        .await;
        let reply = self.recv().await;
        if reply.get("result").is_some() {
            self.notify("notifications/initialized", json!({})).await;
        }
        reply
    }
}

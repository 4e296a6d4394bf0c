//! In-memory tool server for tests.
//!
//! [`FakeServer`] speaks the same newline-delimited JSON-RPC as a real child
//! over `tokio::io::duplex` streams. It answers `initialize`, `tools/list`
//! and `tools/call`, records every frame the client sends, and lets a test
//! inject child-originated requests and notifications.

use crate::client::ProtocolClient;
use crate::handler::InboundHandlers;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, duplex};
use tokio::sync::mpsc;

const PIPE_CAPACITY: usize = 64 * 1024;
const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
enum Reply {
    Result(Value),
    Error(i64, String),
}

/// Scripted tool server.
#[derive(Debug, Clone, Default)]
pub struct FakeServer {
    tools: Vec<Value>,
    replies: HashMap<String, Reply>,
    delays: HashMap<String, Duration>,
    handshake_delay: Option<Duration>,
    fail_handshake: bool,
    fail_tools_list: bool,
}

/// The client-side ends of a fake server's pipes.
pub struct FakeStreams {
    pub reader: DuplexStream,
    pub writer: DuplexStream,
}

impl FakeServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Announce a tool in `tools/list`.
    pub fn with_tool(mut self, name: &str, description: &str) -> Self {
        self.tools.push(json!({
            "name": name,
            "description": description,
            "inputSchema": {"type": "object", "properties": {}}
        }));
        self
    }

    /// Answer `tools/call` for `tool` with a fixed result.
    pub fn with_result(mut self, tool: &str, result: Value) -> Self {
        self.replies.insert(tool.to_string(), Reply::Result(result));
        self
    }

    /// Answer `tools/call` for `tool` with a JSON-RPC error.
    pub fn with_error(mut self, tool: &str, code: i64, message: &str) -> Self {
        self.replies
            .insert(tool.to_string(), Reply::Error(code, message.to_string()));
        self
    }

    /// Hold back the reply for `tool` by `delay`.
    pub fn with_delay(mut self, tool: &str, delay: Duration) -> Self {
        self.delays.insert(tool.to_string(), delay);
        self
    }

    /// Hold back the `initialize` reply by `delay`.
    pub fn with_handshake_delay(mut self, delay: Duration) -> Self {
        self.handshake_delay = Some(delay);
        self
    }

    pub fn failing_handshake(mut self) -> Self {
        self.fail_handshake = true;
        self
    }

    pub fn failing_tools_list(mut self) -> Self {
        self.fail_tools_list = true;
        self
    }

    /// Start serving; returns the streams a client should attach to.
    pub fn spawn(self) -> (FakeStreams, FakeServerHandle) {
        let (client_read, server_write) = duplex(PIPE_CAPACITY);
        let (server_read, client_write) = duplex(PIPE_CAPACITY);

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (received_tx, received_rx) = mpsc::unbounded_channel();
        let (responses_tx, responses_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut writer = server_write;
            while let Some(line) = out_rx.recv().await {
                if writer.write_all(line.as_bytes()).await.is_err()
                    || writer.write_all(b"\n").await.is_err()
                {
                    break;
                }
            }
        });

        let replies_tx = out_tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(server_read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let Ok(frame) = serde_json::from_str::<Value>(&line) else {
                    continue;
                };
                let _ = received_tx.send(frame.clone());

                let id = frame.get("id").cloned();
                let method = frame
                    .get("method")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                match (method.as_deref(), id) {
                    (Some(method), Some(id)) => {
                        let (reply, delay) = self.reply_to(method, frame.get("params"));
                        let line = match reply {
                            Reply::Result(result) => {
                                json!({"jsonrpc": "2.0", "id": id, "result": result})
                            }
                            Reply::Error(code, message) => json!({
                                "jsonrpc": "2.0",
                                "id": id,
                                "error": {"code": code, "message": message}
                            }),
                        }
                        .to_string();
                        match delay {
                            Some(delay) => {
                                let tx = replies_tx.clone();
                                tokio::spawn(async move {
                                    tokio::time::sleep(delay).await;
                                    let _ = tx.send(line);
                                });
                            }
                            None => {
                                let _ = replies_tx.send(line);
                            }
                        }
                    }
                    (None, Some(_)) => {
                        let _ = responses_tx.send(frame);
                    }
                    _ => {}
                }
            }
        });

        (
            FakeStreams {
                reader: client_read,
                writer: client_write,
            },
            FakeServerHandle {
                outbound: out_tx,
                received: received_rx,
                responses: responses_rx,
            },
        )
    }

    /// Spawn and attach a [`ProtocolClient`] in one step.
    pub fn attach(
        self,
        name: &str,
        handlers: InboundHandlers,
    ) -> (ProtocolClient, FakeServerHandle) {
        let (streams, handle) = self.spawn();
        let client = ProtocolClient::attach(name, streams.reader, streams.writer, handlers);
        (client, handle)
    }

    fn reply_to(&self, method: &str, params: Option<&Value>) -> (Reply, Option<Duration>) {
        match method {
            "initialize" if self.fail_handshake => {
                (Reply::Error(-32600, "handshake refused".into()), None)
            }
            "initialize" => (
                Reply::Result(json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": "fake-server", "version": "0.0.0"}
                })),
                self.handshake_delay,
            ),
            "tools/list" if self.fail_tools_list => {
                (Reply::Error(-32603, "catalog unavailable".into()), None)
            }
            "tools/list" => (Reply::Result(json!({"tools": self.tools})), None),
            "tools/call" => {
                let name = params
                    .and_then(|p| p.get("name"))
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let arguments = params
                    .and_then(|p| p.get("arguments"))
                    .cloned()
                    .unwrap_or(Value::Null);
                let reply = self.replies.get(name).cloned().unwrap_or_else(|| {
                    Reply::Result(json!({
                        "content": [{"type": "text", "text": format!("{name} ok")}],
                        "isError": false,
                        "echo": {"name": name, "arguments": arguments}
                    }))
                });
                (reply, self.delays.get(name).copied())
            }
            other => (
                Reply::Error(-32601, format!("Method not found: {other}")),
                None,
            ),
        }
    }
}

/// Test-side control of a running [`FakeServer`].
pub struct FakeServerHandle {
    outbound: mpsc::UnboundedSender<String>,
    received: mpsc::UnboundedReceiver<Value>,
    responses: mpsc::UnboundedReceiver<Value>,
}

impl FakeServerHandle {
    /// Write a raw line to the client, newline appended.
    pub fn send_raw(&self, line: &str) {
        let _ = self.outbound.send(line.to_string());
    }

    /// Issue a child-originated request.
    pub fn send_request(&self, id: &str, method: &str, params: Value) {
        self.send_raw(
            &json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params}).to_string(),
        );
    }

    pub fn send_notification(&self, method: &str, params: Value) {
        self.send_raw(&json!({"jsonrpc": "2.0", "method": method, "params": params}).to_string());
    }

    /// Next response the client sent to one of our requests.
    pub async fn next_response(&mut self) -> Option<Value> {
        tokio::time::timeout(WAIT, self.responses.recv())
            .await
            .ok()
            .flatten()
    }

    /// Every frame the client has sent that was not yet consumed.
    pub fn drain_received(&mut self) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.received.try_recv() {
            frames.push(frame);
        }
        frames
    }

    /// Next frame the client sent with the given method, skipping others.
    pub async fn next_request(&mut self, method: &str) -> Option<Value> {
        let wait = async {
            while let Some(frame) = self.received.recv().await {
                if frame.get("method").and_then(Value::as_str) == Some(method) {
                    return Some(frame);
                }
            }
            None
        };
        tokio::time::timeout(WAIT, wait).await.ok().flatten()
    }
}

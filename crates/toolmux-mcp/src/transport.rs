//! Duplex transport for tool server communication.
//!
//! Runs a writer task that serializes every outbound frame onto the child's
//! stdin and a reader task that frames the child's stdout, correlates
//! responses with pending calls, answers child-originated requests and
//! applies catalog notifications.

use crate::config::ServerConfig;
use crate::error::McpError;
use crate::framing::LineFramer;
use crate::handler::InboundHandlers;
use crate::jsonrpc::{
    JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, METHOD_NOT_FOUND,
    Message, RequestId,
};
use crate::tool::{ToolSet, parse_tool_list};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const READ_CHUNK: usize = 8192;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

type CallResult = Result<serde_json::Value, McpError>;

/// Outstanding calls, keyed by the id they were sent with.
#[derive(Default)]
struct PendingCalls {
    calls: HashMap<RequestId, oneshot::Sender<CallResult>>,
    closed: bool,
}

/// Everything needed to put frames on the wire, shared by the transport and
/// its reader task.
struct Outbound {
    name: String,
    next_id: AtomicU64,
    write_tx: mpsc::Sender<String>,
    pending: Mutex<PendingCalls>,
    open: AtomicBool,
}

impl Outbound {
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Option<Duration>,
    ) -> CallResult {
        let id = RequestId::from(self.next_id.fetch_add(1, Ordering::Relaxed));
        let serialized = serde_json::to_string(&JsonRpcRequest::new(id.clone(), method, params))?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            if pending.closed {
                return Err(self.not_running());
            }
            pending.calls.insert(id.clone(), tx);
        }

        tracing::debug!("-> {} {method} (id {id})", self.name);
        if self.write_tx.send(serialized).await.is_err() {
            self.pending.lock().await.calls.remove(&id);
            return Err(self.not_running());
        }

        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.pending.lock().await.calls.remove(&id);
                    tracing::warn!("{} {method} timed out", self.name);
                    return Err(McpError::Timeout {
                        name: self.name.clone(),
                        timeout_ms: limit.as_millis() as u64,
                    });
                }
            },
            None => rx.await,
        };

        outcome.unwrap_or_else(|_| {
            Err(McpError::ProcessExited {
                name: self.name.clone(),
            })
        })
    }

    async fn notify(&self, method: &str, params: Option<serde_json::Value>) -> Result<(), McpError> {
        let serialized = serde_json::to_string(&JsonRpcNotification::new(method, params))?;
        self.write_tx
            .send(serialized)
            .await
            .map_err(|_| self.not_running())
    }

    async fn respond(&self, response: JsonRpcResponse) {
        match serde_json::to_string(&response) {
            Ok(serialized) => {
                if self.write_tx.send(serialized).await.is_err() {
                    tracing::debug!(
                        "Dropping response {} for '{}': writer closed",
                        response.id,
                        self.name
                    );
                }
            }
            Err(e) => tracing::warn!("Failed to serialize response for '{}': {e}", self.name),
        }
    }

    async fn complete(&self, id: RequestId, outcome: Result<serde_json::Value, JsonRpcError>) {
        let tx = self.pending.lock().await.calls.remove(&id);
        match tx {
            Some(tx) => {
                let result = outcome.map_err(|err| McpError::JsonRpc {
                    server: self.name.clone(),
                    code: err.code,
                    message: err.message,
                });
                let _ = tx.send(result);
            }
            None => tracing::warn!("Response from '{}' for unknown id {id}", self.name),
        }
    }

    /// Mark the stream dead and fail every outstanding call.
    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        let drained: Vec<_> = {
            let mut pending = self.pending.lock().await;
            pending.closed = true;
            pending.calls.drain().collect()
        };
        if !drained.is_empty() {
            tracing::warn!(
                "Tool server '{}' closed with {} pending call(s)",
                self.name,
                drained.len()
            );
        }
        for (_, tx) in drained {
            let _ = tx.send(Err(McpError::ProcessExited {
                name: self.name.clone(),
            }));
        }
    }

    fn not_running(&self) -> McpError {
        McpError::NotRunning {
            name: self.name.clone(),
        }
    }
}

/// State the reader task routes frames into.
struct Router {
    outbound: Arc<Outbound>,
    handlers: InboundHandlers,
    tools: ToolSet,
    refresh_timeout: Duration,
}

impl Router {
    async fn dispatch(&self, message: Message) {
        match message {
            Message::Response { id, outcome } => self.outbound.complete(id, outcome).await,
            Message::Request { id, method, params } => self.answer(id, method, params),
            Message::Notification { method, params } => self.notification(&method, params),
        }
    }

    /// Answer a child-originated request on its own task so a slow handler
    /// never stalls the read loop.
    fn answer(&self, id: RequestId, method: String, params: Option<serde_json::Value>) {
        tracing::debug!("<- {} inbound {method} (id {id})", self.outbound.name);
        let handler = self.handlers.for_method(&method).cloned();
        let outbound = Arc::clone(&self.outbound);
        tokio::spawn(async move {
            let response = match handler {
                Some(handler) => {
                    match handler.handle(params.unwrap_or(serde_json::Value::Null)).await {
                        Ok(result) => JsonRpcResponse::success(id, result),
                        Err(err) => JsonRpcResponse::failure(id, err.into()),
                    }
                }
                None => JsonRpcResponse::failure(
                    id,
                    JsonRpcError::new(METHOD_NOT_FOUND, format!("Method not found: {method}")),
                ),
            };
            outbound.respond(response).await;
        });
    }

    fn notification(&self, method: &str, params: Option<serde_json::Value>) {
        match method {
            "tools/list" => match params.map(parse_tool_list) {
                Some(Ok(tools)) => {
                    tracing::info!(
                        "Tool server '{}' announced {} tools",
                        self.outbound.name,
                        tools.len()
                    );
                    self.tools.replace(tools);
                }
                Some(Err(e)) => tracing::warn!("Ignoring tools/list notification: {e}"),
                None => tracing::warn!("Ignoring tools/list notification without params"),
            },
            "notifications/tools/list_changed" => {
                let outbound = Arc::clone(&self.outbound);
                let tools = self.tools.clone();
                let timeout = self.refresh_timeout;
                tokio::spawn(async move {
                    match outbound.request("tools/list", None, Some(timeout)).await {
                        Ok(result) => match parse_tool_list(result) {
                            Ok(list) => tools.replace(list),
                            Err(e) => tracing::warn!("Catalog refresh failed: {e}"),
                        },
                        Err(e) => tracing::warn!("Catalog refresh failed: {e}"),
                    }
                });
            }
            other => tracing::debug!(
                "Ignoring notification '{other}' from '{}'",
                self.outbound.name
            ),
        }
    }
}

async fn read_loop<R>(reader: R, router: Router)
where
    R: AsyncRead + Unpin,
{
    let mut reader = reader;
    let mut framer = LineFramer::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::warn!("Read from '{}' failed: {e}", router.outbound.name);
                break;
            }
        };
        for frame in framer.push(&chunk[..n]) {
            match Message::parse(&frame) {
                Ok(message) => router.dispatch(message).await,
                Err(e) => tracing::warn!(
                    "Dropping frame from '{}': {e}: {}",
                    router.outbound.name,
                    String::from_utf8_lossy(&frame)
                ),
            }
        }
    }
    if !framer.pending().is_empty() {
        tracing::debug!(
            "Discarding {} trailing bytes from '{}'",
            framer.pending().len(),
            router.outbound.name
        );
    }
    router.outbound.close().await;
}

/// Async duplex transport to one tool server.
pub(crate) struct Transport {
    outbound: Arc<Outbound>,
    stop_writer: CancellationToken,
    reader_handle: JoinHandle<()>,
    writer_handle: JoinHandle<()>,
    child: Option<Arc<Mutex<Child>>>,
    pid: Option<u32>,
}

impl Transport {
    /// Run the transport over an arbitrary byte-stream pair.
    pub(crate) fn from_streams<R, W>(
        name: &str,
        reader: R,
        writer: W,
        handlers: InboundHandlers,
        tools: ToolSet,
        timeout_ms: u64,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (write_tx, mut write_rx) = mpsc::channel::<String>(64);
        let outbound = Arc::new(Outbound {
            name: name.to_string(),
            next_id: AtomicU64::new(1),
            write_tx,
            pending: Mutex::new(PendingCalls::default()),
            open: AtomicBool::new(true),
        });

        // Writer task: the only place bytes are written, one frame at a time
        let stop_writer = CancellationToken::new();
        let stop = stop_writer.clone();
        let writer_handle = tokio::spawn(async move {
            let mut writer = writer;
            loop {
                let msg = tokio::select! {
                    _ = stop.cancelled() => break,
                    msg = write_rx.recv() => match msg {
                        Some(msg) => msg,
                        None => break,
                    },
                };
                let mut frame = msg.into_bytes();
                frame.push(b'\n');
                if writer.write_all(&frame).await.is_err() {
                    break;
                }
                if writer.flush().await.is_err() {
                    break;
                }
            }
            let _ = writer.shutdown().await;
        });

        let router = Router {
            outbound: Arc::clone(&outbound),
            handlers,
            tools,
            refresh_timeout: Duration::from_millis(timeout_ms),
        };
        let reader_handle = tokio::spawn(read_loop(reader, router));

        Self {
            outbound,
            stop_writer,
            reader_handle,
            writer_handle,
            child: None,
            pid: None,
        }
    }

    /// Spawn a child process and attach to its standard streams.
    pub(crate) fn spawn(
        name: &str,
        config: &ServerConfig,
        handlers: InboundHandlers,
        tools: ToolSet,
    ) -> Result<Self, McpError> {
        let executable = config
            .resolve_executable()
            .ok_or_else(|| McpError::SpawnFailed {
                name: config.command.clone(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "executable not found",
                ),
            })?;

        let mut cmd = Command::new(&executable);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &config.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
            name: config.command.clone(),
            source: e,
        })?;

        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => return Err(McpError::Protocol("child stdio was not piped".to_string())),
        };

        // Child diagnostics go to the log, never to the protocol stream
        if let Some(stderr) = child.stderr.take() {
            let label = name.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(target: "toolmux_mcp::stderr", "[{label}] {line}");
                }
            });
        }

        let pid = child.id();
        tracing::info!(
            "Spawned tool server '{}' ({}, pid {:?})",
            name,
            executable.display(),
            pid
        );

        let mut transport =
            Self::from_streams(name, stdout, stdin, handlers, tools, config.timeout_ms);
        transport.child = Some(Arc::new(Mutex::new(child)));
        transport.pid = pid;
        Ok(transport)
    }

    /// Send a request and wait for the correlated response.
    pub(crate) async fn send_request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Option<Duration>,
    ) -> CallResult {
        self.outbound.request(method, params, timeout).await
    }

    /// Send a notification (fire-and-forget, no response expected).
    pub(crate) async fn send_notification(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        self.outbound.notify(method, params).await
    }

    pub(crate) fn is_open(&self) -> bool {
        self.outbound.open.load(Ordering::SeqCst)
    }

    pub(crate) fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Close stdin, give the child a grace period, then kill it. Outstanding
    /// calls fail with `ProcessExited`.
    pub(crate) async fn shutdown(&self) {
        self.stop_writer.cancel();

        if let Some(child) = &self.child {
            let graceful = tokio::time::timeout(SHUTDOWN_GRACE, async {
                let mut child = child.lock().await;
                let _ = child.wait().await;
            })
            .await;

            if graceful.is_err() {
                let mut child = child.lock().await;
                let _ = child.kill().await;
            }
        }

        self.reader_handle.abort();
        self.writer_handle.abort();
        self.outbound.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{DuplexStream, duplex};

    /// A transport wired to in-memory streams; returns the far ends.
    fn wired(handlers: InboundHandlers) -> (Transport, ToolSet, BufReader<DuplexStream>, DuplexStream) {
        let (client_read, server_write) = duplex(4096);
        let (server_read, client_write) = duplex(4096);
        let tools = ToolSet::default();
        let transport = Transport::from_streams(
            "test",
            client_read,
            client_write,
            handlers,
            tools.clone(),
            1000,
        );
        (transport, tools, BufReader::new(server_read), server_write)
    }

    async fn next_frame(reader: &mut BufReader<DuplexStream>) -> serde_json::Value {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        serde_json::from_str(&line).unwrap()
    }

    #[tokio::test]
    async fn request_response_roundtrip() {
        let (transport, _, mut from_client, mut to_client) = wired(InboundHandlers::new());
        let transport = Arc::new(transport);

        let caller = Arc::clone(&transport);
        let call =
            tokio::spawn(async move { caller.send_request("test/method", None, None).await });

        let frame = next_frame(&mut from_client).await;
        assert_eq!(frame["method"], "test/method");
        let reply = json!({"jsonrpc": "2.0", "id": frame["id"], "result": {"ok": true}});
        to_client
            .write_all(format!("{reply}\n").as_bytes())
            .await
            .unwrap();

        let result = call.await.unwrap().unwrap();
        assert_eq!(result["ok"], true);
    }

    #[tokio::test]
    async fn remote_error_is_surfaced() {
        let (transport, _, mut from_client, mut to_client) = wired(InboundHandlers::new());
        let transport = Arc::new(transport);

        let caller = Arc::clone(&transport);
        let call = tokio::spawn(async move { caller.send_request("boom", None, None).await });

        let frame = next_frame(&mut from_client).await;
        let reply = json!({
            "jsonrpc": "2.0",
            "id": frame["id"],
            "error": {"code": -32000, "message": "environment not found"}
        });
        to_client
            .write_all(format!("{reply}\n").as_bytes())
            .await
            .unwrap();

        match call.await.unwrap() {
            Err(McpError::JsonRpc { code, message, .. }) => {
                assert_eq!(code, -32000);
                assert_eq!(message, "environment not found");
            }
            other => panic!("Expected JsonRpc error, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn notification_does_not_block() {
        let (transport, _, mut from_client, _to_client) = wired(InboundHandlers::new());
        transport
            .send_notification("notifications/initialized", None)
            .await
            .unwrap();
        let frame = next_frame(&mut from_client).await;
        assert_eq!(frame["method"], "notifications/initialized");
        assert!(frame.get("id").is_none());
    }

    #[tokio::test]
    async fn timeout_fires_on_unresponsive_server() {
        let (transport, _, _from_client, _to_client) = wired(InboundHandlers::new());
        let result = transport
            .send_request("initialize", None, Some(Duration::from_millis(50)))
            .await;
        match result {
            Err(McpError::Timeout { timeout_ms, .. }) => assert_eq!(timeout_ms, 50),
            other => panic!("Expected Timeout, got: {other:?}"),
        }
        assert!(transport.outbound.pending.lock().await.calls.is_empty());
    }

    #[tokio::test]
    async fn stream_close_fails_pending_calls() {
        let (transport, _, mut from_client, to_client) = wired(InboundHandlers::new());
        let transport = Arc::new(transport);

        let caller = Arc::clone(&transport);
        let call = tokio::spawn(async move { caller.send_request("slow", None, None).await });
        let _ = next_frame(&mut from_client).await;
        drop(to_client);

        assert!(matches!(
            call.await.unwrap(),
            Err(McpError::ProcessExited { .. })
        ));
        assert!(!transport.is_open());
        assert!(matches!(
            transport.send_request("late", None, None).await,
            Err(McpError::NotRunning { .. })
        ));
    }

    #[tokio::test]
    async fn unknown_inbound_method_gets_method_not_found() {
        let (_transport, _, mut from_client, mut to_client) = wired(InboundHandlers::new());
        to_client
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":\"x1\",\"method\":\"sampling/createMessage\"}\n")
            .await
            .unwrap();
        let frame = next_frame(&mut from_client).await;
        assert_eq!(frame["id"], "x1");
        assert_eq!(frame["error"]["code"], METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn bad_frame_does_not_tear_down_stream() {
        let (transport, tools, _from_client, mut to_client) = wired(InboundHandlers::new());
        to_client
            .write_all(b"this is not json\n{\"jsonrpc\":\"2.0\",\"method\":\"tools/list\",\"params\":{\"tools\":[{\"name\":\"a\"}]}}\n")
            .await
            .unwrap();

        for _ in 0..50 {
            if !tools.snapshot().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(tools.snapshot().len(), 1);
        assert!(transport.is_open());
    }

    #[tokio::test]
    async fn shutdown_closes_stream_and_fails_pending() {
        let (transport, _, mut from_client, _to_client) = wired(InboundHandlers::new());
        let transport = Arc::new(transport);

        let caller = Arc::clone(&transport);
        let call = tokio::spawn(async move { caller.send_request("slow", None, None).await });
        let _ = next_frame(&mut from_client).await;

        transport.shutdown().await;
        assert!(matches!(
            call.await.unwrap(),
            Err(McpError::ProcessExited { .. })
        ));
        assert!(!transport.is_open());
    }
}

//! Protocol client: one tool server process.
//!
//! Handles process start, the capability handshake (initialize + initialized
//! notification), tool discovery (tools/list), and tool invocation
//! (tools/call). Child-originated requests are answered by the registered
//! [`InboundHandlers`].

use crate::config::{ServerConfig, default_timeout};
use crate::error::McpError;
use crate::handler::InboundHandlers;
use crate::tool::{ToolDefinition, ToolSet, parse_tool_list};
use crate::transport::Transport;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, RwLock};

/// Protocol version we announce.
const PROTOCOL_VERSION: &str = "2024-11-05";

/// Client for a single tool server.
pub struct ProtocolClient {
    name: String,
    /// Absent for clients attached to existing streams.
    config: Option<ServerConfig>,
    handlers: InboundHandlers,
    transport: RwLock<Option<Arc<Transport>>>,
    tools: ToolSet,
    initialized: AtomicBool,
    init_lock: Mutex<()>,
    timeout_ms: u64,
}

impl ProtocolClient {
    /// Create a client that launches `config` on [`start`](Self::start).
    pub fn new(name: impl Into<String>, config: ServerConfig, handlers: InboundHandlers) -> Self {
        let timeout_ms = config.timeout_ms;
        Self {
            name: name.into(),
            config: Some(config),
            handlers,
            transport: RwLock::new(None),
            tools: ToolSet::default(),
            initialized: AtomicBool::new(false),
            init_lock: Mutex::new(()),
            timeout_ms,
        }
    }

    /// Create a client bound to an already-running server's streams.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn attach<R, W>(
        name: impl Into<String>,
        reader: R,
        writer: W,
        handlers: InboundHandlers,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let name = name.into();
        let tools = ToolSet::default();
        let timeout_ms = default_timeout();
        let transport = Transport::from_streams(
            &name,
            reader,
            writer,
            handlers.clone(),
            tools.clone(),
            timeout_ms,
        );
        Self {
            name,
            config: None,
            handlers,
            transport: RwLock::new(Some(Arc::new(transport))),
            tools,
            initialized: AtomicBool::new(false),
            init_lock: Mutex::new(()),
            timeout_ms,
        }
    }

    /// Launch the child process. A no-op while it is already running.
    ///
    /// Starting again after the child exited launches a fresh process that
    /// must be initialized again.
    pub async fn start(&self) -> Result<(), McpError> {
        let mut slot = self.transport.write().await;
        if slot.as_ref().is_some_and(|t| t.is_open()) {
            return Ok(());
        }

        let config = self.config.as_ref().ok_or_else(|| McpError::NotRunning {
            name: self.name.clone(),
        })?;

        let transport = Transport::spawn(
            &self.name,
            config,
            self.handlers.clone(),
            self.tools.clone(),
        )?;
        self.initialized.store(false, Ordering::SeqCst);
        self.tools.replace(Vec::new());
        *slot = Some(Arc::new(transport));
        Ok(())
    }

    /// Perform the handshake and load the tool catalog. Idempotent.
    ///
    /// Handshake and listing failures are logged and leave the catalog
    /// empty; only a missing process is an error.
    pub async fn initialize(&self) -> Result<(), McpError> {
        let _guard = self.init_lock.lock().await;
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        let transport = self.live_transport().await?;
        let timeout = Some(Duration::from_millis(self.timeout_ms));

        let init_params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": self.handlers.capabilities(),
            "clientInfo": {
                "name": "toolmux",
                "version": env!("CARGO_PKG_VERSION")
            }
        });

        match transport
            .send_request("initialize", Some(init_params), timeout)
            .await
        {
            Ok(_) => {
                if let Err(e) = transport
                    .send_notification("notifications/initialized", None)
                    .await
                {
                    tracing::warn!("Failed to notify '{}' of initialization: {e}", self.name);
                }
            }
            Err(e) => tracing::warn!("Handshake with '{}' failed: {e}", self.name),
        }

        match transport.send_request("tools/list", None, timeout).await {
            Ok(result) => match parse_tool_list(result) {
                Ok(tools) => self.tools.replace(tools),
                Err(e) => tracing::warn!("Tool listing from '{}' unusable: {e}", self.name),
            },
            Err(e) => tracing::warn!("Tool listing from '{}' failed: {e}", self.name),
        }

        self.initialized.store(true, Ordering::SeqCst);
        tracing::info!(
            "Tool server '{}' initialized with {} tools",
            self.name,
            self.tools.snapshot().len()
        );
        Ok(())
    }

    /// Current tool catalog; empty before initialization.
    pub fn list_tools(&self) -> Vec<ToolDefinition> {
        self.tools.snapshot()
    }

    /// Call a tool and return the server's result verbatim.
    pub async fn call_tool(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, McpError> {
        let transport = self.live_transport().await?;
        let params = serde_json::json!({
            "name": tool_name,
            "arguments": arguments,
        });
        transport.send_request("tools/call", Some(params), None).await
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Launch configuration; `None` for attached clients.
    pub fn config(&self) -> Option<&ServerConfig> {
        self.config.as_ref()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub async fn is_running(&self) -> bool {
        self.transport
            .read()
            .await
            .as_ref()
            .is_some_and(|t| t.is_open())
    }

    /// OS process id of the child, when one was spawned.
    pub async fn pid(&self) -> Option<u32> {
        self.transport.read().await.as_ref().and_then(|t| t.pid())
    }

    /// Terminate the child and wait for it; pending calls fail with
    /// `ProcessExited`.
    pub async fn shutdown(&self) {
        let transport = self.transport.write().await.take();
        if let Some(transport) = transport {
            transport.shutdown().await;
            tracing::info!("Tool server '{}' shut down", self.name);
        }
        self.initialized.store(false, Ordering::SeqCst);
    }

    async fn live_transport(&self) -> Result<Arc<Transport>, McpError> {
        match self.transport.read().await.as_ref() {
            Some(t) if t.is_open() => Ok(Arc::clone(t)),
            _ => Err(McpError::NotRunning {
                name: self.name.clone(),
            }),
        }
    }
}

impl std::fmt::Debug for ProtocolClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolClient")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("handlers", &self.handlers)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

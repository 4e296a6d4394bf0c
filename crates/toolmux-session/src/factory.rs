//! Construction of per-session protocol clients.

use std::collections::HashMap;
use std::path::PathBuf;
use toolmux_mcp::{InboundHandlers, McpError, ProtocolClient, ServerConfig};

/// Everything a factory needs to build one session's client.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub session_id: String,
    /// Session-private working directory.
    pub workdir: PathBuf,
    /// Environment overlay: process-wide defaults merged with session settings.
    pub env: HashMap<String, String>,
    pub handlers: InboundHandlers,
}

/// Builds an unstarted [`ProtocolClient`] for a session.
pub trait ClientFactory: Send + Sync {
    fn create(&self, launch: LaunchSpec) -> Result<ProtocolClient, McpError>;
}

/// Launches the configured tool server executable, one process per session.
#[derive(Debug, Clone)]
pub struct ProcessClientFactory {
    server: ServerConfig,
}

impl ProcessClientFactory {
    pub fn new(server: ServerConfig) -> Self {
        Self { server }
    }
}

impl ClientFactory for ProcessClientFactory {
    fn create(&self, launch: LaunchSpec) -> Result<ProtocolClient, McpError> {
        let mut config = self.server.clone();
        config.env.extend(launch.env);
        config.cwd = Some(launch.workdir);
        Ok(ProtocolClient::new(launch.session_id, config, launch.handlers))
    }
}

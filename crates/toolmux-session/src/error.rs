//! Session-specific error types.

use thiserror::Error;
use toolmux_mcp::McpError;

/// Errors that can occur during session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session not found: {id}")]
    UnknownSession { id: String },

    #[error("Session '{id}' has not been configured")]
    NotConfigured { id: String },

    #[error("Session '{id}' is already being configured")]
    ConfigureInProgress { id: String },

    #[error("Session '{id}' has no live connections to answer the prompt")]
    NoClients { id: String },

    #[error("Prompt for session '{id}' timed out after {timeout_ms}ms")]
    PromptTimeout { id: String, timeout_ms: u64 },

    #[error("Session '{id}' was terminated")]
    SessionTerminated { id: String },

    #[error("Tool server error: {0}")]
    Client(#[from] McpError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

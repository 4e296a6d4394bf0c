//! Error types for tool server communication.

use thiserror::Error;

/// Errors from a protocol client and its child process.
#[derive(Debug, Error)]
pub enum McpError {
    #[error("Failed to spawn tool server '{name}': {source}")]
    SpawnFailed {
        name: String,
        source: std::io::Error,
    },

    #[error("Tool server '{name}' is not running")]
    NotRunning { name: String },

    #[error("Tool server '{name}' exited before answering")]
    ProcessExited { name: String },

    #[error("JSON-RPC error from '{server}' (code {code}): {message}")]
    JsonRpc {
        server: String,
        code: i64,
        message: String,
    },

    #[error("Malformed JSON-RPC frame: {0}")]
    Parse(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Tool server '{name}' timed out after {timeout_ms}ms")]
    Timeout { name: String, timeout_ms: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

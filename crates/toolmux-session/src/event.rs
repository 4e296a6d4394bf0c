//! Events relayed to the connections attached to a session.

use serde::Serialize;
use toolmux_mcp::ToolDefinition;

/// Something a transport layer should forward to its client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// The session's current tool catalog.
    Tools { tools: Vec<ToolDefinition> },
    /// Outcome of a tool call made on behalf of this connection.
    ToolResult {
        tool: String,
        result: serde_json::Value,
    },
    /// The tool server needs input; answer with the same `id`.
    Prompt {
        id: String,
        params: serde_json::Value,
    },
    /// The session is gone; no further events follow.
    Closed { code: u16, reason: String },
}

//! Tool catalog entries announced by a tool server.

use crate::error::McpError;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};

/// A tool exposed by the child process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Opaque JSON Schema document; never interpreted here.
    #[serde(
        default,
        rename = "inputSchema",
        skip_serializing_if = "Option::is_none"
    )]
    pub input_schema: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct ToolsListResult {
    tools: Vec<ToolDefinition>,
}

/// Parse the payload of a `tools/list` response or notification.
///
/// Later entries win when a name is announced twice.
pub fn parse_tool_list(value: serde_json::Value) -> Result<Vec<ToolDefinition>, McpError> {
    let list: ToolsListResult = serde_json::from_value(value)
        .map_err(|e| McpError::Protocol(format!("Failed to parse tools/list payload: {e}")))?;

    let mut tools: Vec<ToolDefinition> = Vec::with_capacity(list.tools.len());
    for tool in list.tools {
        match tools.iter_mut().find(|t| t.name == tool.name) {
            Some(existing) => *existing = tool,
            None => tools.push(tool),
        }
    }
    Ok(tools)
}

/// The live catalog shared between a client and its reader task.
#[derive(Debug, Clone, Default)]
pub(crate) struct ToolSet(Arc<RwLock<Vec<ToolDefinition>>>);

impl ToolSet {
    pub(crate) fn snapshot(&self) -> Vec<ToolDefinition> {
        match self.0.read() {
            Ok(tools) => tools.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Swap in a new catalog wholesale.
    pub(crate) fn replace(&self, tools: Vec<ToolDefinition>) {
        match self.0.write() {
            Ok(mut current) => *current = tools,
            Err(poisoned) => *poisoned.into_inner() = tools,
        }
    }
}

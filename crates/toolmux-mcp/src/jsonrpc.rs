//! JSON-RPC 2.0 types for tool server communication.
//!
//! Outbound frames are built from the typed request/notification/response
//! structs. Inbound frames are classified into a single [`Message`] union so
//! the reader loop routes responses, child-originated requests and
//! notifications from one parse.

use crate::error::McpError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// JSON-RPC error code for an unknown or unregistered method.
pub const METHOD_NOT_FOUND: i64 = -32601;

/// JSON-RPC error code for a handler that failed internally.
pub const INTERNAL_ERROR: i64 = -32603;

/// A request id. Either side may pick numbers or strings; numbers are kept
/// exactly as received so negative and fractional ids echo back unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(serde_json::Number),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => f.write_str(s),
        }
    }
}

impl From<u64> for RequestId {
    fn from(n: u64) -> Self {
        RequestId::Number(n.into())
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId::String(s.to_string())
    }
}

/// A JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub id: RequestId,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(
        id: impl Into<RequestId>,
        method: impl Into<String>,
        params: Option<serde_json::Value>,
    ) -> Self {
        Self {
            jsonrpc: "2.0",
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC 2.0 response, written when answering a child-originated request.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: &'static str,
    pub id: RequestId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: RequestId, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: RequestId, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl JsonRpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

/// A JSON-RPC 2.0 notification (no id, no response expected).
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: &'static str,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcNotification {
    /// Create a new JSON-RPC notification.
    pub fn new(method: impl Into<String>, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method: method.into(),
            params,
        }
    }
}

/// One parsed inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Answer to a request this side sent.
    Response {
        id: RequestId,
        outcome: Result<serde_json::Value, JsonRpcError>,
    },
    /// Request originated by the peer; must be answered with the same id.
    Request {
        id: RequestId,
        method: String,
        params: Option<serde_json::Value>,
    },
    /// Fire-and-forget message from the peer.
    Notification {
        method: String,
        params: Option<serde_json::Value>,
    },
}

#[derive(Deserialize)]
struct RawMessage {
    #[serde(default)]
    id: Option<RequestId>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<serde_json::Value>,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

impl Message {
    /// Parse and classify a single frame (without its trailing newline).
    pub fn parse(frame: &[u8]) -> Result<Self, McpError> {
        let raw: RawMessage =
            serde_json::from_slice(frame).map_err(|e| McpError::Parse(e.to_string()))?;

        match (raw.method, raw.id) {
            (Some(method), Some(id)) => Ok(Message::Request {
                id,
                method,
                params: raw.params,
            }),
            (Some(method), None) => Ok(Message::Notification {
                method,
                params: raw.params,
            }),
            (None, Some(id)) => {
                let outcome = match raw.error {
                    Some(err) => Err(err),
                    None => Ok(raw.result.unwrap_or(serde_json::Value::Null)),
                };
                Ok(Message::Response { id, outcome })
            }
            (None, None) => Err(McpError::Parse(
                "frame has neither a method nor an id".to_string(),
            )),
        }
    }
}

//! Handlers for requests the child sends to us.

use crate::jsonrpc::{INTERNAL_ERROR, JsonRpcError};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Failure reported back to the child for an inbound request.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundError {
    pub code: i64,
    pub message: String,
}

impl InboundError {
    /// An internal error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: INTERNAL_ERROR,
            message: message.into(),
        }
    }

    pub fn with_code(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<InboundError> for JsonRpcError {
    fn from(err: InboundError) -> Self {
        JsonRpcError::new(err.code, err.message)
    }
}

/// Answers one kind of child-originated request.
///
/// Uses `Pin<Box<dyn Future>>` for dyn-compatibility.
pub trait InboundHandler: Send + Sync {
    fn handle(
        &self,
        params: serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<serde_json::Value, InboundError>> + Send + '_>>;
}

/// The inbound handlers registered on a client.
///
/// Which handlers are present decides the capabilities declared in the
/// `initialize` handshake.
#[derive(Clone, Default)]
pub struct InboundHandlers {
    pub prompts: Option<Arc<dyn InboundHandler>>,
    pub resources: Option<Arc<dyn InboundHandler>>,
}

impl InboundHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle `prompts/get` requests.
    pub fn with_prompts(mut self, handler: Arc<dyn InboundHandler>) -> Self {
        self.prompts = Some(handler);
        self
    }

    /// Handle `resources/read` requests.
    pub fn with_resources(mut self, handler: Arc<dyn InboundHandler>) -> Self {
        self.resources = Some(handler);
        self
    }

    pub(crate) fn for_method(&self, method: &str) -> Option<&Arc<dyn InboundHandler>> {
        match method {
            "prompts/get" => self.prompts.as_ref(),
            "resources/read" => self.resources.as_ref(),
            _ => None,
        }
    }

    /// Capabilities object sent with `initialize`.
    pub fn capabilities(&self) -> serde_json::Value {
        let mut caps = serde_json::json!({ "tools": { "list": true } });
        if self.prompts.is_some() {
            caps["prompts"] = serde_json::json!({ "get": true });
        }
        if self.resources.is_some() {
            caps["resources"] = serde_json::json!({ "read": true });
        }
        caps
    }
}

impl std::fmt::Debug for InboundHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundHandlers")
            .field("prompts", &self.prompts.is_some())
            .field("resources", &self.resources.is_some())
            .finish()
    }
}

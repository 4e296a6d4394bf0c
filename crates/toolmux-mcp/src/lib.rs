//! Protocol client for stdio tool servers.
//!
//! A tool server is spawned as a child process and spoken to with
//! newline-delimited JSON-RPC 2.0 in both directions: we call its tools, and
//! it may call back into us (`prompts/get`, `resources/read`) mid-call.
//! Responses are correlated by id, so they may arrive in any order.

pub mod client;
pub mod config;
pub mod error;
pub mod framing;
pub mod handler;
pub mod jsonrpc;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod tool;
mod transport;

pub use client::ProtocolClient;
pub use config::ServerConfig;
pub use error::McpError;
pub use handler::{InboundError, InboundHandler, InboundHandlers};
pub use jsonrpc::{Message, RequestId};
pub use tool::ToolDefinition;

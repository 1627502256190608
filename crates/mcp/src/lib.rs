#![warn(missing_docs)]

//! # Archflow MCP
//!
//! A Model-Context-Protocol broker (JSON-RPC 2.0, protocol version
//! `2024-11-05`) exposing registered workflows — and arbitrary tools,
//! resources and prompts — to MCP clients:
//!
//! - [`protocol`] — JSON-RPC request/response/error framing
//! - [`types`] — the MCP data model (tools, resources, prompts,
//!   capabilities)
//! - [`McpTransport`] — pluggable transport; [`StdioTransport`] provided
//! - [`McpBroker`] — method dispatch, workflow-as-tool bridging into the
//!   flow engine, resource subscriptions with content-hash change detection
//!
//! Every dispatch is non-blocking from the transport loop's perspective;
//! broker errors become JSON-RPC error responses, never connection state.

pub mod broker;
pub mod protocol;
pub mod transport;
pub mod types;

pub use broker::{McpBroker, ResourceProvider, StaticResource};
pub use protocol::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, error_codes};
pub use transport::{ChannelTransport, McpTransport, StdioTransport, TransportError};
pub use types::{
    InitializeResult, McpContent, McpPrompt, McpResource, McpTool, McpToolResult, PromptArgument,
    ServerCapabilities, ServerInfo,
};

/// Error raised inside the broker.
#[derive(Debug, thiserror::Error)]
pub enum McpError {
    /// The request is structurally invalid.
    #[error("invalid params: {0}")]
    InvalidParams(String),
    /// No tool, resource or prompt with the requested name.
    #[error("unknown {kind}: {name}")]
    Unknown {
        /// What was looked up (`tool`, `resource`, `prompt`).
        kind: &'static str,
        /// The name that missed.
        name: String,
    },
    /// A resource provider failed to produce content.
    #[error("resource read failed: {0}")]
    ResourceRead(String),
    /// The transport failed; the connection is closed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

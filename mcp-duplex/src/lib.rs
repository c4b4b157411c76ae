//! # MCP Duplex
//!
//! `mcp-duplex` is a bidirectional JSON-RPC 2.0 engine for the Model Context
//! Protocol (MCP). Both ends of a connection can send requests and
//! notifications; the engine correlates responses, routes progress and
//! cancellation, and enforces what each side declared it can do.
//!
//! ## Features
//!
//! - **Message Model**: JSON-RPC requests, responses, notifications and errors
//! - **Capability Checks**: per-method validation against declared capabilities
//! - **Protocol Engine**: request correlation, timeouts, progress and cancellation
//! - **Client and Server Roles**: the `initialize` handshake and typed helpers
//! - **HTTP+SSE Transport**: an axum server and a reqwest client
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mcp_duplex::{Client, ClientOptions, Implementation, Server, ServerOptions};
//! use mcp_duplex::transport::memory::MemoryTransport;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (client_end, server_end) = MemoryTransport::pair();
//!
//!     let server = Server::new(Implementation::new("demo-server", "1.0.0"), ServerOptions::default());
//!     server.connect(Arc::new(server_end)).await?;
//!
//!     let client = Client::new(Implementation::new("demo-client", "1.0.0"), ClientOptions::default());
//!     let result = client.connect(Arc::new(client_end)).await?;
//!     println!("Connected to: {}", result.server_info.name);
//!
//!     client.ping().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`error`]: error types for every failure mode
//! - [`messages`]: JSON-RPC envelopes and MCP payloads
//! - [`capabilities`]: capability maps and per-method checks
//! - [`transport`]: the transport contract and its implementations
//! - [`protocol`]: the engine shared by both roles
//! - [`client`] and [`server`]: the two roles
//!
//! ## Transport Support
//!
//! - **memory**: in-process pair (always available)
//! - **sse-server**: HTTP+SSE server half (enabled by default)
//! - **sse-client**: HTTP+SSE client half (enabled by default)

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::uninlined_format_args)]

pub mod capabilities;
pub mod client;
pub mod error;
pub mod messages;
pub mod protocol;
pub mod server;
pub mod transport;

// Re-export commonly used types for convenience
pub use capabilities::{Capabilities, Side};
pub use client::{Client, ClientOptions};
pub use error::{McpError, McpResult};
pub use messages::{
    Implementation, InitializeParams, InitializeResult, JsonRpcError, JsonRpcMessage,
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
};
pub use protocol::{Protocol, ProtocolOptions, RequestExtra, RequestOptions};
pub use server::{Server, ServerOptions};
pub use transport::{Transport, TransportConfig, TransportEvent, TransportInfo};

/// Current version of the mcp-duplex library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Current MCP protocol version spoken by default
pub const PROTOCOL_VERSION: &str = messages::LATEST_PROTOCOL_VERSION;

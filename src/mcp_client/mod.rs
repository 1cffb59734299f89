//! MCP client: JSON-RPC over stdio connections to MCP tool servers.
//!
//! This module handles:
//! - The durable registry of known servers and their install directories
//! - Spawning server child processes and the MCP handshake
//! - Tool discovery and normalization of `tools/list` responses
//! - Tool execution with timeout-driven retry and reconnect
//! - Resource reads and prompt rendering over the same sessions
//! - Teardown of every child process on every exit path

pub mod environment;
pub mod errors;
pub mod launch;
pub mod lifecycle;
pub mod manager;
pub mod registry;
pub mod tool_list;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use errors::McpError;
pub use lifecycle::{Connector, McpSession, StdioConnector};
pub use manager::{ConnectionInfo, ConnectionManager};
pub use registry::ServerRegistry;
pub use tool_list::MalformedToolPolicy;
pub use types::{
    ConnectParams, ConnectionState, NewServer, PromptArgument, PromptDescriptor, PromptResult,
    ResourceContents, ResourceDescriptor, ServerConfig, ServerStatus, ToolDescriptor, ToolOutput,
};

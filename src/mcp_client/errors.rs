//! MCP Client error types.

use thiserror::Error;

/// Errors that can occur during MCP registry and connection operations.
#[derive(Debug, Error)]
pub enum McpError {
    /// A server definition was rejected before being persisted.
    #[error("validation error: {reason}")]
    Validation {
        reason: String,
    },

    /// Configuration error (missing registry entry, no launch command).
    #[error("config error: {reason}")]
    ConfigError {
        reason: String,
    },

    /// A server process failed to start.
    #[error("failed to spawn server '{name}': {reason}")]
    SpawnFailed {
        name: String,
        reason: String,
    },

    /// The initialization handshake failed.
    #[error("server '{name}' initialization failed: {reason}")]
    InitFailed {
        name: String,
        reason: String,
    },

    /// JSON-RPC communication error (malformed message, I/O error, closed pipe).
    #[error("transport error for server '{server}': {reason}")]
    TransportError {
        server: String,
        reason: String,
    },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// Server process died while a call was in flight.
    #[error("server '{name}' crashed: {reason}")]
    ServerCrashed {
        name: String,
        reason: String,
    },

    /// The `tools/list` response could not be normalized.
    #[error("malformed tool list from '{server}': {reason}")]
    MalformedToolList {
        server: String,
        reason: String,
    },

    /// Tool not found on the target server.
    #[error("tool '{name}' not found on '{server}'. Available: [{}]", available.join(", "))]
    UnknownTool {
        server: String,
        name: String,
        available: Vec<String>,
    },

    /// An operation did not complete within its deadline.
    #[error("{operation} on '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        operation: String,
        timeout_ms: u64,
    },

    /// Connecting to a server failed; the session was torn down.
    #[error("failed to connect to MCP server '{server}': {source}")]
    ConnectFailed {
        server: String,
        #[source]
        source: Box<McpError>,
    },

    /// No live connection exists for the server.
    #[error("server '{server}' is not connected")]
    NotConnected {
        server: String,
    },

    /// A resource or prompt response did not have the expected shape.
    #[error("malformed {method} response from '{server}': {reason}")]
    MalformedResponse {
        server: String,
        method: String,
        reason: String,
    },

    /// All retry attempts for a call were used up.
    #[error("failed to execute '{operation}' on '{server}' after {attempts} attempts. Last error: {last_error}")]
    RetriesExhausted {
        server: String,
        operation: String,
        attempts: u32,
        last_error: String,
    },

    /// Reading or writing the registry on disk failed.
    #[error("persistence error: {reason}")]
    Persistence {
        reason: String,
    },
}

impl McpError {
    /// Whether the error is a connection-layer fault worth a reconnect and retry.
    ///
    /// Application-level failures (JSON-RPC error responses, unparseable tool
    /// lists, missing executables, configuration problems) are not transient.
    pub fn is_transient(&self) -> bool {
        match self {
            McpError::Timeout { .. }
            | McpError::TransportError { .. }
            | McpError::ServerCrashed { .. }
            | McpError::InitFailed { .. }
            | McpError::UnknownTool { .. }
            | McpError::NotConnected { .. } => true,
            McpError::ConnectFailed { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    /// Wrap a connect-phase failure so the caller sees which server it was.
    ///
    /// Configuration errors pass through unwrapped.
    pub(crate) fn connect_failed(server: &str, err: McpError) -> McpError {
        match err {
            McpError::ConfigError { .. } | McpError::ConnectFailed { .. } => err,
            other => McpError::ConnectFailed {
                server: server.to_string(),
                source: Box::new(other),
            },
        }
    }
}

impl From<serde_json::Error> for McpError {
    fn from(e: serde_json::Error) -> Self {
        McpError::Persistence {
            reason: e.to_string(),
        }
    }
}

impl From<std::io::Error> for McpError {
    fn from(e: std::io::Error) -> Self {
        McpError::Persistence {
            reason: e.to_string(),
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

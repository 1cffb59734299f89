//! Agent-facing tool operations.
//!
//! `list_mcp_tools` and `call_mcp_tool` are what the agent framework calls,
//! alongside the resource and prompt operations. All of them return a
//! structured payload tagged with `status`; errors never cross this boundary
//! as `Err`.

use serde::Serialize;

use crate::mcp_client::{ConnectionManager, McpError};

/// One tool as shown to the agent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSummary {
    pub name: String,
    pub description: String,
    pub server_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolListResponse {
    Success {
        tools: Vec<ToolSummary>,
        count: usize,
    },
    Error {
        message: String,
        tools: Vec<ToolSummary>,
        count: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolCallResponse {
    Success {
        server_id: String,
        tool_name: String,
        result: serde_json::Value,
    },
    Error {
        message: String,
    },
}

/// Payload of the resource and prompt operations.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum McpDataResponse {
    Success {
        server_id: String,
        operation: String,
        data: serde_json::Value,
    },
    Error {
        message: String,
    },
}

impl McpDataResponse {
    pub fn is_success(&self) -> bool {
        matches!(self, McpDataResponse::Success { .. })
    }
}

impl ToolListResponse {
    pub fn is_success(&self) -> bool {
        matches!(self, ToolListResponse::Success { .. })
    }
}

impl ToolCallResponse {
    pub fn is_success(&self) -> bool {
        matches!(self, ToolCallResponse::Success { .. })
    }
}

/// List the tools of one connected server, or of all of them.
pub fn list_mcp_tools(manager: &ConnectionManager, server_id: Option<&str>) -> ToolListResponse {
    let tools = match server_id {
        Some(id) => {
            if !manager.is_connected(id) {
                return ToolListResponse::Error {
                    message: format!("MCP server '{id}' is not connected"),
                    tools: Vec::new(),
                    count: 0,
                };
            }
            manager.get_server_tools(id)
        }
        None => manager.get_all_tools(),
    };

    let tools: Vec<ToolSummary> = tools
        .into_iter()
        .map(|t| ToolSummary {
            name: t.name,
            description: t.description,
            server_id: t.server_id,
        })
        .collect();
    let count = tools.len();
    ToolListResponse::Success { tools, count }
}

/// Call a tool and report the outcome as a payload.
///
/// A result the server flags with `isError` is reported as an error carrying
/// the tool's text output.
pub async fn call_mcp_tool(
    manager: &ConnectionManager,
    server_id: &str,
    tool_name: &str,
    arguments: serde_json::Value,
) -> ToolCallResponse {
    match manager.execute_tool(server_id, tool_name, arguments).await {
        Ok(output) if output.is_error => {
            let text = output.text();
            ToolCallResponse::Error {
                message: if text.is_empty() {
                    format!("tool '{tool_name}' on '{server_id}' reported an error")
                } else {
                    text
                },
            }
        }
        Ok(output) => ToolCallResponse::Success {
            server_id: server_id.to_string(),
            tool_name: tool_name.to_string(),
            result: output.to_value(),
        },
        Err(e) => {
            tracing::warn!(server = server_id, tool = tool_name, error = %e, "agent tool call failed");
            ToolCallResponse::Error {
                message: e.to_string(),
            }
        }
    }
}

/// Resources a server exposes.
pub async fn list_mcp_resources(manager: &ConnectionManager, server_id: &str) -> McpDataResponse {
    data_response(server_id, "resources/list", manager.list_resources(server_id).await)
}

/// Contents of one resource.
pub async fn read_mcp_resource(
    manager: &ConnectionManager,
    server_id: &str,
    uri: &str,
) -> McpDataResponse {
    data_response(server_id, "resources/read", manager.read_resource(server_id, uri).await)
}

/// Prompt templates a server exposes.
pub async fn list_mcp_prompts(manager: &ConnectionManager, server_id: &str) -> McpDataResponse {
    data_response(server_id, "prompts/list", manager.list_prompts(server_id).await)
}

/// A prompt rendered with `arguments`.
pub async fn get_mcp_prompt(
    manager: &ConnectionManager,
    server_id: &str,
    name: &str,
    arguments: serde_json::Value,
) -> McpDataResponse {
    data_response(
        server_id,
        "prompts/get",
        manager.get_prompt(server_id, name, arguments).await,
    )
}

fn data_response<T: Serialize>(
    server_id: &str,
    operation: &str,
    result: Result<T, McpError>,
) -> McpDataResponse {
    let data = result.and_then(|value| serde_json::to_value(value).map_err(McpError::from));
    match data {
        Ok(data) => McpDataResponse::Success {
            server_id: server_id.to_string(),
            operation: operation.to_string(),
            data,
        },
        Err(e) => {
            tracing::warn!(server = server_id, operation, error = %e, "agent MCP operation failed");
            McpDataResponse::Error {
                message: e.to_string(),
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

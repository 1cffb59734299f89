//! `tools`, `call`, `resources`, `prompts` and `health` subcommands.

use anyhow::Context;

use super::{print_json, CliContext};
use crate::agent_tools::{
    call_mcp_tool, get_mcp_prompt, list_mcp_prompts, list_mcp_resources, list_mcp_tools,
    read_mcp_resource, McpDataResponse,
};
use crate::mcp_client::ConnectParams;

/// Connect one server (or all registered ones) and print the tool listing.
pub async fn handle_list(ctx: &CliContext, server: Option<&str>) -> anyhow::Result<()> {
    match server {
        Some(id) => {
            if let Err(e) = ctx.manager.connect_to_server(id, ConnectParams::default()).await {
                eprintln!("{id}: {e}");
            }
        }
        None => {
            for (id, e) in ctx.manager.connect_registered().await {
                eprintln!("{id}: {e}");
            }
        }
    }

    print_json(&list_mcp_tools(&ctx.manager, server))
}

/// Call a tool and print the `call_mcp_tool` payload.
pub async fn handle_call(
    ctx: &CliContext,
    server: &str,
    tool: &str,
    args: &str,
) -> anyhow::Result<()> {
    let arguments = parse_object_args(args)?;
    let response = call_mcp_tool(&ctx.manager, server, tool, arguments).await;
    print_json(&response)?;
    anyhow::ensure!(response.is_success(), "tool call failed");
    Ok(())
}

/// List resources, or read one when `uri` is given.
pub async fn handle_resources(
    ctx: &CliContext,
    server: &str,
    uri: Option<&str>,
) -> anyhow::Result<()> {
    let response = match uri {
        Some(uri) => read_mcp_resource(&ctx.manager, server, uri).await,
        None => list_mcp_resources(&ctx.manager, server).await,
    };
    print_data(&response)
}

/// List prompts, or render one when `name` is given.
pub async fn handle_prompts(
    ctx: &CliContext,
    server: &str,
    name: Option<&str>,
    args: &str,
) -> anyhow::Result<()> {
    let response = match name {
        Some(name) => {
            let arguments = parse_object_args(args)?;
            get_mcp_prompt(&ctx.manager, server, name, arguments).await
        }
        None => list_mcp_prompts(&ctx.manager, server).await,
    };
    print_data(&response)
}

fn print_data(response: &McpDataResponse) -> anyhow::Result<()> {
    print_json(response)?;
    anyhow::ensure!(response.is_success(), "MCP request failed");
    Ok(())
}

fn parse_object_args(args: &str) -> anyhow::Result<serde_json::Value> {
    let arguments: serde_json::Value =
        serde_json::from_str(args).context("--args must be a JSON object")?;
    anyhow::ensure!(arguments.is_object(), "--args must be a JSON object");
    Ok(arguments)
}

/// Connect a server and report whether it answers a health probe.
pub async fn handle_health(ctx: &CliContext, server: &str) -> anyhow::Result<()> {
    let connected = ctx
        .manager
        .connect_to_server(server, ConnectParams::default())
        .await;
    let healthy = match &connected {
        Ok(_) => ctx.manager.check_connection_health(server).await,
        Err(_) => false,
    };

    let mut report = serde_json::json!({
        "server_id": server,
        "healthy": healthy,
        "connection": ctx.manager.connection_info(server),
    });
    if let Err(e) = connected {
        report["error"] = serde_json::Value::String(e.to_string());
    }
    print_json(&report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_call_rejects_non_object_args() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = CliContext::open(tmp.path());
        assert!(handle_call(&ctx, "calc", "add", "[1, 2]").await.is_err());
        assert!(handle_call(&ctx, "calc", "add", "not json").await.is_err());
    }

    #[tokio::test]
    async fn test_prompts_reject_non_object_args() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = CliContext::open(tmp.path());
        assert!(handle_prompts(&ctx, "calc", Some("explain"), "\"x\"").await.is_err());
        assert!(handle_resources(&ctx, "ghost", None).await.is_err());
    }

    #[tokio::test]
    async fn test_health_of_unknown_server_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = CliContext::open(tmp.path());
        handle_health(&ctx, "ghost").await.unwrap();
        assert!(!ctx.manager.is_connected("ghost"));
    }
}

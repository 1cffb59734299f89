//! `servers` subcommands: registry management.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Context;
use clap::Subcommand;

use super::{print_json, CliContext};
use crate::mcp_client::NewServer;

#[derive(Subcommand)]
pub enum ServerCommand {
    /// Register a server (does not launch it)
    Add {
        /// Server id (random when omitted)
        #[arg(long)]
        name: Option<String>,

        /// Executable that starts the server
        #[arg(long)]
        command: String,

        /// Environment variable for the server, as KEY=VALUE (repeatable)
        #[arg(long = "env", value_parser = parse_key_val)]
        env: Vec<(String, String)>,

        /// npm package to install into the server's directory
        #[arg(long)]
        install: Option<String>,

        /// Arguments passed to the server command (after `--`)
        #[arg(last = true)]
        args: Vec<String>,
    },

    /// List registered servers
    List,

    /// Show one server's registry entry
    Show {
        /// Server id
        id: String,
    },

    /// Remove a server and its install directory
    Remove {
        /// Server id
        id: String,
    },

    /// Import servers from an `mcpServers` JSON document
    Import {
        /// Path to the document
        path: PathBuf,
    },
}

pub async fn handle(ctx: &CliContext, command: ServerCommand) -> anyhow::Result<()> {
    match command {
        ServerCommand::Add {
            name,
            command,
            env,
            install,
            args,
        } => {
            let id = ctx
                .registry
                .add_server(NewServer {
                    name,
                    command,
                    args,
                    env: env.into_iter().collect::<HashMap<_, _>>(),
                    install_package: install,
                })
                .await?;
            println!("{id}");
        }
        ServerCommand::List => {
            let servers = ctx.registry.list_servers();
            if servers.is_empty() {
                println!("No MCP servers registered.");
            }
            for server in servers {
                println!(
                    "{:<24} {:<14} {} {}",
                    server.id,
                    server.status.as_str(),
                    server.command,
                    server.args.join(" ")
                );
            }
        }
        ServerCommand::Show { id } => {
            let server = ctx
                .registry
                .get_server(&id)
                .with_context(|| format!("no MCP server registered as '{id}'"))?;
            print_json(&server)?;
        }
        ServerCommand::Remove { id } => {
            ctx.registry.remove_server(&id)?;
            println!("removed {id}");
        }
        ServerCommand::Import { path } => {
            let ids = ctx.registry.import_servers(&path).await?;
            for id in ids {
                println!("{id}");
            }
        }
    }
    Ok(())
}

/// Parse a `KEY=VALUE` pair.
fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{s}'"))?;
    if key.is_empty() {
        return Err(format!("empty key in '{s}'"));
    }
    Ok((key.to_string(), value.to_string()))
}

//! Command-line front end.
//!
//! Each subcommand builds on one `CliContext` (registry, settings and
//! connection manager over the data directory). Every connection opened by a
//! command is closed before the process exits.

pub mod servers;
pub mod tools;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};

use crate::config::ManagerSettings;
use crate::mcp_client::{ConnectionManager, ServerRegistry};

/// Manage MCP tool servers and call their tools.
#[derive(Parser)]
#[command(name = "cognisphere-mcp")]
#[command(about = "Cognisphere MCP server registry and connection manager", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Data directory (registry, install directories, settings, logs)
    #[arg(long, global = true, env = crate::DATA_DIR_ENV)]
    pub data_dir: Option<PathBuf>,

    /// Log to stderr instead of the log file
    #[arg(long, global = true)]
    pub log_stderr: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage registered servers
    Servers {
        #[command(subcommand)]
        command: servers::ServerCommand,
    },

    /// Connect servers and list their tools
    Tools {
        /// Only this server (default: every registered server)
        #[arg(long)]
        server: Option<String>,
    },

    /// Call a tool and print the result payload
    Call {
        /// Server id
        server: String,

        /// Tool name
        tool: String,

        /// Tool arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,
    },

    /// List a server's resources, or read one
    Resources {
        /// Server id
        server: String,

        /// Read the resource with this URI instead of listing
        #[arg(long)]
        read: Option<String>,
    },

    /// List a server's prompts, or render one
    Prompts {
        /// Server id
        server: String,

        /// Render the prompt with this name instead of listing
        #[arg(long)]
        get: Option<String>,

        /// Prompt arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,
    },

    /// Connect a server and probe it with a health check
    Health {
        /// Server id
        server: String,
    },
}

/// Shared state for one CLI invocation.
pub struct CliContext {
    pub registry: Arc<ServerRegistry>,
    pub manager: ConnectionManager,
}

impl CliContext {
    pub fn open(data_dir: &Path) -> Self {
        let settings = ManagerSettings::load_or_default(data_dir);
        let registry = Arc::new(ServerRegistry::in_data_dir(data_dir));
        let manager = ConnectionManager::new(Arc::clone(&registry), settings);
        Self { registry, manager }
    }
}

/// Run one command, then close every connection it opened.
pub async fn run(command: Commands, data_dir: &Path) -> anyhow::Result<()> {
    let ctx = CliContext::open(data_dir);

    let result = match command {
        Commands::Servers { command } => servers::handle(&ctx, command).await,
        Commands::Tools { server } => tools::handle_list(&ctx, server.as_deref()).await,
        Commands::Call { server, tool, args } => {
            tools::handle_call(&ctx, &server, &tool, &args).await
        }
        Commands::Resources { server, read } => {
            tools::handle_resources(&ctx, &server, read.as_deref()).await
        }
        Commands::Prompts { server, get, args } => {
            tools::handle_prompts(&ctx, &server, get.as_deref(), &args).await
        }
        Commands::Health { server } => tools::handle_health(&ctx, &server).await,
    };

    ctx.manager.close_all().await;
    result
}

/// Print a value as pretty JSON on stdout.
pub(crate) fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

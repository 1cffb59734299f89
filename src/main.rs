use anyhow::Context;
use clap::Parser;

use cognisphere_mcp::commands::{self, Cli};
use cognisphere_mcp::LogTarget;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let data_dir = cli.data_dir.clone().unwrap_or_else(cognisphere_mcp::data_dir);

    let target = if cli.log_stderr {
        LogTarget::Stderr
    } else {
        LogTarget::File
    };
    cognisphere_mcp::init_tracing(&data_dir, target)
        .with_context(|| format!("failed to initialize logging in {}", data_dir.display()))?;

    commands::run(cli.command, &data_dir).await
}

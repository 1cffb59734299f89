//! Launch-spec resolution: which command, arguments and environment a server
//! process is started with.

use std::collections::HashMap;

use super::errors::McpError;
use super::types::{ConnectParams, ServerConfig};

/// Environment entries injected into every server unless already present.
pub const DEFAULT_SERVER_ENV: [(&str, &str); 2] = [
    ("MCP_CONNECTION_TIMEOUT", "30"),
    ("MCP_KEEP_ALIVE", "true"),
];

/// Fully resolved parameters for spawning one server process.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub command: String,
    pub args: Vec<String>,
    /// Complete child environment (inherited variables included).
    pub env: HashMap<String, String>,
    pub cwd: Option<String>,
}

impl LaunchSpec {
    /// Combine direct parameters, the registry entry and the inherited
    /// process environment.
    ///
    /// Precedence: `params` over `registered` over `inherited`. Arguments from
    /// `params` win only when non-empty.
    pub fn resolve<I>(
        server_id: &str,
        params: &ConnectParams,
        registered: Option<&ServerConfig>,
        inherited: I,
    ) -> Result<Self, McpError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let command = params
            .command
            .as_deref()
            .filter(|c| !c.trim().is_empty())
            .or_else(|| registered.map(|r| r.command.as_str()))
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| McpError::ConfigError {
                reason: format!("no command specified for MCP server '{server_id}'"),
            })?;

        let args = match (&params.args, registered) {
            (Some(args), _) if !args.is_empty() => args.clone(),
            (_, Some(reg)) => reg.args.clone(),
            (Some(args), None) => args.clone(),
            (None, None) => Vec::new(),
        };

        let mut env: HashMap<String, String> = inherited.into_iter().collect();
        if let Some(reg) = registered {
            env.extend(reg.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        env.extend(params.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        for (key, value) in DEFAULT_SERVER_ENV {
            env.entry(key.to_string())
                .or_insert_with(|| value.to_string());
        }

        Ok(Self {
            command: platform_command(command),
            args,
            env,
            cwd: registered.and_then(|r| r.cwd.clone()),
        })
    }
}

/// Platform-correct spelling of a launcher command.
///
/// Windows requires `npx.cmd`/`npm.cmd` because both are batch scripts;
/// `Command::new("npx")` fails without the extension there.
pub fn platform_command(command: &str) -> String {
    if cfg!(target_os = "windows") && matches!(command, "npx" | "npm") {
        format!("{command}.cmd")
    } else {
        command.to_string()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

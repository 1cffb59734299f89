//! Server registry: the durable record of known MCP servers.
//!
//! The whole registry is one JSON document `{server_id: ServerConfig}`,
//! rewritten on every mutation with a temp-file-plus-rename write. Writers
//! are serialized by the in-memory map's lock.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Deserialize;

use super::environment::ServerEnvironments;
use super::errors::McpError;
use super::types::{NewServer, ServerConfig, ServerStatus};

/// File name of the registry document inside the data directory.
pub const REGISTRY_FILE: &str = "mcp_servers.json";

/// Directory holding per-server install directories inside the data directory.
pub const INSTALL_DIR: &str = "mcp_servers";

// ─── ServerRegistry ──────────────────────────────────────────────────────────

pub struct ServerRegistry {
    path: PathBuf,
    environments: ServerEnvironments,
    servers: parking_lot::Mutex<BTreeMap<String, ServerConfig>>,
}

impl ServerRegistry {
    /// Open the registry stored at `path`, with install directories under
    /// `install_root`.
    ///
    /// A missing file is an empty registry. So is an unparseable one (logged).
    pub fn open(path: impl Into<PathBuf>, install_root: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let servers = load_from_disk(&path);
        Self {
            path,
            environments: ServerEnvironments::new(install_root),
            servers: parking_lot::Mutex::new(servers),
        }
    }

    /// Open the registry at its standard location inside `data_dir`.
    pub fn in_data_dir(data_dir: &Path) -> Self {
        Self::open(data_dir.join(REGISTRY_FILE), data_dir.join(INSTALL_DIR))
    }

    /// Register a server and persist it.
    ///
    /// Creates the server's install directory and installs `install_package`
    /// into it when given. Installation failures are logged, not returned.
    /// Never launches the server. Re-adding an existing id replaces the entry.
    pub async fn add_server(&self, new: NewServer) -> Result<String, McpError> {
        if new.command.trim().is_empty() {
            return Err(McpError::Validation {
                reason: "server command must not be empty".into(),
            });
        }

        let id = match new.name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => {
                validate_id(name)?;
                name.to_string()
            }
            _ => uuid::Uuid::new_v4().to_string(),
        };

        let config = ServerConfig {
            id: id.clone(),
            command: new.command.trim().to_string(),
            args: new.args,
            env: new.env,
            cwd: None,
            created_at: Utc::now(),
            last_connected: None,
            status: ServerStatus::NotConnected,
        };

        {
            let mut servers = self.servers.lock();
            let previous = servers.insert(id.clone(), config);
            if let Err(e) = self.save_to_disk(&servers) {
                match previous {
                    Some(prev) => servers.insert(id.clone(), prev),
                    None => servers.remove(&id),
                };
                return Err(e);
            }
        }

        self.environments.create(&id)?;

        if let Some(package) = new.install_package.as_deref() {
            if let Err(e) = self.environments.install_package(&id, package).await {
                tracing::warn!(server = %id, package, error = %e, "package installation failed");
            }
        }

        tracing::info!(server = %id, "MCP server registered");
        Ok(id)
    }

    /// Look up one server.
    pub fn get_server(&self, server_id: &str) -> Option<ServerConfig> {
        self.servers.lock().get(server_id).cloned()
    }

    /// All registered servers, ordered by id.
    pub fn list_servers(&self) -> Vec<ServerConfig> {
        self.servers.lock().values().cloned().collect()
    }

    /// Remove a server and its install directory. Unknown ids are a no-op.
    pub fn remove_server(&self, server_id: &str) -> Result<(), McpError> {
        {
            let mut servers = self.servers.lock();
            if let Some(removed) = servers.remove(server_id) {
                if let Err(e) = self.save_to_disk(&servers) {
                    servers.insert(server_id.to_string(), removed);
                    return Err(e);
                }
                tracing::info!(server = server_id, "MCP server removed");
            }
        }

        if validate_id(server_id).is_ok() {
            self.environments.remove(server_id)?;
        }
        Ok(())
    }

    /// Record a successful connection.
    pub fn mark_connected(&self, server_id: &str) {
        self.update_status(server_id, |cfg| {
            cfg.status = ServerStatus::Connected;
            cfg.last_connected = Some(Utc::now());
        });
    }

    /// Record that the server is no longer connected.
    pub fn mark_disconnected(&self, server_id: &str) {
        self.update_status(server_id, |cfg| cfg.status = ServerStatus::NotConnected);
    }

    /// Import a desktop-client style document: `{"mcpServers": {name: {command, args, env}}}`.
    ///
    /// Returns the ids of the imported servers.
    pub async fn import_servers(&self, path: &Path) -> Result<Vec<String>, McpError> {
        let content = std::fs::read_to_string(path).map_err(|e| McpError::ConfigError {
            reason: format!("cannot read {}: {e}", path.display()),
        })?;
        let doc: ImportDocument =
            serde_json::from_str(&content).map_err(|e| McpError::ConfigError {
                reason: format!("invalid MCP config {}: {e}", path.display()),
            })?;

        let mut imported = Vec::with_capacity(doc.mcp_servers.len());
        for (name, entry) in doc.mcp_servers {
            let id = self
                .add_server(NewServer {
                    name: Some(name),
                    command: entry.command,
                    args: entry.args,
                    env: entry.env,
                    install_package: None,
                })
                .await?;
            imported.push(id);
        }

        tracing::info!(count = imported.len(), path = %path.display(), "imported MCP servers");
        Ok(imported)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn environments(&self) -> &ServerEnvironments {
        &self.environments
    }

    // ─── Persistence ─────────────────────────────────────────────────────

    fn update_status(&self, server_id: &str, apply: impl FnOnce(&mut ServerConfig)) {
        let mut servers = self.servers.lock();
        let Some(cfg) = servers.get_mut(server_id) else {
            return;
        };
        apply(cfg);
        if let Err(e) = self.save_to_disk(&servers) {
            tracing::warn!(server = server_id, error = %e, "failed to persist server status");
        }
    }

    /// Rewrite the registry document (atomic write). Caller holds the lock.
    fn save_to_disk(&self, servers: &BTreeMap<String, ServerConfig>) -> Result<(), McpError> {
        let content = serde_json::to_string_pretty(servers)?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)?;
        std::fs::rename(&tmp_path, &self.path)?;

        tracing::debug!(count = servers.len(), "saved server registry");
        Ok(())
    }
}

fn load_from_disk(path: &Path) -> BTreeMap<String, ServerConfig> {
    if !path.exists() {
        return BTreeMap::new();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str::<BTreeMap<String, ServerConfig>>(&content) {
            Ok(servers) => {
                tracing::info!(
                    count = servers.len(),
                    path = %path.display(),
                    "loaded server registry"
                );
                servers
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    path = %path.display(),
                    "failed to parse server registry, starting empty"
                );
                BTreeMap::new()
            }
        },
        Err(e) => {
            tracing::warn!(error = %e, path = %path.display(), "failed to read server registry");
            BTreeMap::new()
        }
    }
}

/// Ids double as directory names.
fn validate_id(id: &str) -> Result<(), McpError> {
    if id == "." || id == ".." || id.contains(['/', '\\']) {
        return Err(McpError::Validation {
            reason: format!("invalid server id '{id}'"),
        });
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct ImportDocument {
    #[serde(rename = "mcpServers")]
    mcp_servers: BTreeMap<String, ImportEntry>,
}

#[derive(Debug, Deserialize)]
struct ImportEntry {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
}

// ─── Tests ───────────────────────────────────────────────────────────────────

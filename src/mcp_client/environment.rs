//! Isolated per-server install directories.
//!
//! Every registered server gets `<root>/<server_id>/` with its own
//! `package.json` and `node_modules/`, so npm-distributed servers never share
//! dependency trees.

use std::path::{Path, PathBuf};

use tokio::process::Command;

use super::errors::McpError;
use super::launch::platform_command;

/// Manages the install directories under one root.
#[derive(Debug, Clone)]
pub struct ServerEnvironments {
    root: PathBuf,
}

impl ServerEnvironments {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory for one server.
    pub fn server_dir(&self, server_id: &str) -> PathBuf {
        self.root.join(server_id)
    }

    /// Create the install directory with `node_modules/` and a `package.json`.
    ///
    /// Existing files are left untouched.
    pub fn create(&self, server_id: &str) -> Result<PathBuf, McpError> {
        let dir = self.server_dir(server_id);
        std::fs::create_dir_all(dir.join("node_modules"))?;

        let package_json = dir.join("package.json");
        if !package_json.exists() {
            let manifest = serde_json::json!({
                "name": format!("cognisphere-mcp-server-{}", package_slug(server_id)),
                "version": "1.0.0",
                "private": true,
                "dependencies": {}
            });
            std::fs::write(&package_json, serde_json::to_string_pretty(&manifest)?)?;
        }

        tracing::debug!(server = server_id, path = %dir.display(), "install directory ready");
        Ok(dir)
    }

    /// Run `npm install <package> --save` inside the server's directory.
    pub async fn install_package(&self, server_id: &str, package: &str) -> Result<(), McpError> {
        let dir = self.server_dir(server_id);
        if !dir.exists() {
            self.create(server_id)?;
        }

        tracing::info!(server = server_id, package, "installing npm package");

        let mut cmd = Command::new(platform_command("npm"));
        cmd.args(["install", package, "--save"]).current_dir(&dir);

        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        let output = cmd.output().await.map_err(|e| McpError::Persistence {
            reason: format!("failed to run npm install: {e}"),
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(McpError::Persistence {
                reason: format!("npm install {package} failed: {}", stderr.trim()),
            });
        }

        Ok(())
    }

    /// Remove the server's install directory. Missing directories are fine.
    pub fn remove(&self, server_id: &str) -> Result<(), McpError> {
        let dir = self.server_dir(server_id);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => {
                tracing::debug!(server = server_id, path = %dir.display(), "install directory removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// npm package names are lowercase and URL-safe.
fn package_slug(server_id: &str) -> String {
    server_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_writes_manifest_and_node_modules() {
        let tmp = tempfile::tempdir().unwrap();
        let envs = ServerEnvironments::new(tmp.path());

        let dir = envs.create("Calc Server").unwrap();
        assert!(dir.join("node_modules").is_dir());

        let manifest: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(dir.join("package.json")).unwrap())
                .unwrap();
        assert_eq!(manifest["name"], "cognisphere-mcp-server-calc-server");
        assert_eq!(manifest["private"], true);
    }

    #[test]
    fn test_create_keeps_existing_manifest() {
        let tmp = tempfile::tempdir().unwrap();
        let envs = ServerEnvironments::new(tmp.path());
        let dir = envs.create("calc").unwrap();
        std::fs::write(dir.join("package.json"), "{\"name\": \"custom\"}").unwrap();

        envs.create("calc").unwrap();
        let content = std::fs::read_to_string(dir.join("package.json")).unwrap();
        assert!(content.contains("custom"));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let envs = ServerEnvironments::new(tmp.path());
        envs.create("calc").unwrap();

        envs.remove("calc").unwrap();
        assert!(!envs.server_dir("calc").exists());
        envs.remove("calc").unwrap();
    }
}

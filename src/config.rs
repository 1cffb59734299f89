//! Connection manager settings.
//!
//! Read from `<data_dir>/config.yaml`. Every field is optional; missing
//! fields take the defaults below.
//!
//! ```yaml
//! connect_timeout_ms: 30000
//! tool_timeout_ms: 60000
//! max_retries: 2
//! malformed_tools: skip
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::mcp_client::errors::McpError;
use crate::mcp_client::tool_list::MalformedToolPolicy;

/// File name of the settings file inside the data directory.
pub const SETTINGS_FILE: &str = "config.yaml";

/// Timeouts and retry policy for the connection manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerSettings {
    /// Bound on process launch + `initialize`, and separately on the first `tools/list`.
    pub connect_timeout_ms: u64,
    /// Bound on one `tools/call`.
    pub tool_timeout_ms: u64,
    /// Bound on the `tools/list` probe used as a health check.
    pub health_check_timeout_ms: u64,
    /// How long a server gets to exit after its stdin closes before it is killed.
    pub shutdown_timeout_ms: u64,
    /// Extra attempts after the first failed tool call.
    pub max_retries: u32,
    /// Pause before each retry.
    pub retry_delay_ms: u64,
    /// Handling of tool-list entries matching no known shape.
    pub malformed_tools: MalformedToolPolicy,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 30_000,
            tool_timeout_ms: 60_000,
            health_check_timeout_ms: 10_000,
            shutdown_timeout_ms: 5_000,
            max_retries: 2,
            retry_delay_ms: 3_000,
            malformed_tools: MalformedToolPolicy::Reject,
        }
    }
}

impl ManagerSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_millis(self.tool_timeout_ms)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Parse a settings file.
    pub fn load(path: &Path) -> Result<Self, McpError> {
        let raw = std::fs::read_to_string(path).map_err(|e| McpError::ConfigError {
            reason: format!("failed to read {}: {e}", path.display()),
        })?;

        // An empty file is valid and means "all defaults".
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        serde_yaml::from_str(&raw).map_err(|e| McpError::ConfigError {
            reason: format!("failed to parse {}: {e}", path.display()),
        })
    }

    /// Load `<data_dir>/config.yaml`, falling back to defaults when it is
    /// absent or invalid.
    pub fn load_or_default(data_dir: &Path) -> Self {
        let path = Self::path_in(data_dir);
        if !path.exists() {
            return Self::default();
        }
        match Self::load(&path) {
            Ok(settings) => {
                tracing::info!(path = %path.display(), "loaded manager settings");
                settings
            }
            Err(e) => {
                tracing::warn!(error = %e, "invalid manager settings, using defaults");
                Self::default()
            }
        }
    }

    pub fn path_in(data_dir: &Path) -> PathBuf {
        data_dir.join(SETTINGS_FILE)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = ManagerSettings::default();
        assert_eq!(s.connect_timeout(), Duration::from_secs(30));
        assert_eq!(s.tool_timeout(), Duration::from_secs(60));
        assert_eq!(s.health_check_timeout(), Duration::from_secs(10));
        assert_eq!(s.max_retries, 2);
        assert_eq!(s.retry_delay(), Duration::from_secs(3));
        assert_eq!(s.malformed_tools, MalformedToolPolicy::Reject);
    }

    #[test]
    fn test_partial_yaml_keeps_other_defaults() {
        let yaml = r#"
            tool_timeout_ms: 5000
            malformed_tools: skip
        "#;
        let s: ManagerSettings = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(s.tool_timeout(), Duration::from_secs(5));
        assert_eq!(s.malformed_tools, MalformedToolPolicy::Skip);
        assert_eq!(s.max_retries, 2);
    }

    #[test]
    fn test_load_or_default_missing_and_invalid() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(
            ManagerSettings::load_or_default(tmp.path()),
            ManagerSettings::default()
        );

        std::fs::write(tmp.path().join(SETTINGS_FILE), "max_retries: [oops").unwrap();
        assert_eq!(
            ManagerSettings::load_or_default(tmp.path()),
            ManagerSettings::default()
        );
    }

    #[test]
    fn test_load_from_file() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(SETTINGS_FILE), "max_retries: 5\n").unwrap();
        let s = ManagerSettings::load_or_default(tmp.path());
        assert_eq!(s.max_retries, 5);
    }

    #[test]
    fn test_empty_file_is_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(SETTINGS_FILE);
        std::fs::write(&path, "\n").unwrap();
        assert_eq!(ManagerSettings::load(&path).unwrap(), ManagerSettings::default());
    }
}

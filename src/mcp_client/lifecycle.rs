//! Server process lifecycle management.
//!
//! Handles spawning, initializing, and shutting down MCP server child
//! processes. Each server runs as a separate OS process communicating via
//! JSON-RPC over stdio.
//!
//! A `StdioSession` owns its child process: closing it (or dropping it)
//! closes the pipes and terminates the process, on every exit path.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};

use super::errors::McpError;
use super::launch::LaunchSpec;
use super::transport::{extract_result, StdioTransport};
use super::types::{error_codes, InitializeResult, PROTOCOL_VERSION};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Number of trailing stderr lines kept for failure diagnostics.
const STDERR_TAIL_LINES: usize = 20;

/// Grace period for the stderr drain to catch up after a failed handshake.
const STDERR_SETTLE: Duration = Duration::from_millis(50);

/// Upper bound on list pages followed via `nextCursor`.
const MAX_LIST_PAGES: usize = 64;

/// Default wait for a graceful exit before force-killing.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

// ─── Seams ───────────────────────────────────────────────────────────────────

/// A live RPC session with one MCP server.
///
/// Calls on one session are serialized by the implementation.
#[async_trait]
pub trait McpSession: Send + Sync {
    /// Perform the `initialize` handshake.
    async fn initialize(&self) -> Result<(), McpError>;

    /// Raw `tools/list` result, before normalization.
    async fn list_tools(&self) -> Result<serde_json::Value, McpError>;

    /// Raw `tools/call` result.
    async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, McpError>;

    /// Raw `resources/list` result, all pages merged under `resources`.
    async fn list_resources(&self) -> Result<serde_json::Value, McpError> {
        Err(unsupported("resources/list"))
    }

    /// Raw `resources/read` result.
    async fn read_resource(&self, _uri: &str) -> Result<serde_json::Value, McpError> {
        Err(unsupported("resources/read"))
    }

    /// Raw `prompts/list` result, all pages merged under `prompts`.
    async fn list_prompts(&self) -> Result<serde_json::Value, McpError> {
        Err(unsupported("prompts/list"))
    }

    /// Raw `prompts/get` result.
    async fn get_prompt(
        &self,
        _name: &str,
        _arguments: serde_json::Value,
    ) -> Result<serde_json::Value, McpError> {
        Err(unsupported("prompts/get"))
    }

    /// Release the session and terminate the server. Idempotent.
    async fn close(&self);

    /// OS process id of the server, when there is one.
    fn pid(&self) -> Option<u32> {
        None
    }
}

fn unsupported(method: &str) -> McpError {
    McpError::ServerError {
        code: error_codes::METHOD_NOT_FOUND,
        message: format!("{method} is not supported by this session"),
        data: None,
    }
}

/// Launches sessions from resolved launch specs.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Start the server and return an uninitialized session.
    async fn launch(
        &self,
        server_id: &str,
        spec: &LaunchSpec,
    ) -> Result<Arc<dyn McpSession>, McpError>;
}

// ─── StdioSession ────────────────────────────────────────────────────────────

/// A running MCP server process with its transport.
pub struct StdioSession {
    server_id: String,
    /// `None` once the session has been closed.
    process: tokio::sync::Mutex<Option<Child>>,
    pid: Option<u32>,
    transport: StdioTransport,
    stderr_tail: Arc<parking_lot::Mutex<VecDeque<String>>>,
    shutdown_timeout: Duration,
}

impl StdioSession {
    /// Whether the server process is still running.
    pub async fn is_alive(&self) -> bool {
        match self.process.lock().await.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Recent stderr output of the server.
    pub fn stderr_tail(&self) -> String {
        self.stderr_tail
            .lock()
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Map a transport failure to `ServerCrashed` when the process is gone.
    async fn classify_failure(&self, err: McpError) -> McpError {
        if !matches!(err, McpError::TransportError { .. }) {
            return err;
        }
        let exit = match self.process.lock().await.as_mut() {
            Some(child) => child.try_wait().ok().flatten(),
            None => None,
        };
        match exit {
            Some(status) => McpError::ServerCrashed {
                name: self.server_id.clone(),
                reason: format!("{err} (exit status: {status})"),
            },
            None => err,
        }
    }

    /// One request, with transport failures classified against the process.
    async fn call(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, McpError> {
        match self.transport.request(method, params).await {
            Ok(response) => extract_result(response),
            Err(e) => Err(self.classify_failure(e).await),
        }
    }

    /// Follow `nextCursor` and merge every page's `key` array.
    ///
    /// A first page without a `key` array is returned untouched.
    async fn collect_pages(&self, method: &str, key: &str) -> Result<serde_json::Value, McpError> {
        let mut collected: Vec<serde_json::Value> = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_LIST_PAGES {
            let params = cursor
                .as_ref()
                .map(|c| serde_json::json!({ "cursor": c }));
            let page = self.call(method, params).await?;

            let Some(items) = page.get(key).and_then(|t| t.as_array()) else {
                return Ok(page);
            };
            collected.extend(items.iter().cloned());

            match page.get("nextCursor").and_then(|c| c.as_str()) {
                Some(next) if !next.is_empty() => cursor = Some(next.to_string()),
                _ => return Ok(serde_json::json!({ key: collected })),
            }
        }

        tracing::warn!(
            server = %self.server_id,
            method,
            pages = MAX_LIST_PAGES,
            "pagination limit reached"
        );
        Ok(serde_json::json!({ key: collected }))
    }
}

#[async_trait]
impl McpSession for StdioSession {
    async fn initialize(&self) -> Result<(), McpError> {
        let params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": "cognisphere",
                "version": env!("CARGO_PKG_VERSION"),
            },
        });

        let outcome = async {
            let response = self.transport.request("initialize", Some(params)).await?;
            let result = extract_result(response)?;
            let init: InitializeResult =
                serde_json::from_value(result).map_err(|e| McpError::InitFailed {
                    name: self.server_id.clone(),
                    reason: format!("failed to parse initialize response: {e}"),
                })?;
            self.transport
                .notify("notifications/initialized", None)
                .await?;
            Ok::<_, McpError>(init)
        }
        .await;

        match outcome {
            Ok(init) => {
                let info = init.server_info.as_ref();
                tracing::debug!(
                    server = %self.server_id,
                    remote_name = info.and_then(|i| i.name.as_deref()).unwrap_or("unknown"),
                    remote_version = info.and_then(|i| i.version.as_deref()).unwrap_or("unknown"),
                    protocol = init.protocol_version.as_deref().unwrap_or("unspecified"),
                    "session initialized"
                );
                Ok(())
            }
            Err(e @ McpError::InitFailed { .. }) => Err(e),
            Err(e) => {
                tokio::time::sleep(STDERR_SETTLE).await;
                let stderr_ctx = self.stderr_tail();
                if !stderr_ctx.is_empty() {
                    tracing::warn!(
                        server = %self.server_id,
                        stderr = %stderr_ctx,
                        "server stderr captured on failure"
                    );
                }
                Err(McpError::InitFailed {
                    name: self.server_id.clone(),
                    reason: format!("{e}{}", format_stderr_suffix(&stderr_ctx)),
                })
            }
        }
    }

    async fn list_tools(&self) -> Result<serde_json::Value, McpError> {
        self.collect_pages("tools/list", "tools").await
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, McpError> {
        let params = serde_json::json!({
            "name": name,
            "arguments": arguments,
        });
        self.call("tools/call", Some(params)).await
    }

    async fn list_resources(&self) -> Result<serde_json::Value, McpError> {
        self.collect_pages("resources/list", "resources").await
    }

    async fn read_resource(&self, uri: &str) -> Result<serde_json::Value, McpError> {
        self.call("resources/read", Some(serde_json::json!({ "uri": uri })))
            .await
    }

    async fn list_prompts(&self) -> Result<serde_json::Value, McpError> {
        self.collect_pages("prompts/list", "prompts").await
    }

    async fn get_prompt(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, McpError> {
        let params = serde_json::json!({
            "name": name,
            "arguments": arguments,
        });
        self.call("prompts/get", Some(params)).await
    }

    async fn close(&self) {
        let Some(mut child) = self.process.lock().await.take() else {
            return;
        };

        // Closing stdin asks a well-behaved server to exit. With a call in
        // flight the pipes stay locked; the kill below unblocks it.
        let graceful = self.transport.try_close();

        if graceful {
            match tokio::time::timeout(self.shutdown_timeout, child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::debug!(server = %self.server_id, %status, "server exited");
                    return;
                }
                Ok(Err(e)) => {
                    tracing::warn!(server = %self.server_id, error = %e, "failed to wait for server");
                }
                Err(_) => {
                    tracing::warn!(
                        server = %self.server_id,
                        timeout_secs = self.shutdown_timeout.as_secs(),
                        "server did not exit after stdin closed, killing"
                    );
                }
            }
        }

        if let Err(e) = child.kill().await {
            tracing::warn!(server = %self.server_id, error = %e, "failed to kill server process");
        }
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }
}

// ─── Spawning ────────────────────────────────────────────────────────────────

/// `Connector` that spawns servers as child processes speaking stdio JSON-RPC.
#[derive(Debug, Clone)]
pub struct StdioConnector {
    shutdown_timeout: Duration,
}

impl StdioConnector {
    pub fn new(shutdown_timeout: Duration) -> Self {
        Self { shutdown_timeout }
    }
}

impl Default for StdioConnector {
    fn default() -> Self {
        Self::new(DEFAULT_SHUTDOWN_TIMEOUT)
    }
}

#[async_trait]
impl Connector for StdioConnector {
    async fn launch(
        &self,
        server_id: &str,
        spec: &LaunchSpec,
    ) -> Result<Arc<dyn McpSession>, McpError> {
        let session = spawn_server(server_id, spec, self.shutdown_timeout)?;
        Ok(Arc::new(session))
    }
}

/// Spawn a single MCP server process and wire its stdio.
///
/// The handshake is left to the caller so it can be bounded by a timeout.
pub fn spawn_server(
    server_id: &str,
    spec: &LaunchSpec,
    shutdown_timeout: Duration,
) -> Result<StdioSession, McpError> {
    let mut cmd = Command::new(&spec.command);
    cmd.args(&spec.args);
    cmd.env_clear();
    cmd.envs(&spec.env);

    if let Some(dir) = spec.cwd.as_deref() {
        cmd.current_dir(dir);
    }

    // Windows: prevent console window from appearing for child processes
    #[cfg(target_os = "windows")]
    {
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    cmd.stdin(std::process::Stdio::piped());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
        name: server_id.to_string(),
        reason: format!("{}: {e}", spec.command),
    })?;

    let stdin = child.stdin.take().ok_or(McpError::SpawnFailed {
        name: server_id.to_string(),
        reason: "failed to capture stdin".into(),
    })?;

    let stdout = child.stdout.take().ok_or(McpError::SpawnFailed {
        name: server_id.to_string(),
        reason: "failed to capture stdout".into(),
    })?;

    let stderr_tail = Arc::new(parking_lot::Mutex::new(VecDeque::new()));
    if let Some(stderr) = child.stderr.take() {
        drain_stderr(server_id, stderr, Arc::clone(&stderr_tail));
    }

    let pid = child.id();
    tracing::debug!(
        server = server_id,
        command = %spec.command,
        args = ?spec.args,
        pid,
        "spawned MCP server process"
    );

    Ok(StdioSession {
        server_id: server_id.to_string(),
        process: tokio::sync::Mutex::new(Some(child)),
        pid,
        transport: StdioTransport::new(server_id, stdin, stdout),
        stderr_tail,
        shutdown_timeout,
    })
}

/// Forward server stderr to the debug log and keep the last lines.
///
/// An undrained stderr pipe fills up and blocks a chatty server.
fn drain_stderr(
    server_id: &str,
    stderr: ChildStderr,
    tail: Arc<parking_lot::Mutex<VecDeque<String>>>,
) {
    let server_id = server_id.to_string();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(server = %server_id, line = %line, "server stderr");
            let mut tail = tail.lock();
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
    });
}

/// Format a stderr suffix for error messages (empty string if no stderr).
fn format_stderr_suffix(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(" | stderr: {}", stderr.trim())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

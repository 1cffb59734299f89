//! Connection manager: live sessions with every connected MCP server.
//!
//! Owns at most one connection per server id. Connect, close and reconnect
//! for one server serialize on that server's lifecycle lock; different
//! servers proceed concurrently. Lookups read a synchronous table and never
//! wait behind an in-flight connect.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::errors::McpError;
use super::launch::LaunchSpec;
use super::lifecycle::{Connector, McpSession, StdioConnector};
use super::registry::ServerRegistry;
use super::tool_list::normalize_tool_list;
use super::types::{
    ConnectParams, ConnectionState, PromptDescriptor, PromptResult, ResourceContents,
    ResourceDescriptor, ToolDescriptor, ToolOutput,
};
use crate::config::ManagerSettings;

// ─── Connection Table ────────────────────────────────────────────────────────

/// A live, initialized session and the tools it reported.
struct Connection {
    session: Arc<dyn McpSession>,
    tools: Vec<ToolDescriptor>,
    connected_at: DateTime<Utc>,
    /// Distinguishes successive connections to the same server.
    generation: u64,
}

struct ServerEntry {
    state: ConnectionState,
    connection: Option<Connection>,
}

/// Snapshot of one server's connection for status displays.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ConnectionInfo {
    pub server_id: String,
    pub state: ConnectionState,
    pub tool_count: usize,
    pub connected_at: Option<DateTime<Utc>>,
    pub pid: Option<u32>,
}

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

// ─── ConnectionManager ───────────────────────────────────────────────────────

pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    registry: Arc<ServerRegistry>,
    settings: ManagerSettings,
    lifecycle_locks: parking_lot::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    servers: parking_lot::RwLock<HashMap<String, ServerEntry>>,
}

impl ConnectionManager {
    /// Create a manager that launches servers as stdio child processes.
    pub fn new(registry: Arc<ServerRegistry>, settings: ManagerSettings) -> Self {
        let connector = Arc::new(StdioConnector::new(settings.shutdown_timeout()));
        Self::with_connector(connector, registry, settings)
    }

    /// Create a manager with a custom session connector.
    pub fn with_connector(
        connector: Arc<dyn Connector>,
        registry: Arc<ServerRegistry>,
        settings: ManagerSettings,
    ) -> Self {
        Self {
            connector,
            registry,
            settings,
            lifecycle_locks: parking_lot::Mutex::new(HashMap::new()),
            servers: parking_lot::RwLock::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Connect to a server, replacing any existing connection to it.
    ///
    /// Launch parameters come from `params`, falling back to the registry
    /// entry. On failure the new session is torn down and no connection is
    /// recorded.
    pub async fn connect_to_server(
        &self,
        server_id: &str,
        params: ConnectParams,
    ) -> Result<Vec<ToolDescriptor>, McpError> {
        let lock = self.lifecycle_lock(server_id);
        let result = {
            let _guard = lock.lock().await;
            self.connect_locked(server_id, &params).await
        };
        self.release_lifecycle_lock(server_id, lock);
        result
    }

    /// Close the connection to a server. No-op when not connected.
    pub async fn close_server(&self, server_id: &str) {
        let lock = self.lifecycle_lock(server_id);
        {
            let _guard = lock.lock().await;
            self.close_locked(server_id).await;
        }
        self.release_lifecycle_lock(server_id, lock);
    }

    /// Close every connection. Safe to call repeatedly.
    pub async fn close_all(&self) {
        let ids: Vec<String> = self.servers.read().keys().cloned().collect();
        if ids.is_empty() {
            return;
        }

        tracing::info!(count = ids.len(), "closing all MCP connections");
        futures::future::join_all(ids.iter().map(|id| self.close_server(id))).await;
    }

    /// Connect every registered server concurrently.
    ///
    /// Returns the servers that failed; the others stay connected.
    pub async fn connect_registered(&self) -> Vec<(String, McpError)> {
        let ids: Vec<String> = self
            .registry
            .list_servers()
            .into_iter()
            .map(|s| s.id)
            .collect();

        let results = futures::future::join_all(ids.iter().map(|id| async move {
            let result = self
                .connect_to_server(id, ConnectParams::default())
                .await;
            (id.clone(), result)
        }))
        .await;

        let failures: Vec<(String, McpError)> = results
            .into_iter()
            .filter_map(|(id, result)| result.err().map(|e| (id, e)))
            .collect();

        tracing::info!(
            registered = ids.len(),
            failed = failures.len(),
            "connected registered MCP servers"
        );
        failures
    }

    // ─── Lookups ─────────────────────────────────────────────────────────

    /// Tools of every connected server.
    pub fn get_all_tools(&self) -> Vec<ToolDescriptor> {
        let servers = self.servers.read();
        let mut ids: Vec<&String> = servers.keys().collect();
        ids.sort();
        ids.into_iter()
            .filter_map(|id| servers[id].connection.as_ref())
            .flat_map(|conn| conn.tools.iter().cloned())
            .collect()
    }

    /// Tools of one server (empty when not connected).
    pub fn get_server_tools(&self, server_id: &str) -> Vec<ToolDescriptor> {
        self.servers
            .read()
            .get(server_id)
            .and_then(|entry| entry.connection.as_ref())
            .map(|conn| conn.tools.clone())
            .unwrap_or_default()
    }

    pub fn get_tool_by_name(&self, server_id: &str, tool_name: &str) -> Option<ToolDescriptor> {
        self.servers
            .read()
            .get(server_id)
            .and_then(|entry| entry.connection.as_ref())
            .and_then(|conn| conn.tools.iter().find(|t| t.name == tool_name).cloned())
    }

    pub fn is_connected(&self, server_id: &str) -> bool {
        self.servers
            .read()
            .get(server_id)
            .is_some_and(|entry| entry.connection.is_some())
    }

    /// Ids of connected servers, sorted.
    pub fn connected_servers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .servers
            .read()
            .iter()
            .filter(|(_, entry)| entry.connection.is_some())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn connection_state(&self, server_id: &str) -> ConnectionState {
        self.servers
            .read()
            .get(server_id)
            .map(|entry| entry.state)
            .unwrap_or(ConnectionState::Disconnected)
    }

    /// Status snapshot of one server.
    pub fn connection_info(&self, server_id: &str) -> ConnectionInfo {
        let servers = self.servers.read();
        let entry = servers.get(server_id);
        let conn = entry.and_then(|e| e.connection.as_ref());
        ConnectionInfo {
            server_id: server_id.to_string(),
            state: entry.map(|e| e.state).unwrap_or(ConnectionState::Disconnected),
            tool_count: conn.map(|c| c.tools.len()).unwrap_or(0),
            connected_at: conn.map(|c| c.connected_at),
            pid: conn.and_then(|c| c.session.pid()),
        }
    }

    // ─── Health & Execution ──────────────────────────────────────────────

    /// Probe a connection with `tools/list`. Never changes connection state.
    pub async fn check_connection_health(&self, server_id: &str) -> bool {
        match self.live_session(server_id) {
            Some((session, _)) => self.probe(server_id, session.as_ref()).await,
            None => false,
        }
    }

    /// Execute a tool, connecting first if needed.
    ///
    /// Transient failures are retried up to `max_retries` more times, each
    /// retry preceded by closing the failed connection and waiting
    /// `retry_delay`. Other failures propagate immediately.
    pub async fn execute_tool(
        &self,
        server_id: &str,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolOutput, McpError> {
        let output = self
            .with_retries(server_id, tool_name, move |session| {
                self.call_tool_on(server_id, session, tool_name, arguments.clone())
            })
            .await?;
        tracing::debug!(
            server = server_id,
            tool = tool_name,
            is_error = output.is_error,
            "tool call completed"
        );
        Ok(output)
    }

    // ─── Resources & Prompts ─────────────────────────────────────────────

    /// Resources advertised by a server, connecting first if needed.
    pub async fn list_resources(&self, server_id: &str) -> Result<Vec<ResourceDescriptor>, McpError> {
        let timeout = self.settings.tool_timeout();
        let raw = self
            .with_retries(server_id, "resources/list", move |session| async move {
                bounded(server_id, "resources/list", timeout, session.list_resources()).await
            })
            .await?;

        let mut resources: Vec<ResourceDescriptor> =
            parse_listing(server_id, "resources/list", "resources", raw)?;
        for resource in &mut resources {
            resource.server_id = server_id.to_string();
        }
        Ok(resources)
    }

    /// Read one resource by URI.
    pub async fn read_resource(
        &self,
        server_id: &str,
        uri: &str,
    ) -> Result<Vec<ResourceContents>, McpError> {
        let timeout = self.settings.tool_timeout();
        let raw = self
            .with_retries(server_id, "resources/read", move |session| async move {
                bounded(server_id, "resources/read", timeout, session.read_resource(uri)).await
            })
            .await?;
        parse_listing(server_id, "resources/read", "contents", raw)
    }

    /// Prompt templates advertised by a server, connecting first if needed.
    pub async fn list_prompts(&self, server_id: &str) -> Result<Vec<PromptDescriptor>, McpError> {
        let timeout = self.settings.tool_timeout();
        let raw = self
            .with_retries(server_id, "prompts/list", move |session| async move {
                bounded(server_id, "prompts/list", timeout, session.list_prompts()).await
            })
            .await?;

        let mut prompts: Vec<PromptDescriptor> =
            parse_listing(server_id, "prompts/list", "prompts", raw)?;
        for prompt in &mut prompts {
            prompt.server_id = server_id.to_string();
        }
        Ok(prompts)
    }

    /// Render a prompt with the given arguments.
    pub async fn get_prompt(
        &self,
        server_id: &str,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<PromptResult, McpError> {
        let timeout = self.settings.tool_timeout();
        let raw = self
            .with_retries(server_id, "prompts/get", move |session| {
                let arguments = arguments.clone();
                async move {
                    bounded(server_id, "prompts/get", timeout, session.get_prompt(name, arguments))
                        .await
                }
            })
            .await?;
        serde_json::from_value(raw).map_err(|e| McpError::MalformedResponse {
            server: server_id.to_string(),
            method: "prompts/get".into(),
            reason: e.to_string(),
        })
    }

    // ─── Internals ───────────────────────────────────────────────────────

    fn lifecycle_lock(&self, server_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(
            self.lifecycle_locks
                .lock()
                .entry(server_id.to_string())
                .or_default(),
        )
    }

    /// Drop an idle lock slot so arbitrary ids don't accumulate.
    ///
    /// Slots are only cloned under the map lock, so a count of two (the map
    /// and `lock`) means nobody else holds or waits on it.
    fn release_lifecycle_lock(&self, server_id: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.lifecycle_locks.lock();
        let idle = locks
            .get(server_id)
            .is_some_and(|slot| Arc::ptr_eq(slot, &lock) && Arc::strong_count(&lock) == 2);
        if idle {
            locks.remove(server_id);
        }
    }

    fn live_session(&self, server_id: &str) -> Option<(Arc<dyn McpSession>, u64)> {
        self.servers
            .read()
            .get(server_id)
            .and_then(|entry| entry.connection.as_ref())
            .map(|conn| (Arc::clone(&conn.session), conn.generation))
    }

    fn set_state(&self, server_id: &str, state: ConnectionState) {
        self.servers
            .write()
            .entry(server_id.to_string())
            .or_insert(ServerEntry {
                state,
                connection: None,
            })
            .state = state;
    }

    async fn probe(&self, server_id: &str, session: &dyn McpSession) -> bool {
        match tokio::time::timeout(self.settings.health_check_timeout(), session.list_tools()).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                tracing::debug!(server = server_id, error = %e, "health check failed");
                false
            }
            Err(_) => {
                tracing::debug!(server = server_id, "health check timed out");
                false
            }
        }
    }

    /// Caller holds the server's lifecycle lock.
    async fn connect_locked(
        &self,
        server_id: &str,
        params: &ConnectParams,
    ) -> Result<Vec<ToolDescriptor>, McpError> {
        self.close_locked(server_id).await;
        self.set_state(server_id, ConnectionState::Connecting);

        match self.open_session(server_id, params).await {
            Ok((session, tools)) => {
                let tool_count = tools.len();
                {
                    let mut servers = self.servers.write();
                    servers.insert(
                        server_id.to_string(),
                        ServerEntry {
                            state: ConnectionState::Connected,
                            connection: Some(Connection {
                                session,
                                tools: tools.clone(),
                                connected_at: Utc::now(),
                                generation: NEXT_GENERATION.fetch_add(1, Ordering::Relaxed),
                            }),
                        },
                    );
                }
                self.registry.mark_connected(server_id);
                tracing::info!(server = server_id, tool_count, "MCP server connected");
                Ok(tools)
            }
            Err(e) => {
                self.set_state(server_id, ConnectionState::Failed);
                let err = McpError::connect_failed(server_id, e);
                tracing::warn!(server = server_id, error = %err, "MCP server connection failed");
                Err(err)
            }
        }
    }

    /// Launch, initialize and list tools. The session is closed on any failure.
    async fn open_session(
        &self,
        server_id: &str,
        params: &ConnectParams,
    ) -> Result<(Arc<dyn McpSession>, Vec<ToolDescriptor>), McpError> {
        let registered = self.registry.get_server(server_id);
        let spec = LaunchSpec::resolve(server_id, params, registered.as_ref(), std::env::vars())?;

        tracing::debug!(
            server = server_id,
            command = %spec.command,
            args = ?spec.args,
            "connecting to MCP server"
        );

        let session = self.connector.launch(server_id, &spec).await?;
        let timeout = self.settings.connect_timeout();

        let discovered = async {
            bounded(server_id, "initialize", timeout, session.initialize()).await?;
            let raw = bounded(server_id, "tools/list", timeout, session.list_tools()).await?;
            normalize_tool_list(server_id, &raw, self.settings.malformed_tools)
        }
        .await;

        match discovered {
            Ok(tools) => Ok((session, tools)),
            Err(e) => {
                session.close().await;
                Err(e)
            }
        }
    }

    /// Caller holds the server's lifecycle lock.
    async fn close_locked(&self, server_id: &str) {
        let removed = self.servers.write().remove(server_id);
        let Some(conn) = removed.and_then(|entry| entry.connection) else {
            tracing::debug!(server = server_id, "no connection to close");
            return;
        };

        conn.session.close().await;
        self.registry.mark_disconnected(server_id);
        tracing::info!(server = server_id, "MCP server connection closed");
    }

    /// Return a healthy session and its generation, reconnecting from the
    /// registry if needed.
    async fn ensure_connected(
        &self,
        server_id: &str,
    ) -> Result<(Arc<dyn McpSession>, u64), McpError> {
        let stale = match self.live_session(server_id) {
            Some((session, generation)) => {
                if self.probe(server_id, session.as_ref()).await {
                    return Ok((session, generation));
                }
                tracing::warn!(server = server_id, "health check failed, reconnecting");
                Some(generation)
            }
            None => None,
        };

        if self.registry.get_server(server_id).is_none() {
            return Err(McpError::ConfigError {
                reason: format!("no configuration for server '{server_id}'"),
            });
        }

        let lock = self.lifecycle_lock(server_id);
        let result = {
            let _guard = lock.lock().await;

            // Another caller may have reconnected while we waited.
            match self.live_session(server_id) {
                Some(live) if stale != Some(live.1) => Ok(live),
                _ => match self.connect_locked(server_id, &ConnectParams::default()).await {
                    Ok(_) => self.live_session(server_id).ok_or_else(|| McpError::NotConnected {
                        server: server_id.to_string(),
                    }),
                    Err(e) => Err(e),
                },
            }
        };
        self.release_lifecycle_lock(server_id, lock);
        result
    }

    /// Close the connection only if it is still the one that failed.
    async fn close_generation(&self, server_id: &str, generation: u64) {
        let lock = self.lifecycle_lock(server_id);
        {
            let _guard = lock.lock().await;
            match self.live_session(server_id) {
                Some((_, live)) if live == generation => self.close_locked(server_id).await,
                _ => tracing::debug!(
                    server = server_id,
                    generation,
                    "failed connection already replaced"
                ),
            }
        }
        self.release_lifecycle_lock(server_id, lock);
    }

    /// Run `call` against a connected session with reconnect-and-retry on
    /// transient failures.
    async fn with_retries<T, F, Fut>(
        &self,
        server_id: &str,
        operation: &str,
        mut call: F,
    ) -> Result<T, McpError>
    where
        F: FnMut(Arc<dyn McpSession>) -> Fut,
        Fut: std::future::Future<Output = Result<T, McpError>>,
    {
        let attempts = self.settings.max_retries + 1;
        let mut last_error: Option<McpError> = None;
        let mut failed_generation: Option<u64> = None;

        for attempt in 1..=attempts {
            if attempt > 1 {
                if let Some(generation) = failed_generation.take() {
                    self.close_generation(server_id, generation).await;
                }
                tokio::time::sleep(self.settings.retry_delay()).await;
                tracing::info!(server = server_id, operation, attempt, "retrying");
            }

            let outcome = match self.ensure_connected(server_id).await {
                Ok((session, generation)) => call(session).await.map_err(|e| (e, Some(generation))),
                Err(e) => Err((e, None)),
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err((e, generation)) if e.is_transient() => {
                    tracing::warn!(
                        server = server_id,
                        operation,
                        attempt,
                        max_attempts = attempts,
                        error = %e,
                        "call failed with transient error"
                    );
                    failed_generation = generation;
                    last_error = Some(e);
                }
                Err((e, _)) => {
                    tracing::error!(server = server_id, operation, error = %e, "call failed");
                    return Err(e);
                }
            }
        }

        let last_error = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "all retries exhausted".to_string());
        tracing::error!(
            server = server_id,
            operation,
            attempts,
            last_error = %last_error,
            "retries exhausted"
        );
        Err(McpError::RetriesExhausted {
            server: server_id.to_string(),
            operation: operation.to_string(),
            attempts,
            last_error,
        })
    }

    async fn call_tool_on(
        &self,
        server_id: &str,
        session: Arc<dyn McpSession>,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolOutput, McpError> {
        if self.get_tool_by_name(server_id, tool_name).is_none() {
            return Err(McpError::UnknownTool {
                server: server_id.to_string(),
                name: tool_name.to_string(),
                available: self
                    .get_server_tools(server_id)
                    .into_iter()
                    .map(|t| t.name)
                    .collect(),
            });
        }

        let raw = bounded(
            server_id,
            "tools/call",
            self.settings.tool_timeout(),
            session.call_tool(tool_name, arguments),
        )
        .await?;
        Ok(ToolOutput::from_result(raw))
    }
}

/// Items of a list-style result: `{key: [..]}`, a bare array, or `null`.
fn parse_listing<T: serde::de::DeserializeOwned>(
    server_id: &str,
    method: &str,
    key: &str,
    raw: serde_json::Value,
) -> Result<Vec<T>, McpError> {
    let malformed = |reason: String| McpError::MalformedResponse {
        server: server_id.to_string(),
        method: method.to_string(),
        reason,
    };

    let items = match raw {
        serde_json::Value::Null => return Ok(Vec::new()),
        serde_json::Value::Array(items) => items,
        serde_json::Value::Object(mut map) => match map.remove(key) {
            Some(serde_json::Value::Array(items)) => items,
            Some(serde_json::Value::Null) | None => Vec::new(),
            Some(other) => return Err(malformed(format!("'{key}' is not an array: {other}"))),
        },
        other => return Err(malformed(format!("unexpected result: {other}"))),
    };

    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| {
            serde_json::from_value(item).map_err(|e| malformed(format!("entry {i}: {e}")))
        })
        .collect()
}

/// Bound an RPC future, mapping expiry to `McpError::Timeout`.
async fn bounded<T>(
    server_id: &str,
    operation: &str,
    timeout: Duration,
    fut: impl std::future::Future<Output = Result<T, McpError>>,
) -> Result<T, McpError> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(McpError::Timeout {
            server: server_id.to_string(),
            operation: operation.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::types::NewServer;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicU32};

    /// Shared knobs and counters for the mock server.
    #[derive(Default)]
    struct Script {
        launches: AtomicU32,
        closes: AtomicU32,
        /// Number of upcoming `tools/call` requests that never answer.
        hang_calls: AtomicU32,
        hang_initialize: AtomicBool,
        call_error: parking_lot::Mutex<Option<McpError>>,
        tools: parking_lot::Mutex<Option<serde_json::Value>>,
    }

    impl Script {
        fn tools_json(&self) -> serde_json::Value {
            self.tools.lock().clone().unwrap_or_else(|| {
                json!({"tools": [{
                    "name": "add",
                    "description": "Adds two numbers",
                    "inputSchema": {"type": "object"}
                }]})
            })
        }
    }

    struct MockSession {
        script: Arc<Script>,
        closed: AtomicBool,
    }

    #[async_trait]
    impl McpSession for MockSession {
        async fn initialize(&self) -> Result<(), McpError> {
            if self.script.hang_initialize.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            tokio::task::yield_now().await;
            Ok(())
        }

        async fn list_tools(&self) -> Result<serde_json::Value, McpError> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(McpError::TransportError {
                    server: "mock".into(),
                    reason: "transport closed".into(),
                });
            }
            Ok(self.script.tools_json())
        }

        async fn call_tool(
            &self,
            _name: &str,
            arguments: serde_json::Value,
        ) -> Result<serde_json::Value, McpError> {
            let hang = self
                .script
                .hang_calls
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if hang {
                std::future::pending::<()>().await;
            }
            if let Some(err) = self.script.call_error.lock().take() {
                return Err(err);
            }
            let sum = arguments["a"].as_i64().unwrap_or(0) + arguments["b"].as_i64().unwrap_or(0);
            Ok(json!({"content": [{"type": "text", "text": sum.to_string()}]}))
        }

        async fn list_resources(&self) -> Result<serde_json::Value, McpError> {
            Ok(json!({"resources": [{
                "uri": "calc://constants",
                "name": "constants",
                "mimeType": "application/json"
            }]}))
        }

        async fn read_resource(&self, uri: &str) -> Result<serde_json::Value, McpError> {
            if uri != "calc://constants" {
                return Err(McpError::ServerError {
                    code: -32602,
                    message: format!("unknown resource: {uri}"),
                    data: None,
                });
            }
            Ok(json!({"contents": [{"uri": uri, "text": "{\"pi\": 3.14159}"}]}))
        }

        async fn list_prompts(&self) -> Result<serde_json::Value, McpError> {
            Ok(json!({"prompts": [{
                "name": "explain",
                "arguments": [{"name": "expression", "required": true}]
            }]}))
        }

        async fn get_prompt(
            &self,
            _name: &str,
            arguments: serde_json::Value,
        ) -> Result<serde_json::Value, McpError> {
            let expression = arguments["expression"].as_str().unwrap_or_default();
            Ok(json!({"messages": [{
                "role": "user",
                "content": {"type": "text", "text": format!("Explain {expression}")}
            }]}))
        }

        async fn close(&self) {
            if !self.closed.swap(true, Ordering::SeqCst) {
                self.script.closes.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    struct MockConnector {
        script: Arc<Script>,
    }

    #[async_trait]
    impl Connector for MockConnector {
        async fn launch(
            &self,
            _server_id: &str,
            _spec: &LaunchSpec,
        ) -> Result<Arc<dyn McpSession>, McpError> {
            self.script.launches.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(MockSession {
                script: Arc::clone(&self.script),
                closed: AtomicBool::new(false),
            }))
        }
    }

    fn fast_settings() -> ManagerSettings {
        ManagerSettings {
            connect_timeout_ms: 200,
            tool_timeout_ms: 100,
            health_check_timeout_ms: 100,
            shutdown_timeout_ms: 100,
            max_retries: 2,
            retry_delay_ms: 10,
            ..Default::default()
        }
    }

    async fn setup() -> (ConnectionManager, Arc<Script>, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let registry = Arc::new(ServerRegistry::in_data_dir(tmp.path()));
        registry
            .add_server(NewServer {
                name: Some("calc".into()),
                command: "calc_server".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        let script = Arc::new(Script::default());
        let manager = ConnectionManager::with_connector(
            Arc::new(MockConnector {
                script: Arc::clone(&script),
            }),
            registry,
            fast_settings(),
        );
        (manager, script, tmp)
    }

    #[tokio::test]
    async fn test_connect_records_tools_and_state() {
        let (manager, _script, _tmp) = setup().await;
        assert_eq!(manager.connection_state("calc"), ConnectionState::Disconnected);

        let tools = manager
            .connect_to_server("calc", ConnectParams::default())
            .await
            .unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].server_id, "calc");

        assert!(manager.is_connected("calc"));
        assert_eq!(manager.connection_state("calc"), ConnectionState::Connected);
        assert_eq!(manager.connected_servers(), vec!["calc"]);
        assert!(manager.get_tool_by_name("calc", "add").is_some());
        assert!(manager.get_tool_by_name("calc", "mul").is_none());
        assert_eq!(manager.get_all_tools().len(), 1);
        assert_eq!(
            manager.registry().get_server("calc").unwrap().status,
            crate::mcp_client::types::ServerStatus::Connected
        );
    }

    #[tokio::test]
    async fn test_reconnect_closes_previous_session() {
        let (manager, script, _tmp) = setup().await;
        manager.connect_to_server("calc", ConnectParams::default()).await.unwrap();
        manager.connect_to_server("calc", ConnectParams::default()).await.unwrap();

        assert_eq!(script.launches.load(Ordering::SeqCst), 2);
        assert_eq!(script.closes.load(Ordering::SeqCst), 1);
        assert_eq!(manager.connected_servers().len(), 1);
    }

    #[tokio::test]
    async fn test_connect_without_command_is_config_error() {
        let (manager, script, _tmp) = setup().await;
        let err = manager
            .connect_to_server("unregistered", ConnectParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::ConfigError { .. }));
        assert_eq!(script.launches.load(Ordering::SeqCst), 0);
        assert!(!manager.is_connected("unregistered"));
    }

    #[tokio::test]
    async fn test_initialize_timeout_tears_down_session() {
        let (manager, script, _tmp) = setup().await;
        script.hang_initialize.store(true, Ordering::SeqCst);

        let err = manager
            .connect_to_server("calc", ConnectParams::default())
            .await
            .unwrap_err();
        match &err {
            McpError::ConnectFailed { server, source } => {
                assert_eq!(server, "calc");
                assert!(matches!(**source, McpError::Timeout { .. }));
            }
            other => panic!("expected ConnectFailed, got {other}"),
        }
        assert_eq!(script.closes.load(Ordering::SeqCst), 1);
        assert!(!manager.is_connected("calc"));
        assert_eq!(manager.connection_state("calc"), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_malformed_tool_list_tears_down_session() {
        let (manager, script, _tmp) = setup().await;
        *script.tools.lock() = Some(json!("add"));

        let err = manager
            .connect_to_server("calc", ConnectParams::default())
            .await
            .unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(script.closes.load(Ordering::SeqCst), 1);
        assert!(manager.get_server_tools("calc").is_empty());
    }

    #[tokio::test]
    async fn test_execute_connects_never_connected_server() {
        let (manager, script, _tmp) = setup().await;
        let output = manager
            .execute_tool("calc", "add", json!({"a": 2, "b": 3}))
            .await
            .unwrap();
        assert_eq!(output.to_value(), json!(5));
        assert_eq!(script.launches.load(Ordering::SeqCst), 1);
        assert!(manager.is_connected("calc"));
    }

    #[tokio::test]
    async fn test_execute_unregistered_server_is_terminal() {
        let (manager, script, _tmp) = setup().await;
        let err = manager
            .execute_tool("ghost", "add", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::ConfigError { .. }));
        assert_eq!(script.launches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_tool_lists_available_tools() {
        let (manager, _script, _tmp) = setup().await;
        let err = manager
            .execute_tool("calc", "multiply", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::RetriesExhausted { attempts: 3, .. }));
        let msg = err.to_string();
        assert!(msg.contains("multiply"), "got: {msg}");
        assert!(msg.contains("Available: [add]"), "got: {msg}");
    }

    #[tokio::test]
    async fn test_two_timeouts_then_success_reconnects_twice() {
        let (manager, script, _tmp) = setup().await;
        manager.connect_to_server("calc", ConnectParams::default()).await.unwrap();
        script.hang_calls.store(2, Ordering::SeqCst);

        let output = manager
            .execute_tool("calc", "add", json!({"a": 2, "b": 3}))
            .await
            .unwrap();
        assert_eq!(output.to_value(), json!(5));
        // one initial connect plus two reconnects
        assert_eq!(script.launches.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_persistent_timeouts_exhaust_retries() {
        let (manager, script, _tmp) = setup().await;
        script.hang_calls.store(10, Ordering::SeqCst);

        let err = manager
            .execute_tool("calc", "add", json!({"a": 1, "b": 1}))
            .await
            .unwrap_err();
        match err {
            McpError::RetriesExhausted {
                attempts,
                last_error,
                ..
            } => {
                assert_eq!(attempts, 3);
                assert!(last_error.contains("timed out"), "got: {last_error}");
            }
            other => panic!("expected RetriesExhausted, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_server_error_is_not_retried() {
        let (manager, script, _tmp) = setup().await;
        *script.call_error.lock() = Some(McpError::ServerError {
            code: -32602,
            message: "invalid params".into(),
            data: None,
        });

        let err = manager
            .execute_tool("calc", "add", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::ServerError { code: -32602, .. }));
        assert_eq!(script.launches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_health_check() {
        let (manager, _script, _tmp) = setup().await;
        assert!(!manager.check_connection_health("calc").await);

        manager.connect_to_server("calc", ConnectParams::default()).await.unwrap();
        assert!(manager.check_connection_health("calc").await);
        assert_eq!(manager.connection_state("calc"), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_close_all_is_idempotent() {
        let (manager, script, _tmp) = setup().await;
        for id in ["a", "b", "c"] {
            manager
                .connect_to_server(
                    id,
                    ConnectParams {
                        command: Some("calc_server".into()),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        }
        assert_eq!(manager.connected_servers(), vec!["a", "b", "c"]);

        manager.close_all().await;
        assert!(manager.connected_servers().is_empty());
        assert!(manager.get_all_tools().is_empty());
        assert_eq!(script.closes.load(Ordering::SeqCst), 3);

        manager.close_all().await;
        assert_eq!(script.closes.load(Ordering::SeqCst), 3);
        manager.close_server("a").await;
    }

    #[tokio::test]
    async fn test_connect_registered_reports_failures() {
        let (manager, _script, _tmp) = setup().await;
        manager
            .registry()
            .add_server(NewServer {
                name: Some("weather".into()),
                command: "weather_server".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        let failures = manager.connect_registered().await;
        assert!(failures.is_empty());
        assert_eq!(manager.connected_servers(), vec!["calc", "weather"]);

        let info = manager.connection_info("weather");
        assert_eq!(info.state, ConnectionState::Connected);
        assert_eq!(info.tool_count, 1);
        assert!(info.connected_at.is_some());
    }

    #[tokio::test]
    async fn test_retry_keeps_connection_made_by_another_caller() {
        let (manager, script, _tmp) = setup().await;
        manager.connect_to_server("calc", ConnectParams::default()).await.unwrap();
        script.hang_calls.store(1, Ordering::SeqCst);

        let reconnect = async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            manager
                .connect_to_server("calc", ConnectParams::default())
                .await
                .unwrap();
        };
        let (output, ()) = tokio::join!(
            manager.execute_tool("calc", "add", json!({"a": 2, "b": 3})),
            reconnect
        );

        assert_eq!(output.unwrap().to_value(), json!(5));
        // the retry reused the newer session instead of replacing it
        assert_eq!(script.launches.load(Ordering::SeqCst), 2);
        assert_eq!(script.closes.load(Ordering::SeqCst), 1);
        assert!(manager.is_connected("calc"));
    }

    #[tokio::test]
    async fn test_concurrent_connects_keep_one_session() {
        let (manager, script, _tmp) = setup().await;

        let (a, b, c, (), d) = tokio::join!(
            manager.connect_to_server("calc", ConnectParams::default()),
            manager.connect_to_server("calc", ConnectParams::default()),
            manager.connect_to_server("calc", ConnectParams::default()),
            manager.close_server("calc"),
            manager.connect_to_server("calc", ConnectParams::default()),
        );
        for result in [a, b, c, d] {
            result.unwrap();
        }

        let launches = script.launches.load(Ordering::SeqCst);
        let closes = script.closes.load(Ordering::SeqCst);
        assert_eq!(launches, 4);
        assert!(launches - closes <= 1, "launches={launches} closes={closes}");
        assert!(manager.connected_servers().len() <= 1);

        manager.close_all().await;
        assert_eq!(script.closes.load(Ordering::SeqCst), launches);
    }

    #[tokio::test]
    async fn test_idle_lifecycle_locks_are_released() {
        let (manager, _script, _tmp) = setup().await;
        for i in 0..16 {
            let err = manager
                .connect_to_server(&format!("ghost-{i}"), ConnectParams::default())
                .await
                .unwrap_err();
            assert!(matches!(err, McpError::ConfigError { .. }));
        }
        assert!(manager.lifecycle_locks.lock().is_empty());

        manager
            .execute_tool("calc", "add", json!({"a": 1, "b": 1}))
            .await
            .unwrap();
        manager.close_server("calc").await;
        assert!(manager.lifecycle_locks.lock().is_empty());
    }

    #[tokio::test]
    async fn test_resources_and_prompts() {
        let (manager, script, _tmp) = setup().await;

        let resources = manager.list_resources("calc").await.unwrap();
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].uri, "calc://constants");
        assert_eq!(resources[0].server_id, "calc");

        let contents = manager.read_resource("calc", "calc://constants").await.unwrap();
        assert_eq!(contents[0].text.as_deref(), Some("{\"pi\": 3.14159}"));

        let err = manager
            .read_resource("calc", "calc://missing")
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::ServerError { code: -32602, .. }));

        let prompts = manager.list_prompts("calc").await.unwrap();
        assert_eq!(prompts[0].name, "explain");
        assert_eq!(prompts[0].server_id, "calc");
        assert!(prompts[0].arguments[0].required);

        let rendered = manager
            .get_prompt("calc", "explain", json!({"expression": "2 + 3"}))
            .await
            .unwrap();
        assert_eq!(rendered.messages[0]["content"]["text"], "Explain 2 + 3");

        // one connection served every call
        assert_eq!(script.launches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_parse_listing_shapes() {
        let parse = |raw| parse_listing::<ResourceDescriptor>("calc", "resources/list", "resources", raw);

        assert!(parse(json!(null)).unwrap().is_empty());
        assert!(parse(json!({})).unwrap().is_empty());
        assert_eq!(parse(json!([{"uri": "a://1"}])).unwrap()[0].uri, "a://1");
        assert!(matches!(
            parse(json!({"resources": "a://1"})),
            Err(McpError::MalformedResponse { .. })
        ));
        assert!(matches!(
            parse(json!([{"name": "no uri"}])),
            Err(McpError::MalformedResponse { .. })
        ));
    }
}

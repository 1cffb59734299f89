//! Line-delimited JSON-RPC 2.0 over a pair of byte streams.
//!
//! Normally the streams are a server's stdin and stdout. Each message is one
//! JSON object on its own line; anything on stdout that is not a response
//! (banners, log lines, notifications, server-to-client requests) is skipped.
//!
//! One request/response exchange holds the transport lock from write to
//! matching read, so concurrent callers on the same session are serialized.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

use super::errors::McpError;
use super::types::{error_codes, JsonRpcRequest, JsonRpcResponse};

// ─── Transport ───────────────────────────────────────────────────────────────

type Writer = Box<dyn AsyncWrite + Send + Unpin>;
type Reader = BufReader<Box<dyn AsyncRead + Send + Unpin>>;

struct Pipes {
    writer: Writer,
    reader: Reader,
}

/// Bi-directional JSON-RPC transport over a pair of byte streams
/// (normally a child process's stdin/stdout).
pub struct StdioTransport {
    server_id: String,
    next_id: AtomicU64,
    pipes: Mutex<Option<Pipes>>,
}

impl StdioTransport {
    /// Create a new transport from a writable and a readable stream.
    pub fn new<W, R>(server_id: &str, writer: W, reader: R) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        let reader: Box<dyn AsyncRead + Send + Unpin> = Box::new(reader);
        Self {
            server_id: server_id.to_string(),
            next_id: AtomicU64::new(1),
            pipes: Mutex::new(Some(Pipes {
                writer: Box::new(writer),
                reader: BufReader::new(reader),
            })),
        }
    }

    /// Issue `method` and read until the response carrying its id arrives.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let line = encode_line(&JsonRpcRequest::new(id, method, params))
            .map_err(|e| self.error(format!("failed to encode {method} request: {e}")))?;

        let mut guard = self.pipes.lock().await;
        let pipes = guard
            .as_mut()
            .ok_or_else(|| self.error("transport closed".to_string()))?;

        write_line(&mut pipes.writer, &line)
            .await
            .map_err(|e| self.error(format!("failed to write to stdin: {e}")))?;

        let mut incoming = String::new();
        loop {
            incoming.clear();
            let n = pipes
                .reader
                .read_line(&mut incoming)
                .await
                .map_err(|e| self.error(format!("failed to read from stdout: {e}")))?;
            if n == 0 {
                return Err(self.error(
                    "server stdout closed (process may have exited)".to_string(),
                ));
            }

            let Ok(resp) = serde_json::from_str::<JsonRpcResponse>(incoming.trim()) else {
                if !incoming.trim().is_empty() {
                    tracing::trace!(server = %self.server_id, line = incoming.trim(), "non-response line");
                }
                continue;
            };
            if let Some(method) = &resp.method {
                tracing::debug!(server = %self.server_id, method = %method, "ignoring server request");
                continue;
            }
            if resp.id == id {
                return Ok(resp);
            }
            tracing::debug!(
                server = %self.server_id,
                expected = id,
                got = resp.id,
                "skipping response for another request"
            );
        }
    }

    /// Fire a notification: a message without an id, never answered.
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        let mut message = serde_json::Map::new();
        message.insert("jsonrpc".into(), "2.0".into());
        message.insert("method".into(), method.into());
        if let Some(params) = params {
            message.insert("params".into(), params);
        }

        let line = encode_line(&message)
            .map_err(|e| self.error(format!("failed to encode {method} notification: {e}")))?;

        let mut guard = self.pipes.lock().await;
        let pipes = guard
            .as_mut()
            .ok_or_else(|| self.error("transport closed".to_string()))?;

        write_line(&mut pipes.writer, &line)
            .await
            .map_err(|e| self.error(format!("failed to write notification: {e}")))
    }

    /// Drop both streams, closing the server's stdin.
    ///
    /// Returns `false` without closing when a request is in flight.
    pub fn try_close(&self) -> bool {
        match self.pipes.try_lock() {
            Ok(mut guard) => {
                guard.take();
                true
            }
            Err(_) => false,
        }
    }

    /// Whether `try_close` has already released the streams.
    pub async fn is_closed(&self) -> bool {
        self.pipes.lock().await.is_none()
    }

    fn error(&self, reason: String) -> McpError {
        McpError::TransportError {
            server: self.server_id.clone(),
            reason,
        }
    }
}

fn encode_line<T: serde::Serialize>(message: &T) -> serde_json::Result<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

async fn write_line(writer: &mut Writer, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Unwrap a response into its `result`, turning an `error` member into
/// `McpError::ServerError`.
pub fn extract_result(response: JsonRpcResponse) -> Result<serde_json::Value, McpError> {
    match (response.result, response.error) {
        (_, Some(err)) => Err(McpError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        }),
        (Some(result), None) => Ok(result),
        (None, None) => Err(McpError::ServerError {
            code: error_codes::INTERNAL_ERROR,
            message: "response has neither result nor error".into(),
            data: None,
        }),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

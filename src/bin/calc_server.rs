//! Calculator MCP server.
//!
//! A minimal stdio MCP server exposing `add` and `divide`, a
//! `calc://constants` resource and an `explain` prompt. Used as the
//! reference server in demos and integration tests.
//!
//! Fault injection for tests, via environment:
//! - `CALC_SERVER_EXIT_IMMEDIATELY=1`: exit before reading any request
//! - `CALC_SERVER_SILENT=1`: read requests but never answer
//! - `CALC_SERVER_HANG_CALLS=N` with `CALC_SERVER_STATE_FILE=path`: the first
//!   N `tools/call` requests (counted across launches) never answer
//! - `CALC_SERVER_TOOLS_SHAPE=wrapped|bare|tuple|null|invalid`: `tools/list` shape
//! - `CALC_SERVER_PAGE_SIZE=N`: paginate `tools/list` with `nextCursor`
//! - `CALC_SERVER_PID_FILE=path`: append the server's pid to this file

use std::io::{self, BufRead, Write};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

// ─── Protocol Types ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct JsonRpcRequest {
    id: Option<Value>,
    method: String,
    params: Option<Value>,
}

#[derive(Debug, Serialize)]
struct JsonRpcResponse {
    jsonrpc: &'static str,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Serialize)]
struct JsonRpcError {
    code: i32,
    message: String,
}

impl JsonRpcResponse {
    fn ok(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    fn err(id: Value, code: i32, message: String) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(JsonRpcError { code, message }),
        }
    }
}

// ─── Tools ───────────────────────────────────────────────────────────────────

fn tool_definitions() -> Vec<Value> {
    let operands = json!({
        "type": "object",
        "properties": {
            "a": {"type": "number"},
            "b": {"type": "number"}
        },
        "required": ["a", "b"]
    });
    vec![
        json!({"name": "add", "description": "Adds two numbers", "inputSchema": operands}),
        json!({"name": "divide", "description": "Divides a by b", "inputSchema": operands}),
    ]
}

fn tools_list(params: Option<&Value>) -> Value {
    let shape = std::env::var("CALC_SERVER_TOOLS_SHAPE").unwrap_or_default();
    let tools = tool_definitions();

    match shape.as_str() {
        "bare" => Value::Array(tools),
        "null" => Value::Null,
        "invalid" => json!("add,divide"),
        "tuple" => json!({"tools": tools
            .iter()
            .map(|t| json!([t["name"], t["description"], t["inputSchema"]]))
            .collect::<Vec<_>>()}),
        _ => {
            let page_size = std::env::var("CALC_SERVER_PAGE_SIZE")
                .ok()
                .and_then(|s| s.parse::<usize>().ok())
                .filter(|n| *n > 0)
                .unwrap_or(tools.len());
            let start = params
                .and_then(|p| p.get("cursor"))
                .and_then(|c| c.as_str())
                .and_then(|c| c.parse::<usize>().ok())
                .unwrap_or(0);
            let end = (start + page_size).min(tools.len());

            let mut result = json!({"tools": tools.get(start..end).unwrap_or_default()});
            if end < tools.len() {
                result["nextCursor"] = json!(end.to_string());
            }
            result
        }
    }
}

fn operand(args: &Value, key: &str) -> Result<f64> {
    args.get(key)
        .and_then(Value::as_f64)
        .with_context(|| format!("argument '{key}' must be a number"))
}

/// Render a number the way a user would write it (`5`, not `5.0`).
fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

fn call_tool(name: &str, args: &Value) -> Result<Value> {
    let a = operand(args, "a")?;
    let b = operand(args, "b")?;
    let value = match name {
        "add" => a + b,
        "divide" => {
            anyhow::ensure!(b != 0.0, "division by zero");
            a / b
        }
        other => anyhow::bail!("unknown tool: {other}"),
    };
    Ok(json!({"content": [{"type": "text", "text": format_number(value)}]}))
}

// ─── Resources & Prompts ─────────────────────────────────────────────────────

const CONSTANTS_URI: &str = "calc://constants";

fn resources_list() -> Value {
    json!({"resources": [{
        "uri": CONSTANTS_URI,
        "name": "constants",
        "description": "Mathematical constants",
        "mimeType": "application/json"
    }]})
}

fn resources_read(params: Option<&Value>) -> Result<Value, String> {
    let uri = params
        .and_then(|p| p.get("uri"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    if uri != CONSTANTS_URI {
        return Err(format!("Unknown resource: {uri}"));
    }
    let constants = json!({"pi": std::f64::consts::PI, "e": std::f64::consts::E});
    Ok(json!({"contents": [{
        "uri": uri,
        "mimeType": "application/json",
        "text": constants.to_string()
    }]}))
}

fn prompts_list() -> Value {
    json!({"prompts": [{
        "name": "explain",
        "description": "Explain how to evaluate an expression",
        "arguments": [{"name": "expression", "description": "Expression to explain", "required": true}]
    }]})
}

fn prompts_get(params: Option<&Value>) -> Result<Value, String> {
    let name = params
        .and_then(|p| p.get("name"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    if name != "explain" {
        return Err(format!("Unknown prompt: {name}"));
    }
    let expression = params
        .and_then(|p| p.pointer("/arguments/expression"))
        .and_then(Value::as_str)
        .ok_or_else(|| "missing argument 'expression'".to_string())?;
    Ok(json!({
        "description": "Explain an expression",
        "messages": [{
            "role": "user",
            "content": {"type": "text", "text": format!("Explain step by step how to evaluate {expression}")}
        }]
    }))
}

// ─── Fault Injection ─────────────────────────────────────────────────────────

fn env_flag(name: &str) -> bool {
    std::env::var(name).is_ok_and(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}

/// Count this call in the shared state file; true while the count is within
/// the configured number of hanging calls.
fn should_hang_call() -> Result<bool> {
    let Some(limit) = std::env::var("CALC_SERVER_HANG_CALLS")
        .ok()
        .and_then(|s| s.parse::<u32>().ok())
    else {
        return Ok(false);
    };
    let Ok(state_file) = std::env::var("CALC_SERVER_STATE_FILE") else {
        return Ok(false);
    };

    let seen: u32 = std::fs::read_to_string(&state_file)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0);
    std::fs::write(&state_file, (seen + 1).to_string())
        .with_context(|| format!("failed to update {state_file}"))?;
    Ok(seen < limit)
}

fn hang_forever() -> ! {
    loop {
        std::thread::sleep(Duration::from_secs(3600));
    }
}

fn record_pid() -> Result<()> {
    if let Ok(path) = std::env::var("CALC_SERVER_PID_FILE") {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open {path}"))?;
        writeln!(file, "{}", std::process::id())?;
    }
    Ok(())
}

// ─── Server Loop ─────────────────────────────────────────────────────────────

fn handle_request(request: &JsonRpcRequest) -> Result<JsonRpcResponse> {
    let id = request.id.clone().unwrap_or(Value::Null);

    let response = match request.method.as_str() {
        "initialize" => JsonRpcResponse::ok(
            id,
            json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {"tools": {}, "resources": {}, "prompts": {}},
                "serverInfo": {"name": "calc", "version": env!("CARGO_PKG_VERSION")}
            }),
        ),
        "tools/list" => JsonRpcResponse::ok(id, tools_list(request.params.as_ref())),
        "tools/call" => {
            if should_hang_call()? {
                eprintln!("calc: hanging on tools/call");
                hang_forever();
            }
            let params = request.params.as_ref();
            let name = params
                .and_then(|p| p.get("name"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            let args = params
                .and_then(|p| p.get("arguments"))
                .cloned()
                .unwrap_or_else(|| json!({}));

            if !tool_definitions().iter().any(|t| t["name"] == name) {
                JsonRpcResponse::err(id, -32602, format!("Unknown tool: {name}"))
            } else {
                match call_tool(name, &args) {
                    Ok(result) => JsonRpcResponse::ok(id, result),
                    Err(e) => JsonRpcResponse::ok(
                        id,
                        json!({
                            "content": [{"type": "text", "text": format!("Error: {e}")}],
                            "isError": true
                        }),
                    ),
                }
            }
        }
        "resources/list" => JsonRpcResponse::ok(id, resources_list()),
        "resources/read" => match resources_read(request.params.as_ref()) {
            Ok(result) => JsonRpcResponse::ok(id, result),
            Err(message) => JsonRpcResponse::err(id, -32602, message),
        },
        "prompts/list" => JsonRpcResponse::ok(id, prompts_list()),
        "prompts/get" => match prompts_get(request.params.as_ref()) {
            Ok(result) => JsonRpcResponse::ok(id, result),
            Err(message) => JsonRpcResponse::err(id, -32602, message),
        },
        other => JsonRpcResponse::err(id, -32601, format!("Method not found: {other}")),
    };
    Ok(response)
}

fn main() -> Result<()> {
    record_pid()?;

    if env_flag("CALC_SERVER_EXIT_IMMEDIATELY") {
        eprintln!("calc: exiting on request");
        std::process::exit(3);
    }
    let silent = env_flag("CALC_SERVER_SILENT");

    // Log to stderr so it doesn't interfere with the protocol. The stdout
    // banner is deliberate: clients must skip non-JSON lines.
    eprintln!("calc: MCP server starting");
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    writeln!(stdout, "calc server ready")?;
    stdout.flush()?;

    for line in stdin.lock().lines() {
        let line = line.context("failed to read stdin")?;
        if line.trim().is_empty() {
            continue;
        }

        let request: JsonRpcRequest = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(e) => {
                eprintln!("calc: failed to parse request: {e}");
                continue;
            }
        };

        // Notifications get no response.
        if request.id.is_none() || silent {
            continue;
        }

        let response = handle_request(&request)?;
        writeln!(stdout, "{}", serde_json::to_string(&response)?)?;
        stdout.flush()?;
    }

    eprintln!("calc: stdin closed, exiting");
    Ok(())
}

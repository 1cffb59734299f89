//! Tool-list normalization.
//!
//! Servers answer `tools/list` in several shapes:
//! - wrapped: `{"tools": [...]}` (the MCP standard)
//! - bare: `[...]`
//! - `null` (no tools)
//!
//! and each entry is either an object `{name, description, inputSchema}` or a
//! tuple-encoded array `[name, description, schema?]`. Everything is reduced
//! to `ToolDescriptor` here.

use serde::{Deserialize, Serialize};

use super::errors::McpError;
use super::types::ToolDescriptor;

/// What to do with a tool entry that matches none of the known shapes.
///
/// An unrecognized top-level response is always an error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MalformedToolPolicy {
    /// Fail the whole listing.
    #[default]
    Reject,
    /// Log a warning and drop the entry.
    Skip,
}

/// Normalize a raw `tools/list` result into descriptors owned by `server_id`.
pub fn normalize_tool_list(
    server_id: &str,
    raw: &serde_json::Value,
    policy: MalformedToolPolicy,
) -> Result<Vec<ToolDescriptor>, McpError> {
    let entries = match raw {
        serde_json::Value::Null => {
            tracing::info!(server = server_id, "server reported no tools");
            return Ok(Vec::new());
        }
        serde_json::Value::Array(entries) => entries,
        serde_json::Value::Object(obj) => match obj.get("tools") {
            Some(serde_json::Value::Array(entries)) => entries,
            Some(serde_json::Value::Null) => return Ok(Vec::new()),
            Some(other) => {
                return Err(malformed(
                    server_id,
                    format!("'tools' is {} rather than a list", json_kind(other)),
                ))
            }
            None => return Err(malformed(server_id, "object without a 'tools' field".into())),
        },
        other => {
            return Err(malformed(
                server_id,
                format!("unexpected response of type {}", json_kind(other)),
            ))
        }
    };

    let mut tools = Vec::with_capacity(entries.len());
    for (index, entry) in entries.iter().enumerate() {
        match parse_entry(server_id, entry) {
            Ok(tool) => tools.push(tool),
            Err(reason) => match policy {
                MalformedToolPolicy::Reject => {
                    return Err(malformed(server_id, format!("entry {index}: {reason}")));
                }
                MalformedToolPolicy::Skip => {
                    tracing::warn!(
                        server = server_id,
                        index,
                        reason = %reason,
                        "skipping unparseable tool entry"
                    );
                }
            },
        }
    }

    Ok(tools)
}

fn parse_entry(server_id: &str, entry: &serde_json::Value) -> Result<ToolDescriptor, String> {
    match entry {
        serde_json::Value::Object(obj) => {
            let name = obj
                .get("name")
                .and_then(|n| n.as_str())
                .filter(|n| !n.is_empty())
                .ok_or_else(|| "object entry without a string 'name'".to_string())?;
            let description = obj
                .get("description")
                .and_then(|d| d.as_str())
                .unwrap_or_default();
            let input_schema = ["inputSchema", "input_schema", "parameters"]
                .iter()
                .find_map(|key| obj.get(*key))
                .cloned()
                .unwrap_or_else(empty_schema);

            Ok(ToolDescriptor {
                name: name.to_string(),
                description: description.to_string(),
                input_schema,
                server_id: server_id.to_string(),
            })
        }
        serde_json::Value::Array(parts) => {
            if parts.len() < 2 {
                return Err(format!("tuple entry with {} element(s)", parts.len()));
            }
            let name = parts[0]
                .as_str()
                .filter(|n| !n.is_empty())
                .ok_or_else(|| "tuple entry whose first element is not a name".to_string())?;
            let description = match &parts[1] {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Null => String::new(),
                other => {
                    return Err(format!(
                        "tuple entry with {} description",
                        json_kind(other)
                    ))
                }
            };
            let input_schema = parts.get(2).cloned().unwrap_or_else(empty_schema);

            Ok(ToolDescriptor {
                name: name.to_string(),
                description,
                input_schema,
                server_id: server_id.to_string(),
            })
        }
        other => Err(format!("entry of type {}", json_kind(other))),
    }
}

fn empty_schema() -> serde_json::Value {
    serde_json::json!({"type": "object", "properties": {}})
}

fn malformed(server_id: &str, reason: String) -> McpError {
    McpError::MalformedToolList {
        server: server_id.to_string(),
        reason,
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

//! End-to-end tests against the bundled `calc_server` binary.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde_json::json;

use cognisphere_mcp::agent_tools::{
    call_mcp_tool, get_mcp_prompt, list_mcp_resources, list_mcp_tools, McpDataResponse,
    ToolCallResponse,
};
use cognisphere_mcp::config::ManagerSettings;
use cognisphere_mcp::mcp_client::{
    ConnectParams, ConnectionManager, ConnectionState, McpError, NewServer, ServerRegistry,
};

const CALC: &str = env!("CARGO_BIN_EXE_calc_server");

fn test_settings() -> ManagerSettings {
    ManagerSettings {
        connect_timeout_ms: 10_000,
        tool_timeout_ms: 10_000,
        health_check_timeout_ms: 5_000,
        shutdown_timeout_ms: 500,
        max_retries: 2,
        retry_delay_ms: 50,
        ..Default::default()
    }
}

async fn setup_with(
    settings: ManagerSettings,
    env: &[(&str, String)],
) -> (ConnectionManager, tempfile::TempDir) {
    let tmp = tempfile::tempdir().unwrap();
    let registry = Arc::new(ServerRegistry::in_data_dir(tmp.path()));
    registry
        .add_server(NewServer {
            name: Some("calc".into()),
            command: CALC.into(),
            env: env
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
            ..Default::default()
        })
        .await
        .unwrap();
    (ConnectionManager::new(registry, settings), tmp)
}

async fn setup() -> (ConnectionManager, tempfile::TempDir) {
    setup_with(test_settings(), &[]).await
}

fn read_pids(path: &Path) -> Vec<u32> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .filter_map(|l| l.trim().parse().ok())
        .collect()
}

#[cfg(target_os = "linux")]
fn process_exists(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

fn env_params(pairs: &[(&str, &str)]) -> ConnectParams {
    ConnectParams {
        env: pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>(),
        ..Default::default()
    }
}

// ─── Connect & Discover ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_calc_scenario() {
    let (manager, _tmp) = setup().await;

    let tools = manager
        .connect_to_server("calc", ConnectParams::default())
        .await
        .unwrap();
    let add = tools.iter().find(|t| t.name == "add").unwrap();
    assert_eq!(add.description, "Adds two numbers");
    assert_eq!(add.server_id, "calc");

    let listing = serde_json::to_value(list_mcp_tools(&manager, Some("calc"))).unwrap();
    assert_eq!(listing["status"], "success");
    assert_eq!(listing["count"], 2);

    let response = call_mcp_tool(&manager, "calc", "add", json!({"a": 2, "b": 3})).await;
    assert_eq!(
        response,
        ToolCallResponse::Success {
            server_id: "calc".into(),
            tool_name: "add".into(),
            result: json!(5),
        }
    );

    manager.close_all().await;
}

#[tokio::test]
async fn test_execute_connects_registered_server_first() {
    let (manager, _tmp) = setup().await;
    assert!(!manager.is_connected("calc"));

    let output = manager
        .execute_tool("calc", "add", json!({"a": 40, "b": 2}))
        .await
        .unwrap();
    assert_eq!(output.to_value(), json!(42));
    assert!(manager.is_connected("calc"));

    manager.close_all().await;
}

#[tokio::test]
async fn test_tool_list_shapes() {
    let (manager, _tmp) = setup().await;

    for shape in ["bare", "tuple"] {
        let tools = manager
            .connect_to_server("calc", env_params(&[("CALC_SERVER_TOOLS_SHAPE", shape)]))
            .await
            .unwrap();
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["add", "divide"], "shape {shape}");
    }

    let tools = manager
        .connect_to_server("calc", env_params(&[("CALC_SERVER_TOOLS_SHAPE", "null")]))
        .await
        .unwrap();
    assert!(tools.is_empty());

    let err = manager
        .connect_to_server("calc", env_params(&[("CALC_SERVER_TOOLS_SHAPE", "invalid")]))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("malformed tool list"), "got: {err}");
    assert!(!manager.is_connected("calc"));

    manager.close_all().await;
}

#[tokio::test]
async fn test_paginated_tool_list() {
    let (manager, _tmp) = setup().await;
    let tools = manager
        .connect_to_server("calc", env_params(&[("CALC_SERVER_PAGE_SIZE", "1")]))
        .await
        .unwrap();
    assert_eq!(tools.len(), 2);
    manager.close_all().await;
}

#[tokio::test]
async fn test_server_exiting_immediately_leaves_nothing_behind() {
    let tmp = tempfile::tempdir().unwrap();
    let pid_file = tmp.path().join("pids");
    let (manager, _data) = setup().await;

    let err = manager
        .connect_to_server(
            "calc",
            env_params(&[
                ("CALC_SERVER_EXIT_IMMEDIATELY", "1"),
                ("CALC_SERVER_PID_FILE", pid_file.to_str().unwrap()),
            ]),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, McpError::ConnectFailed { .. }), "got: {err}");
    assert!(!manager.is_connected("calc"));
    assert!(manager.get_server_tools("calc").is_empty());
    assert_eq!(manager.connection_state("calc"), ConnectionState::Failed);

    let pids = read_pids(&pid_file);
    assert_eq!(pids.len(), 1);
    #[cfg(target_os = "linux")]
    assert!(!process_exists(pids[0]));
}

#[cfg(unix)]
#[tokio::test]
async fn test_non_mcp_command_fails_cleanly() {
    let (manager, _tmp) = setup().await;
    let err = manager
        .connect_to_server(
            "true",
            ConnectParams {
                command: Some("true".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, McpError::ConnectFailed { .. }), "got: {err}");
    assert!(manager.connected_servers().is_empty());
}

#[tokio::test]
async fn test_missing_executable_is_not_transient() {
    let (manager, _tmp) = setup().await;
    let err = manager
        .connect_to_server(
            "ghost",
            ConnectParams {
                command: Some("/no/such/mcp-server".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(!err.is_transient());
    assert!(err.to_string().contains("ghost"));
}

#[tokio::test]
async fn test_silent_server_times_out_and_is_killed() {
    let tmp = tempfile::tempdir().unwrap();
    let pid_file = tmp.path().join("pids");
    let settings = ManagerSettings {
        connect_timeout_ms: 300,
        ..test_settings()
    };
    let (manager, _data) = setup_with(settings, &[]).await;

    let err = manager
        .connect_to_server(
            "calc",
            env_params(&[
                ("CALC_SERVER_SILENT", "1"),
                ("CALC_SERVER_PID_FILE", pid_file.to_str().unwrap()),
            ]),
        )
        .await
        .unwrap_err();

    match &err {
        McpError::ConnectFailed { source, .. } => {
            assert!(matches!(**source, McpError::Timeout { .. }), "got: {source}");
        }
        other => panic!("expected ConnectFailed, got {other}"),
    }

    let pids = read_pids(&pid_file);
    assert_eq!(pids.len(), 1);
    #[cfg(target_os = "linux")]
    assert!(!process_exists(pids[0]));
}

// ─── Execution & Retry ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_two_hung_calls_then_success_reconnects_twice() {
    let tmp = tempfile::tempdir().unwrap();
    let pid_file = tmp.path().join("pids");
    let state_file = tmp.path().join("calls");
    let settings = ManagerSettings {
        tool_timeout_ms: 500,
        ..test_settings()
    };
    let (manager, _data) = setup_with(
        settings,
        &[
            ("CALC_SERVER_HANG_CALLS", "2".to_string()),
            ("CALC_SERVER_STATE_FILE", state_file.display().to_string()),
            ("CALC_SERVER_PID_FILE", pid_file.display().to_string()),
        ],
    )
    .await;

    manager
        .connect_to_server("calc", ConnectParams::default())
        .await
        .unwrap();

    let output = manager
        .execute_tool("calc", "add", json!({"a": 2, "b": 3}))
        .await
        .unwrap();
    assert_eq!(output.to_value(), json!(5));

    // initial launch plus exactly two reconnects
    let pids = read_pids(&pid_file);
    assert_eq!(pids.len(), 3);
    #[cfg(target_os = "linux")]
    {
        assert!(!process_exists(pids[0]));
        assert!(!process_exists(pids[1]));
    }

    manager.close_all().await;
}

#[tokio::test]
async fn test_unknown_tool_names_available_tools() {
    let (manager, _tmp) = setup().await;
    let err = manager
        .execute_tool("calc", "multiply", json!({"a": 2, "b": 3}))
        .await
        .unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("multiply"), "got: {msg}");
    assert!(msg.contains("add, divide"), "got: {msg}");
    manager.close_all().await;
}

#[tokio::test]
async fn test_tool_error_result_reported_as_error_payload() {
    let (manager, _tmp) = setup().await;
    let response = call_mcp_tool(&manager, "calc", "divide", json!({"a": 1, "b": 0})).await;
    match response {
        ToolCallResponse::Error { message } => {
            assert!(message.contains("division by zero"), "got: {message}")
        }
        other => panic!("expected error payload, got {other:?}"),
    }
    manager.close_all().await;
}

// ─── Resources & Prompts ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_resources_and_prompts_end_to_end() {
    let (manager, _tmp) = setup().await;

    let resources = manager.list_resources("calc").await.unwrap();
    assert_eq!(resources.len(), 1);
    assert_eq!(resources[0].uri, "calc://constants");
    assert_eq!(resources[0].mime_type.as_deref(), Some("application/json"));

    let contents = manager.read_resource("calc", "calc://constants").await.unwrap();
    let constants: serde_json::Value =
        serde_json::from_str(contents[0].text.as_deref().unwrap()).unwrap();
    assert!(constants["e"].as_f64().unwrap() > 2.0);

    let err = manager
        .read_resource("calc", "calc://missing")
        .await
        .unwrap_err();
    assert!(matches!(err, McpError::ServerError { code: -32602, .. }), "got: {err}");

    let prompts = manager.list_prompts("calc").await.unwrap();
    assert_eq!(prompts[0].name, "explain");
    assert!(prompts[0].arguments[0].required);

    let listing = list_mcp_resources(&manager, "calc").await;
    assert!(listing.is_success());

    match get_mcp_prompt(&manager, "calc", "explain", json!({"expression": "6 / 2"})).await {
        McpDataResponse::Success { data, .. } => {
            let text = data["messages"][0]["content"]["text"].as_str().unwrap();
            assert!(text.contains("6 / 2"), "got: {text}");
        }
        other => panic!("expected success payload, got {other:?}"),
    }

    manager.close_all().await;
}

// ─── Health & Teardown ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_health_check_does_not_change_state() {
    let (manager, _tmp) = setup().await;
    assert!(!manager.check_connection_health("calc").await);

    manager
        .connect_to_server("calc", ConnectParams::default())
        .await
        .unwrap();
    assert!(manager.check_connection_health("calc").await);
    assert_eq!(manager.connection_state("calc"), ConnectionState::Connected);
    manager.close_all().await;
}

#[tokio::test]
async fn test_close_all_terminates_every_server() {
    let (manager, _tmp) = setup().await;
    let ids = ["calc-a", "calc-b", "calc-c"];
    for id in ids {
        manager
            .connect_to_server(
                id,
                ConnectParams {
                    command: Some(CALC.into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }
    assert_eq!(manager.connected_servers(), ids);

    let pids: Vec<u32> = ids
        .iter()
        .filter_map(|id| manager.connection_info(id).pid)
        .collect();
    assert_eq!(pids.len(), 3);

    manager.close_all().await;
    assert!(manager.connected_servers().is_empty());
    assert!(manager.get_all_tools().is_empty());
    #[cfg(target_os = "linux")]
    assert!(pids.iter().all(|pid| !process_exists(*pid)));

    // second call is a no-op
    manager.close_all().await;
    assert!(manager.connected_servers().is_empty());
}

#[tokio::test]
async fn test_reconnect_replaces_process() {
    let (manager, _tmp) = setup().await;
    manager
        .connect_to_server("calc", ConnectParams::default())
        .await
        .unwrap();
    let first = manager.connection_info("calc").pid.unwrap();

    manager
        .connect_to_server("calc", ConnectParams::default())
        .await
        .unwrap();
    let second = manager.connection_info("calc").pid.unwrap();

    assert_ne!(first, second);
    assert_eq!(manager.connected_servers(), vec!["calc"]);
    #[cfg(target_os = "linux")]
    assert!(!process_exists(first));
    manager.close_all().await;
}

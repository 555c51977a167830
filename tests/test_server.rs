//! Integration tests for the MCP server tools via duplex transport.
//!
//! Uses `tokio::io::duplex` to create an in-process transport, connects a
//! test client to the shell-gateway server, and exercises the five tools
//! through the MCP protocol end to end.

use rmcp::model::*;
use rmcp::{ClientHandler, ServiceExt};
use serde_json::Value;
use shell_gateway_mcp::config::Config;
use shell_gateway_mcp::server::ShellGatewayServer;
use std::collections::HashSet;
use std::time::Duration;

/// Minimal test client that implements ClientHandler with defaults.
#[derive(Default, Clone)]
struct TestClient;

impl ClientHandler for TestClient {}

fn config(allowed: &[&str]) -> Config {
    Config {
        allowed_commands: allowed.iter().map(|s| s.to_string()).collect::<HashSet<_>>(),
        process_retention_seconds: 3600,
        default_encoding: "utf-8".to_string(),
        shell_path: "/bin/sh".to_string(),
    }
}

/// Helper: start a server+client pair connected via duplex transport.
async fn setup(
    allowed: &[&str],
) -> rmcp::service::RunningService<
    rmcp::service::RoleClient,
    impl rmcp::service::Service<rmcp::service::RoleClient>,
> {
    let (server_transport, client_transport) = tokio::io::duplex(65536);

    let server = ShellGatewayServer::new(config(allowed));
    tokio::spawn(async move {
        let service = server.serve(server_transport).await.unwrap();
        let _ = service.waiting().await;
    });

    let client = TestClient::default();
    client.serve(client_transport).await.unwrap()
}

/// Helper: call a tool and join its `TextContent` blocks with `\n---\n`.
async fn call_tool(
    client: &rmcp::service::RunningService<
        rmcp::service::RoleClient,
        impl rmcp::service::Service<rmcp::service::RoleClient>,
    >,
    name: &str,
    args: Value,
) -> (Vec<String>, bool) {
    let params = CallToolRequestParams {
        meta: None,
        name: name.to_string().into(),
        arguments: Some(serde_json::from_value(args).unwrap()),
        task: None,
    };
    let request = ClientRequest::CallToolRequest(Request::new(params));
    let response = client.send_request(request).await.unwrap();

    let ServerResult::CallToolResult(result) = response else {
        panic!("expected CallToolResult, got {response:?}");
    };

    let blocks = result
        .content
        .iter()
        .filter_map(|c| match &c.raw {
            RawContent::Text(t) => Some(t.text.clone()),
            _ => None,
        })
        .collect();

    (blocks, result.is_error.unwrap_or(false))
}

// ---------------------------------------------------------------------------
// shell_execute
// ---------------------------------------------------------------------------

#[tokio::test]
async fn allowed_echo_succeeds() {
    let client = setup(&["echo"]).await;
    let (blocks, is_error) = call_tool(
        &client,
        "shell_execute",
        serde_json::json!({"command": ["echo", "hi"], "directory": "/tmp"}),
    )
    .await;

    assert!(!is_error);
    assert_eq!(blocks[0], "**exit with 0**");
    assert_eq!(blocks[1], "---\nstdout:\n---\nhi\n");

    client.cancel().await.unwrap();
}

#[tokio::test]
async fn disallowed_command_rejected_without_spawn() {
    let client = setup(&["ls"]).await;
    let (blocks, is_error) = call_tool(
        &client,
        "shell_execute",
        serde_json::json!({"command": ["rm", "-rf", "/"], "directory": "/tmp"}),
    )
    .await;

    assert!(is_error);
    assert_eq!(blocks, vec!["error: Command not allowed: rm".to_string()]);

    client.cancel().await.unwrap();
}

#[tokio::test]
async fn pipeline_with_one_disallowed_head_fails() {
    let client = setup(&["cat"]).await;
    let (blocks, is_error) = call_tool(
        &client,
        "shell_execute",
        serde_json::json!({"command": ["cat", "a", "|", "rm", "b"], "directory": "/tmp"}),
    )
    .await;

    assert!(is_error);
    assert_eq!(blocks, vec!["error: Command not allowed: rm".to_string()]);

    client.cancel().await.unwrap();
}

#[tokio::test]
async fn timeout_reports_minus_one_and_annotates_stderr() {
    let client = setup(&["sleep"]).await;
    let start = std::time::Instant::now();
    let (blocks, is_error) = call_tool(
        &client,
        "shell_execute",
        serde_json::json!({"command": ["sleep", "10"], "directory": "/tmp", "timeout": 1}),
    )
    .await;

    assert!(!is_error);
    assert_eq!(blocks[0], "**exit with -1**");
    assert!(blocks.iter().any(|b| b.contains("Command timed out after 1s")));
    assert!(start.elapsed() < Duration::from_secs(3));

    client.cancel().await.unwrap();
}

// ---------------------------------------------------------------------------
// background lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn background_lifecycle_completes_and_cleans() {
    let client = setup(&["sleep"]).await;

    let (start_blocks, is_error) = call_tool(
        &client,
        "shell_bg_start",
        serde_json::json!({
            "command": ["sleep", "1"],
            "directory": "/tmp",
            "description": "nap",
            "labels": ["t"],
        }),
    )
    .await;
    assert!(!is_error);
    assert_eq!(start_blocks[0], "started pid=1");

    let (list_blocks, _) = call_tool(
        &client,
        "shell_bg_list",
        serde_json::json!({"status": "running"}),
    )
    .await;
    assert!(list_blocks[0].contains("pid=1"));

    // Poll until terminal.
    let mut detail_blocks = Vec::new();
    for _ in 0..50 {
        let (blocks, _) = call_tool(&client, "shell_bg_detail", serde_json::json!({"pid": 1})).await;
        if blocks[0].contains("Completed") {
            detail_blocks = blocks;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(detail_blocks[0].contains("Completed"), "{detail_blocks:?}");

    let (clean_blocks, _) = call_tool(&client, "shell_bg_clean", serde_json::json!({"pids": [1]})).await;
    assert!(clean_blocks[0].contains("cleaned: [1]"));

    let (detail_after, is_error) = call_tool(&client, "shell_bg_detail", serde_json::json!({"pid": 1})).await;
    assert!(is_error);
    assert_eq!(detail_after, vec!["error: Process 1 not found".to_string()]);

    client.cancel().await.unwrap();
}

#[tokio::test]
async fn stop_with_grace_escalation() {
    // A shell invocation that traps and ignores SIGTERM, forcing the
    // supervisor's grace-window escalation path.
    let client = setup(&["sh"]).await;

    let (start_blocks, _) = call_tool(
        &client,
        "shell_bg_start",
        serde_json::json!({
            "command": ["sh", "-c", "trap '' TERM; sleep 30"],
            "directory": "/tmp",
            "description": "ignores sigterm",
        }),
    )
    .await;
    assert_eq!(start_blocks[0], "started pid=1");

    tokio::time::sleep(Duration::from_millis(100)).await;

    let (stop_blocks, is_error) =
        call_tool(&client, "shell_bg_stop", serde_json::json!({"pid": 1})).await;
    assert!(!is_error);
    assert!(stop_blocks[0].contains("stop requested"));

    // Second stop while still running briefly should still be accepted by
    // the supervisor path until the process actually reaches terminal.
    client.cancel().await.unwrap();
}

#[tokio::test]
async fn shell_bg_logs_returns_output() {
    let client = setup(&["echo"]).await;

    call_tool(
        &client,
        "shell_bg_start",
        serde_json::json!({
            "command": ["echo", "from background"],
            "directory": "/tmp",
            "description": "logs test",
        }),
    )
    .await;

    tokio::time::sleep(Duration::from_millis(300)).await;

    let (blocks, is_error) = call_tool(
        &client,
        "shell_bg_logs",
        serde_json::json!({"pid": 1, "with_stdout": true, "follow_seconds": 0}),
    )
    .await;
    assert!(!is_error);
    assert!(blocks.iter().any(|b| b.contains("from background")));

    client.cancel().await.unwrap();
}

#[tokio::test]
async fn shell_bg_detail_unknown_pid_errors() {
    let client = setup(&["echo"]).await;
    let (blocks, is_error) =
        call_tool(&client, "shell_bg_detail", serde_json::json!({"pid": 999})).await;
    assert!(is_error);
    assert_eq!(blocks, vec!["error: Process 999 not found".to_string()]);

    client.cancel().await.unwrap();
}

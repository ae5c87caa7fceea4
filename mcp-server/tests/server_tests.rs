use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use conductor_core::Config;
use conductor_core::Router;
use conductor_mcp_server::message_processor::MessageProcessor;
use conductor_mcp_server::message_processor::OutgoingMessage;
use conductor_mcp_server::tools::ToolRegistry;
use conductor_protocol::JsonRpcMessage;
use pretty_assertions::assert_eq;
use serde_json::Value;
use serde_json::json;
use tokio::sync::mpsc;

fn test_config(base: &std::path::Path) -> Config {
    Config {
        task_exec: "non-existent-command-xyz".to_string(),
        exec_timeout: Duration::from_secs(5),
        agents_dir: None,
        mirror_everything: false,
        debug: false,
        base_cwd: PathBuf::from(base),
    }
}

fn processor(
    base: &std::path::Path,
) -> (Arc<MessageProcessor>, mpsc::Receiver<OutgoingMessage>) {
    let (tx, rx) = mpsc::channel(16);
    let router = Arc::new(Router::new(test_config(base)));
    let registry = ToolRegistry::new().unwrap();
    (
        Arc::new(MessageProcessor::new(router, registry, tx, false)),
        rx,
    )
}

fn message(value: Value) -> JsonRpcMessage {
    serde_json::from_value(value).unwrap()
}

fn response_value(outgoing: OutgoingMessage) -> Value {
    match outgoing {
        OutgoingMessage::Response(response) => serde_json::to_value(response).unwrap(),
        OutgoingMessage::Notification(n) => panic!("expected response, got {:?}", n.method),
    }
}

/// Parses the JSON payload out of a tools/call text content block.
fn tool_payload(outgoing: OutgoingMessage) -> Value {
    let response = response_value(outgoing);
    let text = response["result"]["content"][0]["text"]
        .as_str()
        .expect("text content block");
    serde_json::from_str(text).expect("payload is JSON")
}

#[tokio::test]
async fn initialize_replies_before_initialized_notification() {
    let dir = tempfile::tempdir().unwrap();
    let (processor, mut rx) = processor(dir.path());

    processor
        .process(message(json!({"id": 1, "method": "initialize"})))
        .await;

    let first = response_value(rx.try_recv().unwrap());
    assert_eq!(first["id"], json!(1));
    assert_eq!(first["result"]["protocolVersion"], json!("2024-11-05"));
    assert_eq!(first["result"]["serverInfo"]["name"], json!("conductor"));

    match rx.try_recv().unwrap() {
        OutgoingMessage::Notification(n) => {
            assert_eq!(n.method, "notifications/initialized");
        }
        OutgoingMessage::Response(_) => panic!("expected notification after the reply"),
    }
}

#[tokio::test]
async fn tools_list_reports_the_full_registry() {
    let dir = tempfile::tempdir().unwrap();
    let (processor, mut rx) = processor(dir.path());

    processor
        .process(message(json!({"id": 2, "method": "tools/list"})))
        .await;

    let response = response_value(rx.try_recv().unwrap());
    let names: Vec<&str> = response["result"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert_eq!(
        names,
        vec!["delegate", "delegate_batch", "list_agents", "validate_agents"]
    );
}

#[tokio::test]
async fn unknown_tool_is_a_protocol_error() {
    let dir = tempfile::tempdir().unwrap();
    let (processor, mut rx) = processor(dir.path());

    processor
        .process(message(json!({
            "id": 3,
            "method": "tools/call",
            "params": {"name": "frobnicate", "arguments": {}}
        })))
        .await;

    let response = response_value(rx.try_recv().unwrap());
    assert_eq!(response["error"]["code"], json!(-32602));
    assert_eq!(response["error"]["message"], json!("Unknown tool: frobnicate"));
}

#[tokio::test]
async fn missing_tool_name_is_a_protocol_error() {
    let dir = tempfile::tempdir().unwrap();
    let (processor, mut rx) = processor(dir.path());

    processor
        .process(message(json!({"id": 4, "method": "tools/call", "params": {}})))
        .await;

    let response = response_value(rx.try_recv().unwrap());
    assert_eq!(response["error"]["code"], json!(-32602));
}

#[tokio::test]
async fn invalid_delegate_arguments_come_back_as_a_structured_failure() {
    let dir = tempfile::tempdir().unwrap();
    let (processor, mut rx) = processor(dir.path());

    processor
        .process(message(json!({
            "id": 5,
            "method": "tools/call",
            "params": {"name": "delegate", "arguments": {"agent": "", "task": 42}}
        })))
        .await;

    let payload = tool_payload(rx.try_recv().unwrap());
    assert_eq!(payload["ok"], json!(false));
    assert_eq!(payload["code"], json!(2));
    let stderr = payload["stderr"].as_str().unwrap();
    assert!(stderr.starts_with("Invalid delegate arguments:"));
    assert!(stderr.contains("agent name is required"));
    assert!(stderr.contains("task must be a string"));
}

#[tokio::test]
async fn unknown_agent_is_a_structured_failure_not_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let (processor, mut rx) = processor(dir.path());

    processor
        .process(message(json!({
            "id": 6,
            "method": "tools/call",
            "params": {"name": "delegate", "arguments": {"agent": "nobody", "task": "do it"}}
        })))
        .await;

    let response = response_value(rx.try_recv().unwrap());
    assert!(response["error"].is_null());
    let text = response["result"]["content"][0]["text"].as_str().unwrap();
    let payload: Value = serde_json::from_str(text).unwrap();
    assert_eq!(payload["code"], json!(2));
    assert!(payload["stderr"].as_str().unwrap().contains("Unknown agent"));
}

#[tokio::test]
async fn list_agents_includes_builtins_and_custom_definitions() {
    let dir = tempfile::tempdir().unwrap();
    let agents_dir = dir.path().join("agents");
    std::fs::create_dir_all(&agents_dir).unwrap();
    std::fs::write(
        agents_dir.join("writer.md"),
        "---\nprofile: writer-profile\n---\nYou write docs.\n",
    )
    .unwrap();

    let (processor, mut rx) = processor(dir.path());
    processor
        .process(message(json!({
            "id": 7,
            "method": "tools/call",
            "params": {"name": "list_agents", "arguments": {}}
        })))
        .await;

    let payload = tool_payload(rx.try_recv().unwrap());
    let agents = payload["agents"].as_array().unwrap();
    let find = |name: &str| {
        agents
            .iter()
            .find(|a| a["name"] == json!(name))
            .cloned()
            .unwrap_or_else(|| panic!("agent {name} missing"))
    };
    assert_eq!(find("reviewer")["source"], json!("builtin"));
    assert_eq!(find("orchestrator")["source"], json!("builtin"));
    let writer = find("writer");
    assert_eq!(writer["source"], json!("custom"));
    assert_eq!(writer["profile"], json!("writer-profile"));
}

#[tokio::test]
async fn validate_agents_reports_per_file_issues() {
    let dir = tempfile::tempdir().unwrap();
    let agents_dir = dir.path().join("agents");
    std::fs::create_dir_all(&agents_dir).unwrap();
    std::fs::write(agents_dir.join("ok.md"), "---\nprofile: p\n---\nPersona.\n").unwrap();
    std::fs::write(agents_dir.join("broken.json"), "{ not json").unwrap();

    let (processor, mut rx) = processor(dir.path());
    processor
        .process(message(json!({
            "id": 8,
            "method": "tools/call",
            "params": {
                "name": "validate_agents",
                "arguments": {"dir": agents_dir.display().to_string()}
            }
        })))
        .await;

    let payload = tool_payload(rx.try_recv().unwrap());
    assert_eq!(payload["ok"], json!(false));
    assert_eq!(payload["summary"]["files"], json!(2));
    assert_eq!(payload["summary"]["with_errors"], json!(1));
    let files = payload["files"].as_array().unwrap();
    let broken = files
        .iter()
        .find(|f| f["file"] == json!("broken.json"))
        .unwrap();
    assert_eq!(broken["issues"][0]["code"], json!("json_parse_error"));
}

#[tokio::test]
async fn shutdown_returns_null_and_unknown_methods_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (processor, mut rx) = processor(dir.path());

    processor
        .process(message(json!({"id": 9, "method": "shutdown"})))
        .await;
    let response = response_value(rx.try_recv().unwrap());
    assert_eq!(response["result"], Value::Null);

    processor
        .process(message(json!({"id": 10, "method": "resources/list"})))
        .await;
    let response = response_value(rx.try_recv().unwrap());
    assert_eq!(response["error"]["code"], json!(-32601));
    assert_eq!(
        response["error"]["message"],
        json!("Method not found: resources/list")
    );
}

#[tokio::test]
async fn unknown_notifications_are_dropped_silently() {
    let dir = tempfile::tempdir().unwrap();
    let (processor, mut rx) = processor(dir.path());

    processor
        .process(message(json!({"method": "notifications/cancelled"})))
        .await;
    processor
        .process(message(json!({"method": "initialized"})))
        .await;

    assert!(rx.try_recv().is_err());
}

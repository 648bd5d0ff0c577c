#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Integration tests for the stdio server lifecycle.
//!
//! Servers are small `sh` scripts speaking newline-delimited JSON-RPC over
//! their pipes. Request ids are deterministic per connection (initialize is
//! always 1, notifications consume none), so the scripts answer with
//! hardcoded ids. Covers: handshake, discovery, tool calls, crash and
//! timeout classification, idle reader revival, replace semantics, and
//! subscription bookkeeping.

use async_trait::async_trait;
use gantry_core::{GantryResult, ServerStatus, ServerType};
use gantry_mcp::{
    InstallOutcome, ManagerConfig, McpServerManager, ServerConfig, ServerInstaller,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Answers the full happy path: handshake, tools/list, one echo tool call.
const ECHO_SERVER: &str = r#"
while IFS= read -r line; do
  case "$line" in
    *'"method":"initialize"'*)
      printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{"tools":{}},"serverInfo":{"name":"echo-server","version":"1.0.0"}}}'
      ;;
    *'"method":"notifications/initialized"'*)
      :
      ;;
    *'"method":"tools/list"'*)
      printf '%s\n' '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"echo","description":"Echoes text back","inputSchema":{"type":"object","properties":{"text":{"type":"string"}}}}]}}'
      ;;
    *'"method":"tools/call"'*)
      printf '%s\n' '{"jsonrpc":"2.0","id":3,"result":{"content":[{"type":"text","text":"hi"}],"isError":false}}'
      ;;
  esac
done
"#;

/// Completes the handshake and then ignores everything.
const SILENT_AFTER_HANDSHAKE: &str = r#"
while IFS= read -r line; do
  case "$line" in
    *'"method":"initialize"'*)
      printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{}}}'
      ;;
  esac
done
"#;

/// Exits with code 7 when asked for its tools.
const EXITS_ON_DISCOVERY: &str = r#"
while IFS= read -r line; do
  case "$line" in
    *'"method":"initialize"'*)
      printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{}}}'
      ;;
    *'"method":"tools/list"'*)
      echo 'tool registry corrupted' >&2
      exit 7
      ;;
  esac
done
"#;

/// Dies with code 3 mid tool call.
const CRASHES_ON_CALL: &str = r#"
while IFS= read -r line; do
  case "$line" in
    *'"method":"initialize"'*)
      printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{}}}'
      ;;
    *'"method":"tools/list"'*)
      printf '%s\n' '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"boom","inputSchema":{"type":"object"}}]}}'
      ;;
    *'"method":"tools/call"'*)
      echo 'tool handler blew up' >&2
      exit 3
      ;;
  esac
done
"#;

/// Sleeps two seconds before answering a tool call.
const SLOW_TOOL: &str = r#"
while IFS= read -r line; do
  case "$line" in
    *'"method":"initialize"'*)
      printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{}}}'
      ;;
    *'"method":"tools/call"'*)
      sleep 2
      printf '%s\n' '{"jsonrpc":"2.0","id":2,"result":{"content":[{"type":"text","text":"finally"}],"isError":false}}'
      ;;
  esac
done
"#;

/// Emits junk and a foreign-id response before the real tool call answer.
const NOISY_SERVER: &str = r#"
while IFS= read -r line; do
  case "$line" in
    *'"method":"initialize"'*)
      printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{}}}'
      ;;
    *'"method":"tools/call"'*)
      printf '%s\n' 'this line is not json'
      printf '%s\n' '{"jsonrpc":"2.0","id":999,"result":{"content":[{"type":"text","text":"wrong caller"}]}}'
      printf '%s\n' '{"jsonrpc":"2.0","id":2,"result":{"content":[{"type":"text","text":"right caller"}],"isError":false}}'
      ;;
  esac
done
"#;

/// Announces a tool list change right before answering a call.
const LIST_CHANGED_SERVER: &str = r#"
while IFS= read -r line; do
  case "$line" in
    *'"method":"initialize"'*)
      printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{}}}'
      ;;
    *'"method":"tools/list"'*)
      printf '%s\n' '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"mutator","inputSchema":{"type":"object"}}]}}'
      ;;
    *'"method":"tools/call"'*)
      printf '%s\n' '{"jsonrpc":"2.0","method":"notifications/tools/list_changed"}'
      printf '%s\n' '{"jsonrpc":"2.0","id":3,"result":{"content":[{"type":"text","text":"mutated"}],"isError":false}}'
      ;;
  esac
done
"#;

/// Accepts resource subscriptions and cancellations.
const SUBSCRIPTION_SERVER: &str = r#"
while IFS= read -r line; do
  case "$line" in
    *'"method":"initialize"'*)
      printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{"resources":{"subscribe":true}}}}'
      ;;
    *'"method":"resources/subscribe"'*)
      printf '%s\n' '{"jsonrpc":"2.0","id":2,"result":{}}'
      ;;
    *'"method":"resources/unsubscribe"'*)
      printf '%s\n' '{"jsonrpc":"2.0","id":3,"result":{}}'
      ;;
  esac
done
"#;

/// Logs to stderr and never answers anything.
const NEVER_ANSWERS: &str = r#"
echo 'refusing to speak the protocol' >&2
while IFS= read -r line; do
  :
done
"#;

fn stdio_config(script: &str) -> ServerConfig {
    ServerConfig {
        command: Some("sh".to_string()),
        args: vec!["-c".to_string(), script.to_string()],
        ..Default::default()
    }
}

fn fast_manager(tweak: impl FnOnce(&mut ManagerConfig)) -> McpServerManager {
    let mut config = ManagerConfig {
        handshake_timeout_secs: 5,
        discovery_timeout_secs: 5,
        call_timeout_secs: 5,
        ..ManagerConfig::default()
    };
    tweak(&mut config);
    McpServerManager::new(config)
}

async fn start_ok(manager: &McpServerManager, name: &str, script: &str) {
    let outcome = manager
        .start(name, ServerType::Stdio, &stdio_config(script))
        .await;
    assert!(outcome.success, "start failed: {:?}", outcome.error);
    assert_eq!(outcome.status, ServerStatus::Running);
}

async fn status_of(manager: &McpServerManager, name: &str) -> ServerStatus {
    manager
        .list_servers()
        .await
        .into_iter()
        .find(|s| s.name == name)
        .map(|s| s.status)
        .expect("server not listed")
}

// ---------------------------------------------------------------------------
// 1. Happy path: handshake, discovery, tool call
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_stdio_happy_path() {
    let manager = fast_manager(|_| {});
    start_ok(&manager, "echo", ECHO_SERVER).await;

    let listed = manager.list_servers().await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].status, ServerStatus::Running);
    assert!(listed[0].pid.is_some());

    let tools = manager.discover_tools("echo").await.unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "echo");
    assert_eq!(tools[0].description, "Echoes text back");
    assert!(tools[0].input_schema["properties"]["text"].is_object());
    assert_eq!(manager.cached_tools("echo").await.unwrap().len(), 1);

    let result = manager
        .call_tool("echo", "echo", json!({"text": "hi"}))
        .await
        .unwrap();
    assert!(!result.is_error);
    assert_eq!(result.content[0].content_type, "text");
    assert_eq!(result.content[0].text, "hi");

    manager.shutdown().await;
}

#[tokio::test]
async fn test_start_outcome_reports_pid() {
    let manager = fast_manager(|_| {});
    let outcome = manager
        .start("echo", ServerType::Stdio, &stdio_config(ECHO_SERVER))
        .await;
    assert!(outcome.success);
    assert!(outcome.pid.is_some());
    assert!(outcome.port.is_none());
    assert!(outcome.error.is_none());
    manager.shutdown().await;
}

// ---------------------------------------------------------------------------
// 2. Start failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_spawn_failure_is_reported_not_raised() {
    let manager = fast_manager(|_| {});
    let config = ServerConfig {
        command: Some("/no/such/binary".to_string()),
        ..Default::default()
    };
    let outcome = manager.start("missing", ServerType::Stdio, &config).await;
    assert!(!outcome.success);
    assert!(outcome.error.unwrap().contains("missing"));
    manager.shutdown().await;
}

#[tokio::test]
async fn test_handshake_timeout_marks_failed_and_attaches_stderr() {
    let manager = fast_manager(|c| c.handshake_timeout_secs = 1);
    let outcome = manager
        .start("mute", ServerType::Stdio, &stdio_config(NEVER_ANSWERS))
        .await;
    assert!(!outcome.success);
    assert_eq!(outcome.status, ServerStatus::Failed);
    let error = outcome.error.unwrap();
    assert!(error.contains("mute"));
    assert!(
        error.contains("refusing to speak the protocol"),
        "stderr missing from: {error}"
    );
    assert_eq!(status_of(&manager, "mute").await, ServerStatus::Failed);
    manager.shutdown().await;
}

// ---------------------------------------------------------------------------
// 3. Discovery failures stop the server
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_discovery_timeout_fails_and_stops_server() {
    let manager = fast_manager(|c| c.discovery_timeout_secs = 1);
    start_ok(&manager, "hang", SILENT_AFTER_HANDSHAKE).await;

    let started = Instant::now();
    let err = manager.discover_tools("hang").await.unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(err.to_string().contains("tools/list"));

    let status = status_of(&manager, "hang").await;
    assert!(
        matches!(status, ServerStatus::Failed | ServerStatus::Crashed),
        "unexpected status {status}"
    );
    assert_ne!(status, ServerStatus::Running);

    // A second discovery must refuse outright; the server is down.
    assert!(manager.discover_tools("hang").await.is_err());
    manager.shutdown().await;
}

#[tokio::test]
async fn test_discovery_crash_is_classified_with_exit_code() {
    let manager = fast_manager(|_| {});
    start_ok(&manager, "corrupt", EXITS_ON_DISCOVERY).await;

    let err = manager.discover_tools("corrupt").await.unwrap_err();
    let message = err.to_string();
    assert!(message.contains("exited with code 7"), "got: {message}");
    assert!(message.contains("tool registry corrupted"), "got: {message}");
    assert_eq!(status_of(&manager, "corrupt").await, ServerStatus::Crashed);
    manager.shutdown().await;
}

// ---------------------------------------------------------------------------
// 4. Tool-call failure classification
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_crash_during_call_unblocks_quickly() {
    let manager = fast_manager(|c| c.call_timeout_secs = 30);
    start_ok(&manager, "boom", CRASHES_ON_CALL).await;
    manager.discover_tools("boom").await.unwrap();

    let started = Instant::now();
    let result = manager.call_tool("boom", "boom", json!({})).await.unwrap();
    // Death is detected by the poll interval, far inside the 30s budget.
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(result.is_error);
    let message = result.error_message.unwrap();
    assert!(message.contains("exited with code 3"), "got: {message}");
    assert!(message.contains("tool handler blew up"), "got: {message}");
    assert_eq!(status_of(&manager, "boom").await, ServerStatus::Crashed);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_timeout_with_live_process_reports_unresponsive() {
    let manager = fast_manager(|c| c.call_timeout_secs = 1);
    start_ok(&manager, "slow", SLOW_TOOL).await;

    let result = manager.call_tool("slow", "dawdle", json!({})).await.unwrap();
    assert!(result.is_error);
    assert!(result
        .error_message
        .unwrap()
        .contains("still running"));
    // Not fatal: the server keeps its RUNNING status.
    assert_eq!(status_of(&manager, "slow").await, ServerStatus::Running);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_caller_timeout_argument_extends_budget() {
    let manager = fast_manager(|c| c.call_timeout_secs = 1);
    start_ok(&manager, "slow", SLOW_TOOL).await;

    // The tool sleeps 2s; the caller's own timeout plus slack covers it.
    let result = manager
        .call_tool("slow", "dawdle", json!({"timeout": 5}))
        .await
        .unwrap();
    assert!(!result.is_error);
    assert_eq!(result.content[0].text, "finally");
    manager.shutdown().await;
}

// ---------------------------------------------------------------------------
// 5. Reader robustness
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_junk_and_foreign_ids_do_not_misdeliver() {
    let manager = fast_manager(|_| {});
    start_ok(&manager, "noisy", NOISY_SERVER).await;

    let result = manager.call_tool("noisy", "any", json!({})).await.unwrap();
    assert!(!result.is_error);
    assert_eq!(result.content[0].text, "right caller");
    manager.shutdown().await;
}

#[tokio::test]
async fn test_idle_reader_revives_for_next_request() {
    let manager = fast_manager(|c| c.stdio_idle_timeout_secs = 1);
    start_ok(&manager, "echo", ECHO_SERVER).await;

    // Let the reader go idle and park.
    tokio::time::sleep(Duration::from_millis(1800)).await;

    let tools = manager.discover_tools("echo").await.unwrap();
    assert_eq!(tools[0].name, "echo");
    manager.shutdown().await;
}

#[tokio::test]
async fn test_tool_list_change_notification_invalidates_cache() {
    let manager = Arc::new(fast_manager(|_| {}));
    manager.clone().start_notification_loop();
    start_ok(&manager, "mutator", LIST_CHANGED_SERVER).await;

    manager.discover_tools("mutator").await.unwrap();
    assert!(manager.cached_tools("mutator").await.is_some());

    let result = manager
        .call_tool("mutator", "mutator", json!({}))
        .await
        .unwrap();
    assert!(!result.is_error);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(manager.cached_tools("mutator").await.is_none());
    manager.shutdown().await;
}

// ---------------------------------------------------------------------------
// 6. Stop, replace, shutdown
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_stop_is_idempotent() {
    let manager = fast_manager(|_| {});
    start_ok(&manager, "echo", ECHO_SERVER).await;

    manager.stop("echo").await.unwrap();
    manager.stop("echo").await.unwrap();
    assert_eq!(status_of(&manager, "echo").await, ServerStatus::Stopped);

    // Stopping a name that never existed is also fine.
    manager.stop("never-started").await.unwrap();
    manager.shutdown().await;
}

#[tokio::test]
async fn test_start_replaces_existing_server() {
    let manager = fast_manager(|_| {});
    start_ok(&manager, "dup", ECHO_SERVER).await;
    start_ok(&manager, "dup", ECHO_SERVER).await;

    assert_eq!(manager.server_count().await, 1);
    assert_eq!(status_of(&manager, "dup").await, ServerStatus::Running);

    // The replacement connection works end to end.
    let tools = manager.discover_tools("dup").await.unwrap();
    assert_eq!(tools[0].name, "echo");
    let result = manager.call_tool("dup", "echo", json!({"text": "hi"})).await.unwrap();
    assert!(!result.is_error);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_calls_after_stop_are_unavailable() {
    let manager = fast_manager(|_| {});
    start_ok(&manager, "echo", ECHO_SERVER).await;
    manager.stop("echo").await.unwrap();

    let err = manager.call_tool("echo", "echo", json!({})).await.unwrap_err();
    assert!(err.to_string().contains("STOPPED"));
    manager.shutdown().await;
}

// ---------------------------------------------------------------------------
// 7. Subscriptions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_subscription_roundtrip() {
    let manager = fast_manager(|_| {});
    start_ok(&manager, "subs", SUBSCRIPTION_SERVER).await;

    let id = manager
        .subscribe_resource("subs", "file:///logs/app.log")
        .await
        .unwrap();
    let active = manager.get_active_subscriptions("subs").await;
    assert_eq!(active.len(), 1);
    assert_eq!(active[&id], "file:///logs/app.log");

    assert!(manager.unsubscribe_resource("subs", &id).await);
    assert!(manager.get_active_subscriptions("subs").await.is_empty());

    // Unknown ids report failure without talking to the server.
    assert!(!manager.unsubscribe_resource("subs", "sub-unknown").await);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_stop_clears_subscriptions() {
    let manager = fast_manager(|_| {});
    start_ok(&manager, "subs", SUBSCRIPTION_SERVER).await;
    manager
        .subscribe_resource("subs", "file:///tmp/watched")
        .await
        .unwrap();

    manager.stop("subs").await.unwrap();
    assert!(manager.get_active_subscriptions("subs").await.is_empty());
    manager.shutdown().await;
}

// ---------------------------------------------------------------------------
// 8. Installer delegation
// ---------------------------------------------------------------------------

struct RecordingInstaller {
    calls: parking_lot::Mutex<Vec<String>>,
}

#[async_trait]
impl ServerInstaller for RecordingInstaller {
    async fn install(
        &self,
        command: &str,
        args: &[String],
        _env: &HashMap<String, String>,
    ) -> GantryResult<InstallOutcome> {
        self.calls
            .lock()
            .push(format!("{command} {}", args.join(" ")));
        Ok(InstallOutcome::ok(Some("npm".into()), Some("ok".into())))
    }
}

#[tokio::test]
async fn test_install_delegates_to_installer() {
    let installer = Arc::new(RecordingInstaller {
        calls: parking_lot::Mutex::new(Vec::new()),
    });
    let manager = fast_manager(|_| {}).installer(installer.clone());

    let config = ServerConfig {
        command: Some("npx".to_string()),
        args: vec!["@modelcontextprotocol/server-filesystem".to_string()],
        ..Default::default()
    };
    let outcome = manager
        .install("files", ServerType::Stdio, &config)
        .await
        .unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.package_manager.as_deref(), Some("npm"));
    assert_eq!(
        installer.calls.lock().as_slice(),
        ["npx @modelcontextprotocol/server-filesystem"]
    );

    // Remote servers skip the installer entirely.
    let remote = ServerConfig {
        url: Some("https://mcp.example.com/mcp".to_string()),
        ..Default::default()
    };
    manager.install("cloud", ServerType::Http, &remote).await.unwrap();
    assert_eq!(installer.calls.lock().len(), 1);
}

//! End-to-end tests for `ProtocolClient` against an in-memory tool server
//! and against real child processes.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use toolmux_mcp::testing::FakeServer;
use toolmux_mcp::{
    InboundError, InboundHandler, InboundHandlers, McpError, ProtocolClient, ServerConfig,
};

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Answers every prompt with the params it was given.
struct EchoPrompt;

impl InboundHandler for EchoPrompt {
    fn handle(
        &self,
        params: Value,
    ) -> Pin<Box<dyn Future<Output = Result<Value, InboundError>> + Send + '_>> {
        Box::pin(async move { Ok(json!({"answered": params})) })
    }
}

/// Fails every request.
struct Refuse;

impl InboundHandler for Refuse {
    fn handle(
        &self,
        _params: Value,
    ) -> Pin<Box<dyn Future<Output = Result<Value, InboundError>> + Send + '_>> {
        Box::pin(async { Err(InboundError::new("nobody is listening")) })
    }
}

async fn wait_for<F: Fn() -> bool>(cond: F) {
    for _ in 0..100 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ---------------------------------------------------------------------------
// Handshake and catalog
// ---------------------------------------------------------------------------

#[tokio::test]
async fn initialize_loads_catalog() {
    let (client, mut server) = FakeServer::new()
        .with_tool("list_environments", "List environments")
        .with_tool("get_user", "Fetch a user")
        .attach("s1", InboundHandlers::new());

    assert!(client.list_tools().is_empty());
    client.initialize().await.unwrap();

    let init = server.next_request("initialize").await.unwrap();
    assert_eq!(init["params"]["clientInfo"]["name"], "toolmux");
    assert_eq!(init["params"]["capabilities"]["tools"]["list"], true);
    assert!(init["params"]["capabilities"].get("prompts").is_none());
    assert!(server.next_request("notifications/initialized").await.is_some());

    let names: Vec<String> = client.list_tools().into_iter().map(|t| t.name).collect();
    assert_eq!(names, vec!["list_environments", "get_user"]);
    assert!(client.is_initialized());
}

#[tokio::test]
async fn capabilities_reflect_handlers() {
    let handlers = InboundHandlers::new()
        .with_prompts(Arc::new(EchoPrompt))
        .with_resources(Arc::new(Refuse));
    let (client, mut server) = FakeServer::new().attach("s1", handlers);
    client.initialize().await.unwrap();

    let init = server.next_request("initialize").await.unwrap();
    assert_eq!(init["params"]["capabilities"]["prompts"]["get"], true);
    assert_eq!(init["params"]["capabilities"]["resources"]["read"], true);
}

#[tokio::test]
async fn initialize_is_idempotent() {
    let (client, mut server) = FakeServer::new()
        .with_tool("a", "A")
        .attach("s1", InboundHandlers::new());
    client.initialize().await.unwrap();
    client.initialize().await.unwrap();
    client.call_tool("a", json!({})).await.unwrap();

    let methods: Vec<String> = server
        .drain_received()
        .iter()
        .filter_map(|f| f["method"].as_str().map(str::to_string))
        .collect();
    assert_eq!(
        methods,
        vec![
            "initialize",
            "notifications/initialized",
            "tools/list",
            "tools/call"
        ]
    );
}

#[tokio::test]
async fn failed_handshake_still_lists_tools() {
    let (client, _server) = FakeServer::new()
        .with_tool("a", "A")
        .failing_handshake()
        .attach("s1", InboundHandlers::new());
    client.initialize().await.unwrap();
    assert_eq!(client.list_tools().len(), 1);
}

#[tokio::test]
async fn failed_listing_leaves_empty_catalog() {
    let (client, _server) = FakeServer::new()
        .with_tool("a", "A")
        .failing_tools_list()
        .attach("s1", InboundHandlers::new());
    client.initialize().await.unwrap();
    assert!(client.list_tools().is_empty());
    assert!(client.is_initialized());
}

#[tokio::test]
async fn catalog_notification_replaces_without_merging() {
    let (client, server) = FakeServer::new()
        .with_tool("a", "A")
        .with_tool("b", "B")
        .attach("s1", InboundHandlers::new());
    client.initialize().await.unwrap();
    assert_eq!(client.list_tools().len(), 2);

    server.send_notification("tools/list", json!({"tools": [{"name": "c"}]}));
    wait_for(|| client.list_tools().len() == 1).await;

    let names: Vec<String> = client.list_tools().into_iter().map(|t| t.name).collect();
    assert_eq!(names, vec!["c"]);
}

#[tokio::test]
async fn list_changed_notification_refetches_catalog() {
    let (client, server) = FakeServer::new()
        .with_tool("a", "A")
        .attach("s1", InboundHandlers::new());

    server.send_notification("notifications/tools/list_changed", json!({}));
    wait_for(|| !client.list_tools().is_empty()).await;
    assert_eq!(client.list_tools()[0].name, "a");
}

// ---------------------------------------------------------------------------
// Tool calls
// ---------------------------------------------------------------------------

#[tokio::test]
async fn call_tool_sends_name_and_arguments() {
    let result = json!({"content": [{"type": "text", "text": "[]"}], "isError": false});
    let (client, mut server) = FakeServer::new()
        .with_tool("list-x", "List x")
        .with_result("list-x", result.clone())
        .attach("s1", InboundHandlers::new());
    client.initialize().await.unwrap();

    let got = client.call_tool("list-x", json!({})).await.unwrap();
    assert_eq!(got, result);

    let frame = server.next_request("tools/call").await.unwrap();
    assert_eq!(frame["jsonrpc"], "2.0");
    assert_eq!(frame["params"], json!({"name": "list-x", "arguments": {}}));
}

#[tokio::test]
async fn remote_error_is_surfaced_verbatim() {
    let (client, _server) = FakeServer::new()
        .with_error("delete_env", -32000, "permission denied")
        .attach("s1", InboundHandlers::new());

    match client.call_tool("delete_env", json!({"id": "e1"})).await {
        Err(McpError::JsonRpc {
            server,
            code,
            message,
        }) => {
            assert_eq!(server, "s1");
            assert_eq!(code, -32000);
            assert_eq!(message, "permission denied");
        }
        other => panic!("Expected JsonRpc error, got: {other:?}"),
    }

    // One failed call does not poison the client
    assert!(client.call_tool("other", json!({})).await.is_ok());
}

#[tokio::test]
async fn out_of_order_responses_match_their_calls() {
    let (client, _server) = FakeServer::new()
        .with_delay("slow", Duration::from_millis(200))
        .attach("s1", InboundHandlers::new());
    let client = Arc::new(client);

    let slow_client = Arc::clone(&client);
    let slow = tokio::spawn(async move { slow_client.call_tool("slow", json!({"n": 1})).await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let fast = client.call_tool("fast", json!({"n": 2})).await.unwrap();
    assert_eq!(fast["echo"]["name"], "fast");
    assert!(!slow.is_finished());

    let slow = slow.await.unwrap().unwrap();
    assert_eq!(slow["echo"]["name"], "slow");
    assert_eq!(slow["echo"]["arguments"]["n"], 1);
}

#[tokio::test]
async fn concurrent_calls_resolve_their_own_ids() {
    let (client, _server) = FakeServer::new()
        .with_delay("t0", Duration::from_millis(60))
        .with_delay("t3", Duration::from_millis(30))
        .attach("s1", InboundHandlers::new());
    let client = Arc::new(client);

    let mut handles = Vec::new();
    for i in 0..16 {
        let client = Arc::clone(&client);
        handles.push(tokio::spawn(async move {
            let name = format!("t{i}");
            let result = client.call_tool(&name, json!({"i": i})).await.unwrap();
            (name, result)
        }));
    }
    for handle in handles {
        let (name, result) = handle.await.unwrap();
        assert_eq!(result["echo"]["name"], name.as_str());
    }
}

// ---------------------------------------------------------------------------
// Inbound requests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn inbound_prompt_is_answered_with_same_id() {
    let handlers = InboundHandlers::new().with_prompts(Arc::new(EchoPrompt));
    let (_client, mut server) = FakeServer::new().attach("s1", handlers);

    server.send_request("p1", "prompts/get", json!({"name": "otp"}));
    let response = server.next_response().await.unwrap();
    assert_eq!(response["id"], "p1");
    assert_eq!(response["result"]["answered"]["name"], "otp");
}

#[tokio::test]
async fn inbound_request_with_negative_id_is_answered() {
    let handlers = InboundHandlers::new().with_prompts(Arc::new(EchoPrompt));
    let (_client, mut server) = FakeServer::new().attach("s1", handlers);

    server.send_raw(r#"{"jsonrpc":"2.0","id":-7,"method":"prompts/get","params":{"name":"otp"}}"#);
    let response = server.next_response().await.unwrap();
    assert_eq!(response["id"], -7);
    assert_eq!(response["result"]["answered"]["name"], "otp");
}

#[tokio::test]
async fn inbound_handler_failure_becomes_error_response() {
    let handlers = InboundHandlers::new().with_resources(Arc::new(Refuse));
    let (_client, mut server) = FakeServer::new().attach("s1", handlers);

    server.send_request("r1", "resources/read", json!({"uri": "file:///x"}));
    let response = server.next_response().await.unwrap();
    assert_eq!(response["id"], "r1");
    assert_eq!(response["error"]["message"], "nobody is listening");
}

#[tokio::test]
async fn unregistered_inbound_method_is_not_found() {
    let (_client, mut server) = FakeServer::new().attach("s1", InboundHandlers::new());

    server.send_request("p9", "prompts/get", json!({}));
    let response = server.next_response().await.unwrap();
    assert_eq!(response["id"], "p9");
    assert_eq!(response["error"]["code"], -32601);
}

#[tokio::test]
async fn slow_inbound_handler_does_not_block_responses() {
    struct Stall;
    impl InboundHandler for Stall {
        fn handle(
            &self,
            _params: Value,
        ) -> Pin<Box<dyn Future<Output = Result<Value, InboundError>> + Send + '_>> {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(Value::Null)
            })
        }
    }

    let handlers = InboundHandlers::new().with_prompts(Arc::new(Stall));
    let (client, server) = FakeServer::new().attach("s1", handlers);
    server.send_request("p1", "prompts/get", json!({}));

    let result = tokio::time::timeout(
        Duration::from_secs(2),
        client.call_tool("ping", json!({})),
    )
    .await
    .expect("tool call stalled behind inbound handler");
    assert!(result.is_ok());
}

#[tokio::test]
async fn garbage_frames_are_skipped() {
    let (client, server) = FakeServer::new().attach("s1", InboundHandlers::new());
    server.send_raw("{\"jsonrpc\":\"2.0\",\"result\":");
    server.send_raw("not json at all");
    assert!(client.call_tool("ping", json!({})).await.is_ok());
    assert!(client.is_running().await);
}

// ---------------------------------------------------------------------------
// Real processes
// ---------------------------------------------------------------------------

fn sh(script: &str) -> ServerConfig {
    let mut config = ServerConfig::new("sh");
    config.args = vec!["-c".to_string(), script.to_string()];
    config
}

#[cfg(unix)]
#[tokio::test]
async fn start_is_idempotent() {
    let client = ProtocolClient::new("cat", ServerConfig::new("cat"), InboundHandlers::new());
    client.start().await.unwrap();
    let pid = client.pid().await;
    assert!(pid.is_some());
    client.start().await.unwrap();
    assert_eq!(client.pid().await, pid);
    client.shutdown().await;
    assert!(!client.is_running().await);
}

#[cfg(unix)]
#[tokio::test]
async fn echoing_child_degrades_to_empty_catalog() {
    // `cat` reflects our requests back as inbound requests; we answer them
    // with method-not-found, which cat reflects back as the responses.
    let client = ProtocolClient::new("cat", ServerConfig::new("cat"), InboundHandlers::new());
    client.start().await.unwrap();
    client.initialize().await.unwrap();
    assert!(client.is_initialized());
    assert!(client.list_tools().is_empty());
    client.shutdown().await;
}

#[cfg(unix)]
#[tokio::test]
async fn child_exit_fails_pending_call() {
    let client = ProtocolClient::new("once", sh("read line; exit 0"), InboundHandlers::new());
    client.start().await.unwrap();

    assert!(matches!(
        client.call_tool("x", json!({})).await,
        Err(McpError::ProcessExited { .. })
    ));
    assert!(!client.is_running().await);
    assert!(matches!(
        client.call_tool("x", json!({})).await,
        Err(McpError::NotRunning { .. })
    ));

    // A later start launches a fresh child
    client.start().await.unwrap();
    assert!(client.is_running().await);
    client.shutdown().await;
}

#[cfg(unix)]
#[tokio::test]
async fn child_sees_environment_and_cwd() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = sh(
        r#"read line; printf '{"jsonrpc":"2.0","id":1,"result":{"env":"%s","cwd":"%s"}}\n' "$ENV_ID" "$(pwd)"; read line"#,
    );
    config.env.insert("ENV_ID".to_string(), "e1".to_string());
    config.cwd = Some(dir.path().to_path_buf());

    let client = ProtocolClient::new("env", config, InboundHandlers::new());
    client.start().await.unwrap();
    let result = client.call_tool("x", json!({})).await.unwrap();
    assert_eq!(result["env"], "e1");
    let cwd = std::path::PathBuf::from(result["cwd"].as_str().unwrap());
    assert_eq!(
        cwd.canonicalize().unwrap(),
        dir.path().canonicalize().unwrap()
    );
    client.shutdown().await;
}

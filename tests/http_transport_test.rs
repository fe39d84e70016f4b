use anyhow::Result;
use portico_mcp::config::Config;
use portico_mcp::registry::{HandlerContext, Registry, ToolHandler, ToolOutcome};
use portico_mcp::server::{McpServer, ServerHandle};
use portico_mcp::ToolDefinition;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::sync::Arc;

struct EchoTool;

#[async_trait::async_trait]
impl ToolHandler for EchoTool {
    async fn call(&self, arguments: Value, _ctx: HandlerContext) -> Result<ToolOutcome> {
        let msg = arguments
            .get("msg")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Ok(ToolOutcome::Value(json!(msg)))
    }
}

fn echo_registry() -> Arc<Registry> {
    Registry::builder()
        .tool(
            ToolDefinition {
                name: "echo".to_string(),
                description: Some("Echo a message".to_string()),
                input_schema: json!({
                    "type": "object",
                    "properties": {"msg": {"type": "string"}},
                    "required": ["msg"]
                }),
                annotations: None,
            },
            Some(Arc::new(EchoTool)),
        )
        .unwrap()
        .build()
}

async fn start_test_server(config: Config) -> Result<(Arc<McpServer>, ServerHandle)> {
    let server = Arc::new(
        McpServer::builder(config)
            .registry(echo_registry())
            .build()
            .await?,
    );
    let handle = server.clone().serve_on("127.0.0.1:0".parse()?).await?;
    Ok((server, handle))
}

#[tokio::test]
async fn initialize_issues_a_session_and_is_idempotent() -> Result<()> {
    let (_server, handle) = start_test_server(Config::default()).await?;
    let client = reqwest::Client::new();
    let url = format!("http://{}/mcp", handle.local_addr);

    let payload = json!({
        "jsonrpc": "2.0", "id": 1, "method": "initialize",
        "params": {"protocolVersion": "draft", "capabilities": {}, "clientInfo": {"name": "t", "version": "1"}}
    });

    let resp = client.post(&url).json(&payload).send().await?;
    assert_eq!(resp.status(), StatusCode::OK);
    let session_id = resp
        .headers()
        .get("mcp-session-id")
        .expect("session header")
        .to_str()?
        .to_string();
    let body: Value = resp.json().await?;
    assert_eq!(body["jsonrpc"], "2.0");
    assert_eq!(body["id"], 1);
    assert_eq!(body["result"]["protocolVersion"], "draft");
    assert!(body["result"]["serverInfo"]["name"].is_string());

    // Second initialize on the same session changes nothing.
    let resp = client
        .post(&url)
        .header("Mcp-Session-Id", &session_id)
        .json(&payload)
        .send()
        .await?;
    let second: Value = resp.json().await?;
    assert_eq!(second["result"], body["result"]);

    handle.close().await;
    Ok(())
}

#[tokio::test]
async fn tool_calls_round_trip_and_tool_errors_stay_in_band() -> Result<()> {
    let (_server, handle) = start_test_server(Config::default()).await?;
    let client = reqwest::Client::new();
    let url = format!("http://{}/mcp", handle.local_addr);

    let resp = client
        .post(&url)
        .json(&json!({
            "jsonrpc": "2.0", "id": 2, "method": "tools/call",
            "params": {"name": "echo", "arguments": {"msg": "hi"}}
        }))
        .send()
        .await?;
    let body: Value = resp.json().await?;
    assert_eq!(body["result"]["content"][0], json!({"type": "text", "text": "hi"}));
    assert!(body["result"].get("isError").is_none());

    let resp = client
        .post(&url)
        .json(&json!({
            "jsonrpc": "2.0", "id": 3, "method": "tools/call",
            "params": {"name": "echo", "arguments": {"msg": 42}}
        }))
        .send()
        .await?;
    let body: Value = resp.json().await?;
    assert_eq!(body["result"]["isError"], json!(true));
    assert!(body["result"]["content"][0]["text"]
        .as_str()
        .unwrap()
        .starts_with("Invalid tool arguments"));

    handle.close().await;
    Ok(())
}

#[tokio::test]
async fn transport_level_failures_use_the_error_body_shape() -> Result<()> {
    let (_server, handle) = start_test_server(Config::default()).await?;
    let client = reqwest::Client::new();
    let url = format!("http://{}/mcp", handle.local_addr);

    // Undecodable body.
    let resp = client
        .post(&url)
        .header("Content-Type", "application/json")
        .body("{not json")
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await?;
    assert_eq!(body["error"], "parse_error");
    assert!(body["error_description"].is_string());

    // Unknown session.
    let resp = client
        .post(&url)
        .header("Mcp-Session-Id", "00000000-0000-0000-0000-000000000000")
        .json(&json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}))
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let body: Value = resp.json().await?;
    assert_eq!(body["error"], "unknown_session");

    handle.close().await;
    Ok(())
}

#[tokio::test]
async fn notifications_are_accepted_without_a_body() -> Result<()> {
    let (_server, handle) = start_test_server(Config::default()).await?;
    let client = reqwest::Client::new();
    let url = format!("http://{}/mcp", handle.local_addr);

    let resp = client
        .post(&url)
        .json(&json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::ACCEPTED);
    assert!(resp.headers().get("mcp-session-id").is_some());

    handle.close().await;
    Ok(())
}

#[tokio::test]
async fn get_requires_sse_accept_and_supports_concurrent_streams() -> Result<()> {
    let (_server, handle) = start_test_server(Config::default()).await?;
    let client = reqwest::Client::new();
    let url = format!("http://{}/mcp", handle.local_addr);

    // Establish a session first.
    let resp = client
        .post(&url)
        .json(&json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}}))
        .send()
        .await?;
    let session_id = resp
        .headers()
        .get("mcp-session-id")
        .unwrap()
        .to_str()?
        .to_string();

    // Accept without text/event-stream → 405.
    let resp = client
        .get(&url)
        .header("Mcp-Session-Id", &session_id)
        .header("Accept", "application/json")
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);

    // Proper SSE GET opens a stream and announces its id.
    let first = client
        .get(&url)
        .header("Mcp-Session-Id", &session_id)
        .header("Accept", "text/event-stream")
        .send()
        .await?;
    assert_eq!(first.status(), StatusCode::OK);
    assert!(first.headers().get("mcp-stream-id").is_some());

    // A second simultaneous GET for the same session is accepted.
    let second = client
        .get(&url)
        .header("Mcp-Session-Id", &session_id)
        .header("Accept", "text/event-stream")
        .send()
        .await?;
    assert_eq!(second.status(), StatusCode::OK);
    let first_stream = first.headers().get("mcp-stream-id").unwrap();
    let second_stream = second.headers().get("mcp-stream-id").unwrap();
    assert_ne!(first_stream, second_stream);

    // Release the client side so shutdown can drain the connections.
    drop(first);
    drop(second);
    handle.close().await;
    Ok(())
}

#[tokio::test]
async fn sse_disabled_turns_get_into_405() -> Result<()> {
    let mut config = Config::default();
    config.server.enable_sse = false;
    let (_server, handle) = start_test_server(config).await?;
    let client = reqwest::Client::new();

    let resp = client
        .get(format!("http://{}/mcp", handle.local_addr))
        .header("Accept", "text/event-stream")
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    let body: Value = resp.json().await?;
    assert_eq!(body["error"], "sse_disabled");

    handle.close().await;
    Ok(())
}

#[tokio::test]
async fn healthz_reports_uptime() -> Result<()> {
    let (_server, handle) = start_test_server(Config::default()).await?;
    let resp = reqwest::get(format!("http://{}/healthz", handle.local_addr)).await?;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await?;
    assert_eq!(body["status"], "ok");
    assert!(body["uptime_seconds"].is_u64());

    handle.close().await;
    Ok(())
}

use anyhow::Result;
use futures::StreamExt;
use portico_mcp::config::Config;
use portico_mcp::server::{McpServer, ServerHandle};
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

async fn start_test_server() -> Result<(Arc<McpServer>, ServerHandle)> {
    let server = Arc::new(McpServer::builder(Config::default()).build().await?);
    let handle = server.clone().serve_on("127.0.0.1:0".parse()?).await?;
    Ok((server, handle))
}

/// Read the SSE body until `needle` shows up (or the deadline passes).
async fn read_stream_until(response: reqwest::Response, needle: &str) -> Result<String> {
    let mut stream = response.bytes_stream();
    let mut buffer = String::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        let chunk = tokio::time::timeout(Duration::from_millis(500), stream.next()).await;
        match chunk {
            Ok(Some(Ok(bytes))) => {
                buffer.push_str(&String::from_utf8_lossy(&bytes));
                if buffer.contains(needle) {
                    return Ok(buffer);
                }
            }
            Ok(Some(Err(err))) => return Err(err.into()),
            Ok(None) => break,
            Err(_) => continue,
        }
    }
    Ok(buffer)
}

#[tokio::test]
async fn elicitation_round_trip_with_broadcast() -> Result<()> {
    let (server, handle) = start_test_server().await?;
    let client = reqwest::Client::new();
    let url = format!("http://{}/mcp", handle.local_addr);

    // Session + SSE stream.
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

    let sse = client
        .get(&url)
        .header("Mcp-Session-Id", &session_id)
        .header("Accept", "text/event-stream")
        .send()
        .await?;
    assert_eq!(sse.status(), StatusCode::OK);
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Server-initiated elicitation lands on the stream.
    let record = server
        .elicit_url(
            &session_id,
            "Approve repository access",
            "https://consent.example.com/e/1",
        )
        .await?;
    let body = read_stream_until(sse, "elicitation/create").await?;
    assert!(body.contains(&record.id));
    assert!(body.contains("https://consent.example.com/e/1"));

    // External completion callback.
    let complete_url = format!(
        "http://{}/elicitation/{}/complete",
        handle.local_addr, record.id
    );
    let resp = client.post(&complete_url).send().await?;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await?;
    assert_eq!(body["success"], json!(true));
    assert_eq!(body["elicitationId"], json!(record.id));

    // Second completion is idempotent at the store but answers 400.
    let resp = client.post(&complete_url).send().await?;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await?;
    assert_eq!(body["error"], "already_completed");

    // Status endpoint reflects the terminal state.
    let resp = client
        .get(format!(
            "http://{}/elicitation/{}/status",
            handle.local_addr, record.id
        ))
        .send()
        .await?;
    let body: Value = resp.json().await?;
    assert_eq!(body["status"], "completed");

    // Unknown ids are 404.
    let resp = client
        .post(format!(
            "http://{}/elicitation/does-not-exist/complete",
            handle.local_addr
        ))
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let body: Value = resp.json().await?;
    assert_eq!(body["error"], "not_found");

    handle.close().await;
    Ok(())
}

#[tokio::test]
async fn completion_broadcast_reaches_attached_streams() -> Result<()> {
    let (server, handle) = start_test_server().await?;
    let client = reqwest::Client::new();
    let url = format!("http://{}/mcp", handle.local_addr);

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

    let sse = client
        .get(&url)
        .header("Mcp-Session-Id", &session_id)
        .header("Accept", "text/event-stream")
        .send()
        .await?;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let record = server
        .elicit_url(&session_id, "Confirm", "https://consent.example.com/e/2")
        .await?;
    client
        .post(format!(
            "http://{}/elicitation/{}/cancel",
            handle.local_addr, record.id
        ))
        .send()
        .await?;

    let body = read_stream_until(sse, "notifications/elicitation/complete").await?;
    assert!(body.contains(&record.id));
    assert!(body.contains("cancelled"));

    handle.close().await;
    Ok(())
}

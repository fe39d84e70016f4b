use anyhow::Result;
use futures::StreamExt;
use portico_mcp::config::Config;
use portico_mcp::server::{McpServer, ServerHandle};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

async fn start_test_server() -> Result<(Arc<McpServer>, ServerHandle)> {
    let server = Arc::new(McpServer::builder(Config::default()).build().await?);
    let handle = server.clone().serve_on("127.0.0.1:0".parse()?).await?;
    Ok((server, handle))
}

async fn read_stream_until(response: reqwest::Response, needle: &str) -> Result<String> {
    let mut stream = response.bytes_stream();
    let mut buffer = String::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_millis(500), stream.next()).await {
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
async fn reconnect_replays_events_after_last_event_id() -> Result<()> {
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
    let stream_id = sse
        .headers()
        .get("mcp-stream-id")
        .unwrap()
        .to_str()?
        .to_string();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Three directed messages: this stream receives ids 1..3.
    for n in 1..=3u64 {
        server
            .streams()
            .publish_to_session(
                &session_id,
                json!({"jsonrpc": "2.0", "id": n, "result": {"n": n}}),
            )
            .await;
    }
    let body = read_stream_until(sse, "id: 3").await?;
    assert!(body.contains("id: 1"));
    assert!(body.contains("id: 2"));

    // Connection dropped above (response consumed and dropped). Reconnect
    // declaring the last event we saw was 1: events 2 and 3 replay in order.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let resumed = client
        .get(&url)
        .header("Mcp-Session-Id", &session_id)
        .header("Mcp-Stream-Id", &stream_id)
        .header("Last-Event-ID", "1")
        .header("Accept", "text/event-stream")
        .send()
        .await?;
    let body = read_stream_until(resumed, "id: 3").await?;
    let first = body.find("id: 2").expect("event 2 replayed");
    let second = body.find("id: 3").expect("event 3 replayed");
    assert!(first < second, "replay preserves original order");
    assert!(!body.contains("id: 1"), "delivered events are not replayed");

    // A cursor newer than anything the stream has seen replays nothing and
    // is not an error.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let ahead = client
        .get(&url)
        .header("Mcp-Session-Id", &session_id)
        .header("Mcp-Stream-Id", &stream_id)
        .header("Last-Event-ID", "99")
        .header("Accept", "text/event-stream")
        .send()
        .await?;
    assert_eq!(ahead.status(), reqwest::StatusCode::OK);
    let body = read_stream_until(ahead, "nothing-will-match").await?;
    assert!(!body.contains("data:"), "no replay past the newest event");

    handle.close().await;
    Ok(())
}

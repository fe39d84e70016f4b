//! Stdio transport
//!
//! One JSON-RPC frame per line on stdin, one reply per line on stdout.
//! Diagnostics go to stderr only when debug output is enabled; stdout stays
//! clean for the protocol. A batch array produces an array of non-null
//! replies; an all-notification batch produces no output at all.

use crate::dispatch::{DispatchOutcome, Dispatched, Dispatcher, RequestContext};
use crate::protocol::{JsonRpcResponse, RequestId, RpcError};
use crate::store::SessionStore;
use anyhow::Result;
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

pub struct StdioTransport {
    dispatcher: Arc<Dispatcher>,
    store: Arc<dyn SessionStore>,
    debug: bool,
}

impl StdioTransport {
    pub fn new(dispatcher: Arc<Dispatcher>, store: Arc<dyn SessionStore>, debug: bool) -> Self {
        Self {
            dispatcher,
            store,
            debug,
        }
    }

    /// Serve the process's stdin/stdout until EOF.
    pub async fn run(&self) -> Result<()> {
        let stdin = tokio::io::stdin();
        let stdout = tokio::io::stdout();
        self.serve(stdin, stdout).await
    }

    /// Transport loop over arbitrary reader/writer pairs (testable without a
    /// live process).
    pub async fn serve<R, W>(&self, reader: R, mut writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        // One implicit session per stdio connection, so session-scoped
        // features (log levels, tasks) behave as they do over HTTP.
        let session = self.store.create(None).await?;
        let ctx = RequestContext {
            session_id: Some(session.id.clone()),
            auth: None,
        };

        let mut lines = BufReader::new(reader).lines();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim().to_string();
            if line.is_empty() {
                continue;
            }
            if self.debug {
                eprintln!("stdio <- {line}");
            }

            let payload: Value = match serde_json::from_str(&line) {
                Ok(payload) => payload,
                Err(err) => {
                    // A decodable id still gets a proper -32700 reply.
                    let id = recover_request_id(&line);
                    if self.debug {
                        eprintln!("stdio parse error: {err}");
                    }
                    let reply = JsonRpcResponse::failure(
                        id,
                        RpcError::parse_error("Request line is not valid JSON"),
                    );
                    write_line(&mut writer, &serde_json::to_string(&reply)?).await?;
                    continue;
                }
            };

            match self.dispatcher.dispatch_value(payload, &ctx).await {
                Dispatched::Single(DispatchOutcome::Response(response)) => {
                    write_line(&mut writer, &serde_json::to_string(&response)?).await?;
                }
                Dispatched::Single(DispatchOutcome::Streaming { id, stream }) => {
                    // No SSE on stdio: collapse the sequence to its terminal
                    // value.
                    let response = collapse(id, stream).await;
                    write_line(&mut writer, &serde_json::to_string(&response)?).await?;
                }
                Dispatched::Single(DispatchOutcome::None) => {}
                Dispatched::Batch(responses) => {
                    if !responses.is_empty() {
                        write_line(&mut writer, &serde_json::to_string(&responses)?).await?;
                    }
                }
            }
        }

        let _ = self.store.delete(&session.id).await;
        Ok(())
    }
}

async fn collapse(
    id: RequestId,
    mut stream: futures::stream::BoxStream<'static, Result<Value>>,
) -> JsonRpcResponse {
    use futures::StreamExt;
    let mut last = Value::Null;
    while let Some(item) = stream.next().await {
        match item {
            Ok(value) => last = value,
            Err(err) => {
                return JsonRpcResponse::failure(
                    Some(id),
                    RpcError::internal_error(err.to_string()),
                );
            }
        }
    }
    JsonRpcResponse::success(
        id,
        serde_json::to_value(crate::protocol::CallToolResult::from_value(last))
            .unwrap_or(Value::Null),
    )
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

/// Best-effort id recovery from a line that failed full JSON parsing. Covers
/// truncated frames whose prefix still contains a well-formed `"id"` member.
fn recover_request_id(line: &str) -> Option<RequestId> {
    static ID_MEMBER: once_cell::sync::Lazy<regex::Regex> = once_cell::sync::Lazy::new(|| {
        regex::Regex::new(r#""id"\s*:\s*(?:"([^"]*)"|(\d+))"#)
            .expect("Failed to compile id recovery regex")
    });
    let captures = ID_MEMBER.captures(line)?;
    if let Some(s) = captures.get(1) {
        return Some(RequestId::String(s.as_str().to_string()));
    }
    captures
        .get(2)
        .and_then(|n| n.as_str().parse().ok())
        .map(RequestId::Number)
}

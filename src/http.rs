//! Streamable HTTP transport
//!
//! One endpoint, two shapes: POST `/mcp` for JSON-RPC exchanges (upgrading
//! to SSE only when a call produced a streamed tool response) and GET `/mcp`
//! for the long-lived server-initiated stream. Elicitation callbacks and the
//! health probe ride alongside.

use crate::auth::{authorize, AuthState, AuthorizationContext};
use crate::config::Config;
use crate::dispatch::{DispatchOutcome, Dispatched, Dispatcher, RequestContext};
use crate::elicitation::{ElicitationError, ElicitationManager};
use crate::protocol::{CallToolResult, JsonRpcResponse, RequestId, RpcError};
use crate::store::SessionStore;
use crate::stream::{OutboundFrame, StreamAttachment, StreamManager};
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header::{self, HeaderMap, HeaderValue};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{middleware, Extension, Json, Router};
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

pub const MCP_SESSION_ID_HEADER: &str = "mcp-session-id";
pub const MCP_STREAM_ID_HEADER: &str = "mcp-stream-id";
const LAST_EVENT_ID_HEADER: &str = "last-event-id";

/// Shared state for the HTTP transport.
#[derive(Clone)]
pub struct HttpState {
    pub config: Arc<Config>,
    pub dispatcher: Arc<Dispatcher>,
    pub streams: Arc<StreamManager>,
    pub store: Arc<dyn SessionStore>,
    pub elicitations: Arc<ElicitationManager>,
    pub start_time: Instant,
}

/// Router builder for the transport. When an [`AuthState`] is supplied the
/// authorization pipeline wraps every route (bypass paths excepted).
pub fn create_router(state: HttpState, auth: Option<AuthState>) -> Router {
    let mut router = Router::new()
        .route("/mcp", post(handle_post).get(handle_get))
        .route("/elicitation/:id/complete", post(complete_elicitation))
        .route("/elicitation/:id/cancel", post(cancel_elicitation))
        .route("/elicitation/:id/status", get(elicitation_status))
        .route("/healthz", get(healthz));

    if let Some(auth) = auth {
        router = router.layer(middleware::from_fn_with_state(auth, authorize));
    }
    if state.config.server.enable_cors {
        router = router.layer(tower_http::cors::CorsLayer::permissive());
    }
    router
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Error representation for HTTP responses (non-JSON-RPC failures).
#[derive(Debug)]
pub struct McpHttpError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl McpHttpError {
    fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code,
            message: message.into(),
        }
    }

    fn not_found(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code,
            message: message.into(),
        }
    }

    fn method_not_allowed(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::METHOD_NOT_ALLOWED,
            code,
            message: message.into(),
        }
    }

    fn internal_error(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code,
            message: message.into(),
        }
    }
}

impl IntoResponse for McpHttpError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.code,
            "error_description": self.message,
        }));
        (self.status, body).into_response()
    }
}

/// POST /mcp: decode, resolve the session, dispatch, reply. The response
/// carries `Mcp-Session-Id` so first contact learns the issued session.
async fn handle_post(
    State(state): State<HttpState>,
    headers: HeaderMap,
    auth: Option<Extension<AuthorizationContext>>,
    body: Bytes,
) -> Result<Response, McpHttpError> {
    let payload: Value = serde_json::from_slice(&body).map_err(|err| {
        debug!(reason = %err, "rejecting undecodable JSON-RPC payload");
        McpHttpError::bad_request("parse_error", "Request body must be valid JSON")
    })?;

    let auth = auth.map(|Extension(ctx)| ctx);
    let session_id = resolve_session(&state, &headers, auth.clone()).await?;

    let ctx = RequestContext {
        session_id: Some(session_id.clone()),
        auth,
    };

    match state.dispatcher.dispatch_value(payload, &ctx).await {
        Dispatched::Single(DispatchOutcome::Response(response)) => {
            Ok(json_response(&response, &session_id))
        }
        Dispatched::Single(DispatchOutcome::None) => Ok(accepted_response(&session_id)),
        Dispatched::Single(DispatchOutcome::Streaming { id, stream }) => {
            let wants_sse = accept_includes(&headers, "text/event-stream");
            let sse_available = state.config.server.enable_sse
                && !state.streams.has_active_stream(&session_id);
            if wants_sse && sse_available {
                streamed_tool_response(&state, &session_id, id, stream).await
            } else {
                // No SSE channel negotiated: collapse to the terminal value.
                let response = collapse_stream(id, stream).await;
                Ok(json_response(&response, &session_id))
            }
        }
        Dispatched::Batch(responses) => {
            if responses.is_empty() {
                Ok(accepted_response(&session_id))
            } else {
                let body = serde_json::to_vec(&responses).unwrap_or_else(|_| b"[]".to_vec());
                Ok(build_json(StatusCode::OK, body, &session_id))
            }
        }
    }
}

/// GET /mcp: open an SSE stream for server-initiated messages. Supports
/// `Last-Event-ID` resumption and concurrent streams per session.
async fn handle_get(
    State(state): State<HttpState>,
    headers: HeaderMap,
    auth: Option<Extension<AuthorizationContext>>,
) -> Result<Response, McpHttpError> {
    if !state.config.server.enable_sse {
        return Err(McpHttpError::method_not_allowed(
            "sse_disabled",
            "SSE streaming is disabled on this server",
        ));
    }
    if !accept_includes(&headers, "text/event-stream") {
        return Err(McpHttpError::method_not_allowed(
            "invalid_accept",
            "Accept header must include text/event-stream",
        ));
    }

    let auth = auth.map(|Extension(ctx)| ctx);
    let user_id = auth.as_ref().map(|ctx| ctx.subject.clone());
    let session_id = resolve_session(&state, &headers, auth).await?;

    let resume_stream = headers
        .get(MCP_STREAM_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let last_event_id = headers
        .get(LAST_EVENT_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    let attachment = state
        .streams
        .attach(
            &session_id,
            user_id.as_deref(),
            resume_stream.as_deref(),
            last_event_id,
        )
        .await
        .map_err(|err| {
            warn!(session = %session_id, reason = %err, "SSE attach failed");
            McpHttpError::not_found("unknown_session", "Session not found or has expired")
        })?;

    let stream_id = attachment.stream_id.clone();
    Ok(sse_response(&state, &session_id, &stream_id, attachment))
}

/// Look up the session named by the request header, or create one on first
/// contact.
async fn resolve_session(
    state: &HttpState,
    headers: &HeaderMap,
    auth: Option<AuthorizationContext>,
) -> Result<String, McpHttpError> {
    if let Some(raw) = headers.get(MCP_SESSION_ID_HEADER) {
        let session_id = raw.to_str().map_err(|_| {
            McpHttpError::bad_request("invalid_session", "Mcp-Session-Id header must be valid UTF-8")
        })?;
        return match state.store.get(session_id).await {
            Ok(Some(session)) => Ok(session.id),
            Ok(None) => Err(McpHttpError::not_found(
                "unknown_session",
                "Session not found or has expired",
            )),
            Err(err) => Err(McpHttpError::internal_error(
                "store_error",
                err.to_string(),
            )),
        };
    }

    let session = state
        .store
        .create(auth)
        .await
        .map_err(|err| McpHttpError::internal_error("store_error", err.to_string()))?;
    debug!(session = %session.id, "session created");
    Ok(session.id)
}

/// Upgrade the POST response to SSE and pump the tool's output through it as
/// sequential responses to the original request.
async fn streamed_tool_response(
    state: &HttpState,
    session_id: &str,
    request_id: RequestId,
    mut stream: BoxStream<'static, anyhow::Result<Value>>,
) -> Result<Response, McpHttpError> {
    let attachment = state
        .streams
        .attach(session_id, None, None, None)
        .await
        .map_err(|err| McpHttpError::internal_error("stream_error", err.to_string()))?;
    let stream_id = attachment.stream_id.clone();

    let streams = Arc::clone(&state.streams);
    let session = session_id.to_string();
    let pump_stream_id = stream_id.clone();
    tokio::spawn(async move {
        while let Some(item) = stream.next().await {
            let frame = match item {
                Ok(value) => serde_json::to_value(JsonRpcResponse::success(
                    request_id.clone(),
                    serde_json::to_value(CallToolResult::from_value(value))
                        .unwrap_or(Value::Null),
                )),
                Err(err) => serde_json::to_value(JsonRpcResponse::failure(
                    Some(request_id.clone()),
                    RpcError::internal_error(err.to_string()),
                )),
            };
            let Ok(frame) = frame else { break };
            if !streams.send_to_stream(&session, &pump_stream_id, frame).await {
                return;
            }
        }
        // Exhausted: close the stream so the HTTP response completes.
        streams.detach(&session, &pump_stream_id).await;
    });

    Ok(sse_response(state, session_id, &stream_id, attachment))
}

fn sse_response(
    state: &HttpState,
    session_id: &str,
    stream_id: &str,
    attachment: StreamAttachment,
) -> Response {
    let replay = futures::stream::iter(attachment.replay.into_iter().map(frame_to_event));
    let guard = attachment.guard;
    let live = ReceiverStream::new(attachment.rx).map(move |frame| {
        // The guard rides inside the closure: dropping the response stream
        // detaches the stream record.
        let _ = &guard;
        frame_to_event(frame)
    });
    let stream = replay.chain(live).map(Ok::<_, Infallible>);

    let sse = Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(state.config.session.heartbeat_interval)
            .text("heartbeat"),
    );

    let mut response = sse.into_response();
    set_header(&mut response, MCP_SESSION_ID_HEADER, session_id);
    set_header(&mut response, MCP_STREAM_ID_HEADER, stream_id);
    response
}

fn frame_to_event(frame: OutboundFrame) -> Event {
    Event::default().id(frame.event_id).data(frame.data)
}

async fn collapse_stream(
    id: RequestId,
    mut stream: BoxStream<'static, anyhow::Result<Value>>,
) -> JsonRpcResponse {
    let mut last = Value::Null;
    while let Some(item) = stream.next().await {
        match item {
            Ok(value) => last = value,
            Err(err) => {
                return JsonRpcResponse::failure(
                    Some(id),
                    RpcError::internal_error(err.to_string()),
                )
            }
        }
    }
    JsonRpcResponse::success(
        id,
        serde_json::to_value(CallToolResult::from_value(last)).unwrap_or(Value::Null),
    )
}

fn json_response(response: &JsonRpcResponse, session_id: &str) -> Response {
    let body = serde_json::to_vec(response).unwrap_or_else(|_| b"{}".to_vec());
    build_json(StatusCode::OK, body, session_id)
}

fn accepted_response(session_id: &str) -> Response {
    let mut response = Response::builder()
        .status(StatusCode::ACCEPTED)
        .body(Body::empty())
        .unwrap_or_default();
    set_header(&mut response, MCP_SESSION_ID_HEADER, session_id);
    response
}

fn build_json(status: StatusCode, body: Vec<u8>, session_id: &str) -> Response {
    let mut response = Response::builder()
        .status(status)
        .header(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        )
        .body(Body::from(body))
        .unwrap_or_default();
    set_header(&mut response, MCP_SESSION_ID_HEADER, session_id);
    response
}

fn set_header(response: &mut Response, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        response.headers_mut().insert(name, value);
    }
}

fn accept_includes(headers: &HeaderMap, needle: &str) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|accept| {
            accept
                .split(',')
                .any(|part| part.trim().starts_with(needle) || part.trim() == "*/*")
        })
        .unwrap_or(false)
}

/// POST /elicitation/:id/complete, the external completion callback.
async fn complete_elicitation(
    State(state): State<HttpState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, McpHttpError> {
    let record = state
        .elicitations
        .complete(&id)
        .map_err(elicitation_error)?;
    publish_elicitation_event(&state, &record.id, "completed").await;
    Ok(Json(json!({"success": true, "elicitationId": record.id})))
}

/// POST /elicitation/:id/cancel, the external cancellation callback.
async fn cancel_elicitation(
    State(state): State<HttpState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, McpHttpError> {
    let record = state.elicitations.cancel(&id).map_err(elicitation_error)?;
    publish_elicitation_event(&state, &record.id, "cancelled").await;
    Ok(Json(json!({"success": true, "elicitationId": record.id})))
}

/// GET /elicitation/:id/status polls elicitation state.
async fn elicitation_status(
    State(state): State<HttpState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, McpHttpError> {
    let record = state
        .elicitations
        .get(&id)
        .ok_or_else(|| McpHttpError::not_found("not_found", "Unknown elicitation"))?;
    Ok(Json(serde_json::to_value(record).unwrap_or(Value::Null)))
}

async fn publish_elicitation_event(state: &HttpState, elicitation_id: &str, status: &str) {
    state
        .streams
        .publish_broadcast(json!({
            "jsonrpc": "2.0",
            "method": "notifications/elicitation/complete",
            "params": {"elicitationId": elicitation_id, "status": status},
        }))
        .await;
}

fn elicitation_error(err: ElicitationError) -> McpHttpError {
    match err {
        ElicitationError::NotFound => McpHttpError::not_found("not_found", "Unknown elicitation"),
        ElicitationError::AlreadyCompleted => {
            McpHttpError::bad_request("already_completed", "Elicitation already completed")
        }
        ElicitationError::AlreadyCancelled => {
            McpHttpError::bad_request("already_cancelled", "Elicitation already cancelled")
        }
    }
}

/// GET /healthz reports liveness and uptime outside the JSON-RPC surface.
async fn healthz(State(state): State<HttpState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "name": state.config.protocol.server_name,
        "version": state.config.protocol.server_version,
        "uptime_seconds": state.start_time.elapsed().as_secs(),
    }))
}

//! JSON-RPC dispatcher
//!
//! Decodes inbound frames, routes them against the registry, and maps
//! failures onto the JSON-RPC error taxonomy. Protocol errors are reserved
//! for problems the client must handle structurally; tool execution errors
//! stay in-band (`isError`) so the model can read them and self-correct.
//!
//! Request handling is logically single-threaded per session: a per-session
//! mutex is held for the duration of each dispatch.

use crate::auth::context::AuthorizationContext;
use crate::config::ProtocolConfig;
use crate::protocol::{
    decode_frame, CallToolResult, Frame, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    LogLevel, RequestId, RpcError,
};
use crate::registry::{CompletionService, HandlerContext, Registry, ToolOutcome};
use crate::sanitize::sanitize_value;
use crate::store::SessionStore;
use crate::stream::StreamManager;
use crate::tasks::{TaskError, TaskManager};
use base64::Engine;
use dashmap::DashMap;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Page size for the list methods.
const LIST_PAGE_SIZE: usize = 50;

/// Transport-supplied context for one inbound frame.
#[derive(Clone, Default)]
pub struct RequestContext {
    pub session_id: Option<String>,
    pub auth: Option<AuthorizationContext>,
}

/// The outcome of dispatching a single frame.
pub enum DispatchOutcome {
    Response(JsonRpcResponse),
    /// A streamed tool response: items are delivered as sequential
    /// `JSONRPCResponse` frames carrying the original request id.
    Streaming {
        id: RequestId,
        stream: BoxStream<'static, anyhow::Result<Value>>,
    },
    /// Notifications produce nothing.
    None,
}

pub enum Dispatched {
    Single(DispatchOutcome),
    Batch(Vec<JsonRpcResponse>),
}

enum RouteOutcome {
    Value(Value),
    Stream(BoxStream<'static, anyhow::Result<Value>>),
}

pub struct Dispatcher {
    registry: Arc<Registry>,
    store: Arc<dyn SessionStore>,
    streams: Arc<StreamManager>,
    tasks: Option<Arc<TaskManager>>,
    completions: Option<Arc<dyn CompletionService>>,
    protocol: ProtocolConfig,
    cancellations: DashMap<String, CancellationToken>,
    session_locks: DashMap<String, Arc<Mutex<()>>>,
    /// Self-reference for background (task-deferred) executions.
    weak: std::sync::Weak<Dispatcher>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<Registry>,
        store: Arc<dyn SessionStore>,
        streams: Arc<StreamManager>,
        tasks: Option<Arc<TaskManager>>,
        completions: Option<Arc<dyn CompletionService>>,
        protocol: ProtocolConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            registry,
            store,
            streams,
            tasks,
            completions,
            protocol,
            cancellations: DashMap::new(),
            session_locks: DashMap::new(),
            weak: weak.clone(),
        })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Decode and dispatch a raw JSON value (single frame or batch).
    pub async fn dispatch_value(&self, value: Value, ctx: &RequestContext) -> Dispatched {
        let frame = match decode_frame(value) {
            Ok(frame) => frame,
            Err(err) => {
                return Dispatched::Single(DispatchOutcome::Response(JsonRpcResponse::failure(
                    None, err,
                )))
            }
        };
        match frame {
            Frame::Request(request) => {
                Dispatched::Single(self.dispatch_request(request, ctx).await)
            }
            Frame::Notification(notification) => {
                self.dispatch_notification(notification, ctx).await;
                Dispatched::Single(DispatchOutcome::None)
            }
            Frame::Batch(frames) => {
                let mut responses = Vec::new();
                for frame in frames {
                    match frame {
                        Frame::Request(request) => {
                            match self.dispatch_request(request, ctx).await {
                                DispatchOutcome::Response(response) => responses.push(response),
                                DispatchOutcome::Streaming { id, stream } => {
                                    // Streams cannot interleave inside a batch
                                    // reply; drain to the terminal value.
                                    responses.push(drain_stream_response(id, stream).await);
                                }
                                DispatchOutcome::None => {}
                            }
                        }
                        Frame::Notification(notification) => {
                            self.dispatch_notification(notification, ctx).await;
                        }
                        Frame::Batch(_) => {
                            responses.push(JsonRpcResponse::failure(
                                None,
                                RpcError::invalid_request("Nested batch"),
                            ));
                        }
                    }
                }
                Dispatched::Batch(responses)
            }
        }
    }

    pub async fn dispatch_request(
        &self,
        request: JsonRpcRequest,
        ctx: &RequestContext,
    ) -> DispatchOutcome {
        // At most one request per session is in flight at a time.
        let lock = ctx.session_id.as_ref().map(|session_id| {
            Arc::clone(
                self.session_locks
                    .entry(session_id.clone())
                    .or_insert_with(|| Arc::new(Mutex::new(())))
                    .value(),
            )
        });
        let _guard = match &lock {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };

        if let Some(session_id) = &ctx.session_id {
            let _ = self.store.touch(session_id).await;
        }

        // Task augmentation: `_meta.task.ttl` defers execution.
        if request.method != "initialize" {
            if let Some(ttl) = task_ttl(&request.params) {
                return self.defer_to_task(request, ctx, ttl).await;
            }
        }

        let cancellation = CancellationToken::new();
        let cancel_key = cancellation_key(ctx.session_id.as_deref(), &request.id);
        // `initialize` must not be cancellable.
        if request.method != "initialize" {
            self.cancellations
                .insert(cancel_key.clone(), cancellation.clone());
        }

        let outcome = self
            .execute(
                &request.method,
                request.params.clone(),
                ctx,
                Some(request.id.clone()),
                cancellation,
            )
            .await;
        self.cancellations.remove(&cancel_key);

        match outcome {
            Ok(RouteOutcome::Value(value)) => {
                DispatchOutcome::Response(JsonRpcResponse::success(request.id, value))
            }
            Ok(RouteOutcome::Stream(stream)) => DispatchOutcome::Streaming {
                id: request.id,
                stream,
            },
            Err(err) => DispatchOutcome::Response(JsonRpcResponse::failure(Some(request.id), err)),
        }
    }

    async fn dispatch_notification(
        &self,
        notification: JsonRpcNotification,
        ctx: &RequestContext,
    ) {
        match notification.method.as_str() {
            "notifications/cancelled" => {
                let request_id = notification
                    .params
                    .get("requestId")
                    .cloned()
                    .and_then(|v| serde_json::from_value::<RequestId>(v).ok());
                match request_id {
                    Some(request_id) => {
                        let key = cancellation_key(ctx.session_id.as_deref(), &request_id);
                        match self.cancellations.get(&key) {
                            Some(token) => {
                                debug!(request = %request_id, "cancellation forwarded to handler");
                                token.cancel();
                            }
                            None => {
                                debug!(request = %request_id, "cancellation for unknown or uncancellable request");
                            }
                        }
                    }
                    None => debug!("notifications/cancelled without a requestId"),
                }
            }
            "notifications/initialized" => {
                debug!(session = ?ctx.session_id, "client reports initialization complete");
            }
            other => {
                debug!(method = other, "unknown notification discarded");
            }
        }
    }

    /// Create a task record, answer immediately, and run the method in the
    /// background under the captured authorization context.
    async fn defer_to_task(
        &self,
        request: JsonRpcRequest,
        ctx: &RequestContext,
        ttl_ms: u64,
    ) -> DispatchOutcome {
        let Some(tasks) = &self.tasks else {
            return DispatchOutcome::Response(JsonRpcResponse::failure(
                Some(request.id),
                RpcError::method_not_found("tasks"),
            ));
        };
        let Some(dispatcher) = self.weak.upgrade() else {
            return DispatchOutcome::Response(JsonRpcResponse::failure(
                Some(request.id),
                RpcError::internal_error("Dispatcher is shutting down"),
            ));
        };
        let (record, cancellation) =
            tasks.create(Some(ttl_ms), ctx.auth.clone(), ctx.session_id.clone());

        let tasks = Arc::clone(tasks);
        let ctx = ctx.clone();
        let task_id = record.id.clone();
        let method = request.method.clone();
        let params = request.params.clone();
        tokio::spawn(async move {
            let outcome = dispatcher
                .execute(&method, params, &ctx, None, cancellation.clone())
                .await;
            if cancellation.is_cancelled() {
                return;
            }
            let result = match outcome {
                Ok(RouteOutcome::Value(value)) => tasks.complete(&task_id, value),
                Ok(RouteOutcome::Stream(stream)) => match drain_stream(stream).await {
                    Ok(value) => tasks.complete(&task_id, value),
                    Err(message) => tasks.fail(&task_id, message),
                },
                Err(err) => tasks.fail(&task_id, err.message),
            };
            if let Err(TaskError::AlreadyTerminal) = result {
                debug!(task = %task_id, "task finished after reaching a terminal state");
            }
        });

        let result = serde_json::to_value(record.create_result())
            .unwrap_or_else(|_| json!({"taskId": record.id}));
        DispatchOutcome::Response(JsonRpcResponse::success(request.id, result))
    }

    async fn execute(
        &self,
        method: &str,
        params: Value,
        ctx: &RequestContext,
        request_id: Option<RequestId>,
        cancellation: CancellationToken,
    ) -> Result<RouteOutcome, RpcError> {
        let handler_ctx = HandlerContext {
            session_id: ctx.session_id.clone(),
            request_id,
            auth: ctx.auth.clone(),
            cancellation,
        };

        match method {
            "initialize" => self.initialize(&params).map(RouteOutcome::Value),
            "ping" => Ok(RouteOutcome::Value(json!({}))),
            "tools/list" => self.list_tools(&params).map(RouteOutcome::Value),
            "resources/list" => self.list_resources(&params).map(RouteOutcome::Value),
            "prompts/list" => self.list_prompts(&params).map(RouteOutcome::Value),
            "tools/call" => self.call_tool(params, handler_ctx).await,
            "resources/read" => self
                .read_resource(params, handler_ctx)
                .await
                .map(RouteOutcome::Value),
            "prompts/get" => self
                .get_prompt(params, handler_ctx)
                .await
                .map(RouteOutcome::Value),
            "logging/setLevel" => self.set_log_level(&params, ctx).await.map(RouteOutcome::Value),
            "completion/complete" => match &self.completions {
                Some(service) => service
                    .complete(params, handler_ctx)
                    .await
                    .map(RouteOutcome::Value)
                    .map_err(|err| RpcError::internal_error(err.to_string())),
                None => Err(RpcError::method_not_found(method)),
            },
            "tasks/get" => self.task_get(&params).map(RouteOutcome::Value),
            "tasks/list" => self.task_list(ctx).map(RouteOutcome::Value),
            "tasks/cancel" => self.task_cancel(&params).map(RouteOutcome::Value),
            other => Err(RpcError::method_not_found(other)),
        }
    }

    /// `initialize` is idempotent: it reports capabilities and never mutates
    /// session state.
    fn initialize(&self, params: &Value) -> Result<Value, RpcError> {
        let requested = params.get("protocolVersion").and_then(Value::as_str);
        let negotiated = match requested {
            Some(version) if self.protocol.supported_versions.iter().any(|v| v == version) => {
                version.to_string()
            }
            _ => self.protocol.protocol_version.clone(),
        };

        let mut capabilities = json!({
            "tools": {"listChanged": false},
            "logging": {},
        });
        if self.registry.has_resources() {
            capabilities["resources"] = json!({"subscribe": false, "listChanged": false});
        }
        if self.registry.has_prompts() {
            capabilities["prompts"] = json!({"listChanged": false});
        }
        if self.completions.is_some() {
            capabilities["completions"] = json!({});
        }
        if self.tasks.is_some() {
            capabilities["tasks"] = json!({});
        }

        let mut result = json!({
            "protocolVersion": negotiated,
            "capabilities": capabilities,
            "serverInfo": {
                "name": self.protocol.server_name,
                "version": self.protocol.server_version,
            },
        });
        if let Some(instructions) = &self.protocol.instructions {
            result["instructions"] = json!(instructions);
        }
        Ok(result)
    }

    fn list_tools(&self, params: &Value) -> Result<Value, RpcError> {
        let defs = self.registry.tool_definitions();
        let (page, next_cursor) = paginate(&defs, params)?;
        let mut result = json!({ "tools": page });
        if let Some(cursor) = next_cursor {
            result["nextCursor"] = json!(cursor);
        }
        Ok(result)
    }

    fn list_resources(&self, params: &Value) -> Result<Value, RpcError> {
        let defs = self.registry.resource_definitions();
        let (page, next_cursor) = paginate(&defs, params)?;
        let mut result = json!({ "resources": page });
        if let Some(cursor) = next_cursor {
            result["nextCursor"] = json!(cursor);
        }
        Ok(result)
    }

    fn list_prompts(&self, params: &Value) -> Result<Value, RpcError> {
        let defs = self.registry.prompt_definitions();
        let (page, next_cursor) = paginate(&defs, params)?;
        let mut result = json!({ "prompts": page });
        if let Some(cursor) = next_cursor {
            result["nextCursor"] = json!(cursor);
        }
        Ok(result)
    }

    async fn call_tool(
        &self,
        params: Value,
        handler_ctx: HandlerContext,
    ) -> Result<RouteOutcome, RpcError> {
        // Outer parameter shape first; this is a protocol-level concern.
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::invalid_params("tools/call requires a 'name' field"))?;
        let arguments = params
            .get("arguments")
            .cloned()
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()));

        let tool = self
            .registry
            .tool(name)
            .ok_or_else(|| RpcError::method_not_found(name))?;

        let Some(handler) = &tool.handler else {
            return Ok(RouteOutcome::Value(tool_result_value(
                CallToolResult::error(format!("Tool '{name}' has no handler registered")),
            )));
        };

        // Annotations drive risk logging only, never authorization.
        if tool
            .definition
            .annotations
            .as_ref()
            .and_then(|a| a.destructive_hint)
            .unwrap_or(false)
        {
            warn!(tool = name, session = ?handler_ctx.session_id, "invoking tool marked destructive");
        }

        if let Err(err) = sanitize_value(&arguments) {
            return Err(RpcError::invalid_params(err.to_string()));
        }

        if let Err(failure) = tool.schema.validate(&arguments) {
            // In-band per MCP: schema mismatches are tool errors, not
            // protocol errors.
            return Ok(RouteOutcome::Value(tool_result_value(
                CallToolResult::error(format!("Invalid tool arguments: {failure}")),
            )));
        }

        match handler.call(arguments, handler_ctx).await {
            Ok(ToolOutcome::Value(value)) => Ok(RouteOutcome::Value(tool_result_value(
                CallToolResult::from_value(value),
            ))),
            Ok(ToolOutcome::Result(result)) => Ok(RouteOutcome::Value(tool_result_value(result))),
            Ok(ToolOutcome::Stream(stream)) => Ok(RouteOutcome::Stream(stream)),
            Err(err) => Ok(RouteOutcome::Value(tool_result_value(
                CallToolResult::error(err.to_string()),
            ))),
        }
    }

    async fn read_resource(
        &self,
        params: Value,
        handler_ctx: HandlerContext,
    ) -> Result<Value, RpcError> {
        let uri = params
            .get("uri")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::invalid_params("resources/read requires a 'uri' field"))?;
        sanitize_value(&params).map_err(|err| RpcError::invalid_params(err.to_string()))?;

        let resource = self
            .registry
            .resource(uri)
            .ok_or_else(|| RpcError::method_not_found(uri))?;

        if let Err(failure) = resource.uri_schema.validate(&Value::String(uri.to_string())) {
            return Err(RpcError::invalid_params(format!(
                "Resource URI rejected: {failure}"
            )));
        }

        let handler = resource
            .handler
            .as_ref()
            .ok_or_else(|| RpcError::internal_error("Resource has no handler registered"))?;

        let result = handler
            .read(uri, handler_ctx)
            .await
            .map_err(|err| RpcError::internal_error(err.to_string()))?;
        serde_json::to_value(result).map_err(|err| RpcError::internal_error(err.to_string()))
    }

    async fn get_prompt(
        &self,
        params: Value,
        handler_ctx: HandlerContext,
    ) -> Result<Value, RpcError> {
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::invalid_params("prompts/get requires a 'name' field"))?;
        let arguments = params
            .get("arguments")
            .cloned()
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
        sanitize_value(&arguments).map_err(|err| RpcError::invalid_params(err.to_string()))?;

        let prompt = self
            .registry
            .prompt(name)
            .ok_or_else(|| RpcError::method_not_found(name))?;

        if let Err(failure) = prompt.argument_schema.validate(&arguments) {
            return Err(RpcError::invalid_params(format!(
                "Invalid prompt arguments: {failure}"
            )));
        }

        let handler = prompt
            .handler
            .as_ref()
            .ok_or_else(|| RpcError::internal_error("Prompt has no handler registered"))?;

        let result = handler
            .get(arguments, handler_ctx)
            .await
            .map_err(|err| RpcError::internal_error(err.to_string()))?;
        serde_json::to_value(result).map_err(|err| RpcError::internal_error(err.to_string()))
    }

    async fn set_log_level(
        &self,
        params: &Value,
        ctx: &RequestContext,
    ) -> Result<Value, RpcError> {
        let level: LogLevel = params
            .get("level")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| {
                RpcError::invalid_params(
                    "level must be one of debug, info, notice, warning, error, critical, alert, emergency",
                )
            })?;
        if let Some(session_id) = &ctx.session_id {
            let _ = self.store.set_log_level(session_id, level).await;
        }
        Ok(json!({}))
    }

    fn task_get(&self, params: &Value) -> Result<Value, RpcError> {
        let tasks = self
            .tasks
            .as_ref()
            .ok_or_else(|| RpcError::method_not_found("tasks/get"))?;
        let task_id = params
            .get("taskId")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::invalid_params("tasks/get requires a 'taskId' field"))?;
        let record = tasks
            .get(task_id)
            .ok_or_else(|| RpcError::invalid_params("Unknown task"))?;
        Ok(task_status_value(&record))
    }

    fn task_list(&self, ctx: &RequestContext) -> Result<Value, RpcError> {
        let tasks = self
            .tasks
            .as_ref()
            .ok_or_else(|| RpcError::method_not_found("tasks/list"))?;
        let records: Vec<Value> = tasks
            .list(ctx.auth.as_ref())
            .iter()
            .map(task_status_value)
            .collect();
        Ok(json!({ "tasks": records }))
    }

    fn task_cancel(&self, params: &Value) -> Result<Value, RpcError> {
        let tasks = self
            .tasks
            .as_ref()
            .ok_or_else(|| RpcError::method_not_found("tasks/cancel"))?;
        let task_id = params
            .get("taskId")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::invalid_params("tasks/cancel requires a 'taskId' field"))?;
        let record = tasks.cancel(task_id).map_err(|err| match err {
            TaskError::NotFound => RpcError::invalid_params("Unknown task"),
            TaskError::AlreadyTerminal => {
                RpcError::invalid_params("Task already in a terminal state")
            }
        })?;
        Ok(task_status_value(&record))
    }
}

/// Status view: everything except the terminal result, which stays private
/// to the task record.
fn task_status_value(record: &crate::tasks::TaskRecord) -> Value {
    let mut value = json!({
        "taskId": record.id,
        "status": record.status,
        "createdAt": record.created_at,
        "ttl": record.ttl_ms,
    });
    if let Some(message) = &record.message {
        value["statusMessage"] = json!(message);
    }
    if let Some(poll) = record.poll_interval_ms {
        value["pollInterval"] = json!(poll);
    }
    value
}

fn tool_result_value(result: CallToolResult) -> Value {
    serde_json::to_value(result).unwrap_or_else(|_| json!({"content": [], "isError": true}))
}

fn cancellation_key(session_id: Option<&str>, request_id: &RequestId) -> String {
    format!("{}/{request_id}", session_id.unwrap_or("-"))
}

fn task_ttl(params: &Value) -> Option<u64> {
    params
        .get("_meta")
        .and_then(|m| m.get("task"))
        .and_then(|t| t.get("ttl"))
        .and_then(Value::as_u64)
}

/// Opaque cursor pagination over a sorted definition slice.
fn paginate<T: serde::Serialize>(
    items: &[T],
    params: &Value,
) -> Result<(Vec<Value>, Option<String>), RpcError> {
    let offset = match params.get("cursor").and_then(Value::as_str) {
        Some(cursor) => decode_cursor(cursor)?,
        None => 0,
    };
    let page: Vec<Value> = items
        .iter()
        .skip(offset)
        .take(LIST_PAGE_SIZE)
        .map(|item| serde_json::to_value(item).unwrap_or(Value::Null))
        .collect();
    let consumed = offset + page.len();
    let next = (consumed < items.len()).then(|| encode_cursor(consumed));
    Ok((page, next))
}

fn encode_cursor(offset: usize) -> String {
    base64::engine::general_purpose::STANDARD.encode(offset.to_string())
}

fn decode_cursor(cursor: &str) -> Result<usize, RpcError> {
    base64::engine::general_purpose::STANDARD
        .decode(cursor)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| RpcError::invalid_params("Malformed cursor"))
}

/// Collapse a streamed tool response into its terminal value.
async fn drain_stream(
    mut stream: BoxStream<'static, anyhow::Result<Value>>,
) -> Result<Value, String> {
    let mut last = Value::Null;
    while let Some(item) = stream.next().await {
        match item {
            Ok(value) => last = value,
            Err(err) => return Err(err.to_string()),
        }
    }
    Ok(last)
}

async fn drain_stream_response(
    id: RequestId,
    stream: BoxStream<'static, anyhow::Result<Value>>,
) -> JsonRpcResponse {
    match drain_stream(stream).await {
        Ok(value) => JsonRpcResponse::success(
            id,
            tool_result_value(CallToolResult::from_value(value)),
        ),
        Err(message) => JsonRpcResponse::failure(Some(id), RpcError::internal_error(message)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::LocalBroker;
    use crate::protocol::ToolDefinition;
    use crate::registry::{Registry, ToolHandler};
    use crate::store::MemoryStore;
    use std::time::Duration;

    struct EchoTool;

    #[async_trait::async_trait]
    impl ToolHandler for EchoTool {
        async fn call(&self, arguments: Value, _ctx: HandlerContext) -> anyhow::Result<ToolOutcome> {
            let msg = arguments
                .get("msg")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            Ok(ToolOutcome::Value(json!(msg)))
        }
    }

    fn echo_tool() -> ToolDefinition {
        ToolDefinition {
            name: "echo".to_string(),
            description: Some("Echo a message".to_string()),
            input_schema: json!({
                "type": "object",
                "properties": {"msg": {"type": "string"}},
                "required": ["msg"]
            }),
            annotations: None,
        }
    }

    async fn dispatcher() -> (Arc<Dispatcher>, Arc<MemoryStore>) {
        let registry = Registry::builder()
            .tool(echo_tool(), Some(Arc::new(EchoTool)))
            .unwrap()
            .build();
        let store = Arc::new(MemoryStore::new());
        let broker = Arc::new(LocalBroker::new());
        let streams = StreamManager::new(store.clone(), broker, 16);
        let tasks = Arc::new(TaskManager::new(
            Duration::from_secs(300),
            Duration::from_secs(86_400),
            Some(1000),
        ));
        let dispatcher = Dispatcher::new(
            registry,
            store.clone(),
            streams,
            Some(tasks),
            None,
            ProtocolConfig::default(),
        );
        (dispatcher, store)
    }

    async fn single(
        dispatcher: &Arc<Dispatcher>,
        request: Value,
        ctx: &RequestContext,
    ) -> JsonRpcResponse {
        match dispatcher.dispatch_value(request, ctx).await {
            Dispatched::Single(DispatchOutcome::Response(response)) => response,
            _ => panic!("expected a single response"),
        }
    }

    #[tokio::test]
    async fn initialize_reports_capabilities_and_is_idempotent() {
        let (dispatcher, _) = dispatcher().await;
        let ctx = RequestContext::default();
        let request = json!({
            "jsonrpc": "2.0", "id": 1, "method": "initialize",
            "params": {"protocolVersion": "draft", "capabilities": {}, "clientInfo": {"name": "t", "version": "1"}}
        });

        let first = single(&dispatcher, request.clone(), &ctx).await;
        let second = single(&dispatcher, request, &ctx).await;
        let result = first.result.unwrap();
        assert_eq!(result["protocolVersion"], "draft");
        assert_eq!(result["serverInfo"]["name"], "portico");
        assert!(result["capabilities"]["tools"].is_object());
        assert_eq!(result, second.result.unwrap());
    }

    #[tokio::test]
    async fn echo_tool_round_trip() {
        let (dispatcher, _) = dispatcher().await;
        let ctx = RequestContext::default();
        let response = single(
            &dispatcher,
            json!({
                "jsonrpc": "2.0", "id": 2, "method": "tools/call",
                "params": {"name": "echo", "arguments": {"msg": "hi"}}
            }),
            &ctx,
        )
        .await;
        let result = response.result.unwrap();
        assert_eq!(result["content"][0], json!({"type": "text", "text": "hi"}));
        assert!(result.get("isError").is_none());
    }

    #[tokio::test]
    async fn invalid_arguments_are_in_band_tool_errors() {
        let (dispatcher, _) = dispatcher().await;
        let ctx = RequestContext::default();
        let response = single(
            &dispatcher,
            json!({
                "jsonrpc": "2.0", "id": 3, "method": "tools/call",
                "params": {"name": "echo", "arguments": {"msg": 42}}
            }),
            &ctx,
        )
        .await;
        let result = response.result.unwrap();
        assert_eq!(result["isError"], json!(true));
        let text = result["content"][0]["text"].as_str().unwrap();
        assert!(text.starts_with("Invalid tool arguments"));
    }

    #[tokio::test]
    async fn unknown_tool_is_a_protocol_error() {
        let (dispatcher, _) = dispatcher().await;
        let ctx = RequestContext::default();
        let response = single(
            &dispatcher,
            json!({
                "jsonrpc": "2.0", "id": 4, "method": "tools/call",
                "params": {"name": "missing", "arguments": {}}
            }),
            &ctx,
        )
        .await;
        assert_eq!(
            response.error.unwrap().code,
            crate::protocol::error_codes::METHOD_NOT_FOUND
        );
    }

    #[tokio::test]
    async fn deeply_nested_arguments_are_rejected_as_invalid_params() {
        let (dispatcher, _) = dispatcher().await;
        let ctx = RequestContext::default();
        let mut nested = json!("leaf");
        for _ in 0..11 {
            nested = json!({ "inner": nested });
        }
        let response = single(
            &dispatcher,
            json!({
                "jsonrpc": "2.0", "id": 5, "method": "tools/call",
                "params": {"name": "echo", "arguments": nested}
            }),
            &ctx,
        )
        .await;
        assert_eq!(
            response.error.unwrap().code,
            crate::protocol::error_codes::INVALID_PARAMS
        );
    }

    #[tokio::test]
    async fn ping_returns_empty_object() {
        let (dispatcher, _) = dispatcher().await;
        let ctx = RequestContext::default();
        let response = single(
            &dispatcher,
            json!({"jsonrpc": "2.0", "id": 6, "method": "ping"}),
            &ctx,
        )
        .await;
        assert_eq!(response.result.unwrap(), json!({}));
    }

    #[tokio::test]
    async fn set_level_validates_the_level_set() {
        let (dispatcher, store) = dispatcher().await;
        let session = store.create(None).await.unwrap();
        let ctx = RequestContext {
            session_id: Some(session.id.clone()),
            auth: None,
        };
        let ok = single(
            &dispatcher,
            json!({"jsonrpc": "2.0", "id": 7, "method": "logging/setLevel", "params": {"level": "warning"}}),
            &ctx,
        )
        .await;
        assert!(ok.error.is_none());
        assert_eq!(
            store.get(&session.id).await.unwrap().unwrap().log_level,
            Some(LogLevel::Warning)
        );

        let bad = single(
            &dispatcher,
            json!({"jsonrpc": "2.0", "id": 8, "method": "logging/setLevel", "params": {"level": "loud"}}),
            &ctx,
        )
        .await;
        assert_eq!(
            bad.error.unwrap().code,
            crate::protocol::error_codes::INVALID_PARAMS
        );
    }

    #[tokio::test]
    async fn deferred_request_returns_task_and_completes() {
        let (dispatcher, _) = dispatcher().await;
        let ctx = RequestContext::default();
        let response = single(
            &dispatcher,
            json!({
                "jsonrpc": "2.0", "id": 9, "method": "tools/call",
                "params": {
                    "name": "echo",
                    "arguments": {"msg": "later"},
                    "_meta": {"task": {"ttl": 60000}}
                }
            }),
            &ctx,
        )
        .await;
        let result = response.result.unwrap();
        let task_id = result["taskId"].as_str().unwrap().to_string();
        assert_eq!(result["status"], "working");
        assert_eq!(result["ttl"], 60000);

        // Poll until the background execution completes.
        let mut status = String::new();
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let polled = single(
                &dispatcher,
                json!({"jsonrpc": "2.0", "id": 10, "method": "tasks/get", "params": {"taskId": task_id}}),
                &ctx,
            )
            .await;
            let result = polled.result.unwrap();
            assert!(result.get("result").is_none(), "tasks/get must not leak the result");
            status = result["status"].as_str().unwrap().to_string();
            if status == "completed" {
                break;
            }
        }
        assert_eq!(status, "completed");

        let cancel = single(
            &dispatcher,
            json!({"jsonrpc": "2.0", "id": 11, "method": "tasks/cancel", "params": {"taskId": task_id}}),
            &ctx,
        )
        .await;
        assert_eq!(
            cancel.error.unwrap().code,
            crate::protocol::error_codes::INVALID_PARAMS
        );
    }

    #[tokio::test]
    async fn batch_requests_produce_batch_responses() {
        let (dispatcher, _) = dispatcher().await;
        let ctx = RequestContext::default();
        let reply = dispatcher
            .dispatch_value(
                json!([
                    {"jsonrpc": "2.0", "id": 1, "method": "ping"},
                    {"jsonrpc": "2.0", "method": "notifications/initialized"},
                    {"jsonrpc": "2.0", "id": 2, "method": "nope"}
                ]),
                &ctx,
            )
            .await;
        match reply {
            Dispatched::Batch(responses) => {
                assert_eq!(responses.len(), 2);
                assert!(responses[0].result.is_some());
                assert_eq!(
                    responses[1].error.as_ref().unwrap().code,
                    crate::protocol::error_codes::METHOD_NOT_FOUND
                );
            }
            _ => panic!("expected batch reply"),
        }
    }

    #[tokio::test]
    async fn list_pagination_yields_opaque_cursor() {
        let mut builder = Registry::builder();
        for n in 0..60 {
            builder = builder
                .tool_with_schema(
                    ToolDefinition {
                        name: format!("tool-{n:02}"),
                        description: None,
                        input_schema: json!({"type": "object"}),
                        annotations: None,
                    },
                    None,
                    None,
                )
                .unwrap();
        }
        let store = Arc::new(MemoryStore::new());
        let broker = Arc::new(LocalBroker::new());
        let streams = StreamManager::new(store.clone(), broker, 16);
        let dispatcher = Dispatcher::new(
            builder.build(),
            store,
            streams,
            None,
            None,
            ProtocolConfig::default(),
        );

        let ctx = RequestContext::default();
        let first = single(
            &dispatcher,
            json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}),
            &ctx,
        )
        .await;
        let result = first.result.unwrap();
        assert_eq!(result["tools"].as_array().unwrap().len(), 50);
        let cursor = result["nextCursor"].as_str().unwrap().to_string();

        let second = single(
            &dispatcher,
            json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list", "params": {"cursor": cursor}}),
            &ctx,
        )
        .await;
        let result = second.result.unwrap();
        assert_eq!(result["tools"].as_array().unwrap().len(), 10);
        assert!(result.get("nextCursor").is_none());

        // tasks/* without the capability is METHOD_NOT_FOUND.
        let missing = single(
            &dispatcher,
            json!({"jsonrpc": "2.0", "id": 3, "method": "tasks/list"}),
            &ctx,
        )
        .await;
        assert_eq!(
            missing.error.unwrap().code,
            crate::protocol::error_codes::METHOD_NOT_FOUND
        );
    }
}

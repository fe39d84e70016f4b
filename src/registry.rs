//! Tool, resource, and prompt registries
//!
//! Registrations are additive and process-lifetime-scoped: they are gathered
//! through the builder and frozen at server-ready, after which the registry
//! is shared read-only. Re-registering a key replaces the prior entry.

use crate::auth::context::AuthorizationContext;
use crate::protocol::{
    CallToolResult, GetPromptResult, PromptDefinition, ReadResourceResult, RequestId,
    ResourceDefinition, ToolDefinition,
};
use crate::schema::{SchemaError, SchemaKind};
use anyhow::Result;
use futures::stream::BoxStream;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Context handed to every handler invocation. Handlers hold it only for the
/// duration of the request.
#[derive(Clone)]
pub struct HandlerContext {
    pub session_id: Option<String>,
    pub request_id: Option<RequestId>,
    pub auth: Option<AuthorizationContext>,
    /// Cooperative cancellation; fired by `notifications/cancelled` and task
    /// cancellation.
    pub cancellation: CancellationToken,
}

impl HandlerContext {
    pub fn detached() -> Self {
        Self {
            session_id: None,
            request_id: None,
            auth: None,
            cancellation: CancellationToken::new(),
        }
    }
}

/// What a tool handler produced: a terminal value, an already-shaped result,
/// or a lazy sequence of values with the last item treated as terminal.
pub enum ToolOutcome {
    Value(Value),
    Result(CallToolResult),
    Stream(BoxStream<'static, Result<Value>>),
}

#[async_trait::async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, arguments: Value, ctx: HandlerContext) -> Result<ToolOutcome>;
}

#[async_trait::async_trait]
pub trait ResourceHandler: Send + Sync {
    async fn read(&self, uri: &str, ctx: HandlerContext) -> Result<ReadResourceResult>;
}

#[async_trait::async_trait]
pub trait PromptHandler: Send + Sync {
    async fn get(&self, arguments: Value, ctx: HandlerContext) -> Result<GetPromptResult>;
}

/// Optional completion service backing `completion/complete`.
#[async_trait::async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(&self, params: Value, ctx: HandlerContext) -> Result<Value>;
}

pub struct ToolRegistration {
    pub definition: ToolDefinition,
    /// Internal typed schema used for validation; may differ from the
    /// transport-visible `input_schema`.
    pub schema: SchemaKind,
    pub handler: Option<Arc<dyn ToolHandler>>,
}

pub struct ResourceRegistration {
    pub definition: ResourceDefinition,
    pub uri_schema: SchemaKind,
    pub handler: Option<Arc<dyn ResourceHandler>>,
}

pub struct PromptRegistration {
    pub definition: PromptDefinition,
    pub argument_schema: SchemaKind,
    pub handler: Option<Arc<dyn PromptHandler>>,
}

/// Frozen registry shared by the dispatcher.
#[derive(Default)]
pub struct Registry {
    tools: HashMap<String, ToolRegistration>,
    resources: HashMap<String, ResourceRegistration>,
    prompts: HashMap<String, PromptRegistration>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn tool(&self, name: &str) -> Option<&ToolRegistration> {
        self.tools.get(name)
    }

    pub fn resource(&self, uri: &str) -> Option<&ResourceRegistration> {
        self.resources.get(uri)
    }

    pub fn prompt(&self, name: &str) -> Option<&PromptRegistration> {
        self.prompts.get(name)
    }

    /// Tool definitions sorted by name for stable pagination.
    pub fn tool_definitions(&self) -> Vec<&ToolDefinition> {
        let mut defs: Vec<_> = self.tools.values().map(|t| &t.definition).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn resource_definitions(&self) -> Vec<&ResourceDefinition> {
        let mut defs: Vec<_> = self.resources.values().map(|r| &r.definition).collect();
        defs.sort_by(|a, b| a.uri.cmp(&b.uri));
        defs
    }

    pub fn prompt_definitions(&self) -> Vec<&PromptDefinition> {
        let mut defs: Vec<_> = self.prompts.values().map(|p| &p.definition).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn tool_count(&self) -> usize {
        self.tools.len()
    }

    pub fn has_resources(&self) -> bool {
        !self.resources.is_empty()
    }

    pub fn has_prompts(&self) -> bool {
        !self.prompts.is_empty()
    }
}

/// Mutable registration surface; consumed by `build()` so nothing can mutate
/// the registry once the server is ready.
#[derive(Default)]
pub struct RegistryBuilder {
    registry: Registry,
}

impl RegistryBuilder {
    /// Register a tool. The definition's `input_schema` doubles as the
    /// internal validation schema unless [`tool_with_schema`] is used.
    ///
    /// [`tool_with_schema`]: RegistryBuilder::tool_with_schema
    pub fn tool(
        self,
        definition: ToolDefinition,
        handler: Option<Arc<dyn ToolHandler>>,
    ) -> Result<Self, SchemaError> {
        let schema = definition.input_schema.clone();
        self.tool_with_schema(definition, Some(schema), handler)
    }

    /// Register a tool with an explicit internal schema (or none).
    pub fn tool_with_schema(
        mut self,
        definition: ToolDefinition,
        internal_schema: Option<Value>,
        handler: Option<Arc<dyn ToolHandler>>,
    ) -> Result<Self, SchemaError> {
        let schema = SchemaKind::object(internal_schema.as_ref())?;
        self.registry.tools.insert(
            definition.name.clone(),
            ToolRegistration {
                definition,
                schema,
                handler,
            },
        );
        Ok(self)
    }

    pub fn resource(
        mut self,
        definition: ResourceDefinition,
        uri_schema: Option<Value>,
        handler: Option<Arc<dyn ResourceHandler>>,
    ) -> Result<Self, SchemaError> {
        let uri_schema = SchemaKind::uri(uri_schema.as_ref())?;
        self.registry.resources.insert(
            definition.uri.clone(),
            ResourceRegistration {
                definition,
                uri_schema,
                handler,
            },
        );
        Ok(self)
    }

    pub fn prompt(
        mut self,
        definition: PromptDefinition,
        argument_schema: Option<Value>,
        handler: Option<Arc<dyn PromptHandler>>,
    ) -> Result<Self, SchemaError> {
        let argument_schema = SchemaKind::object(argument_schema.as_ref())?;
        self.registry.prompts.insert(
            definition.name.clone(),
            PromptRegistration {
                definition,
                argument_schema,
                handler,
            },
        );
        Ok(self)
    }

    pub fn build(self) -> Arc<Registry> {
        Arc::new(self.registry)
    }
}

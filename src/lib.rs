// Portico MCP - Model Context Protocol server framework
// Root library module

pub mod auth;
pub mod broker;
pub mod config;
pub mod dispatch;
pub mod elicitation;
pub mod http;
pub mod observability;
pub mod protocol;
pub mod registry;
pub mod sanitize;
pub mod schema;
pub mod server;
pub mod stdio;
pub mod store;
pub mod stream;
pub mod sweeper;
pub mod tasks;

// Re-export key types
pub use auth::{AuthorizationContext, OAuthRefreshClient, TokenValidator};
pub use broker::{LocalBroker, MessageBroker};
pub use config::Config;
pub use dispatch::{Dispatcher, RequestContext};
pub use elicitation::{ElicitationManager, ElicitationRecord, ElicitationStatus};
pub use observability::{init_logging, init_logging_with_level, init_stderr_logging};
pub use protocol::{
    CallToolResult, ContentBlock, LogLevel, PromptDefinition, RequestId, ResourceDefinition,
    TaskStatus, ToolAnnotations, ToolDefinition,
};
pub use registry::{
    CompletionService, HandlerContext, PromptHandler, Registry, RegistryBuilder, ResourceHandler,
    ToolHandler, ToolOutcome,
};
pub use server::{McpServer, McpServerBuilder, ServerHandle};
pub use store::{MemoryStore, SessionStore};
pub use stream::StreamManager;
pub use tasks::{TaskManager, TaskRecord};

//! Server assembly
//!
//! Wires the registries, store, broker, dispatcher, stream manager, task and
//! elicitation subsystems, and the authorization pipeline into one runnable
//! server. The builder freezes everything at `build()`; nothing registers
//! after that.

use crate::auth::{AuthState, OAuthRefreshClient, TokenValidator};
use crate::broker::{LocalBroker, MessageBroker};
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::elicitation::{ElicitationManager, ElicitationRecord};
use crate::http::{create_router, HttpState};
use crate::protocol::LogLevel;
use crate::registry::{CompletionService, Registry};
use crate::stdio::StdioTransport;
use crate::store::{MemoryStore, SessionStore};
use crate::stream::StreamManager;
use crate::sweeper::Sweeper;
use crate::tasks::TaskManager;
use anyhow::{anyhow, Result};
use axum::Router;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{debug, info};

pub struct McpServerBuilder {
    config: Config,
    registry: Option<Arc<Registry>>,
    store: Option<Arc<dyn SessionStore>>,
    broker: Option<Arc<dyn MessageBroker>>,
    completions: Option<Arc<dyn CompletionService>>,
    refresher: Option<Arc<dyn OAuthRefreshClient>>,
}

impl McpServerBuilder {
    pub fn registry(mut self, registry: Arc<Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Substitute a distributed store backing; defaults to in-memory.
    pub fn store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Substitute a distributed broker; defaults to in-process.
    pub fn broker(mut self, broker: Arc<dyn MessageBroker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn completions(mut self, service: Arc<dyn CompletionService>) -> Self {
        self.completions = Some(service);
        self
    }

    /// Outbound OAuth client used for server-side token refresh.
    pub fn refresher(mut self, refresher: Arc<dyn OAuthRefreshClient>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    pub async fn build(self) -> Result<McpServer> {
        let config = Arc::new(self.config);
        let registry = self.registry.unwrap_or_else(|| Registry::builder().build());
        let store: Arc<dyn SessionStore> =
            self.store.unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let broker: Arc<dyn MessageBroker> =
            self.broker.unwrap_or_else(|| Arc::new(LocalBroker::new()));

        let streams = StreamManager::new(
            store.clone(),
            broker.clone(),
            config.session.stream_queue_capacity,
        );
        streams.start().await;

        let tasks = config.tasks.enabled.then(|| {
            Arc::new(TaskManager::new(
                config.tasks.default_ttl,
                config.tasks.max_ttl,
                config.tasks.poll_interval_ms,
            ))
        });
        let elicitations = Arc::new(ElicitationManager::new(config.elicitation.record_ttl));

        let dispatcher = Dispatcher::new(
            registry.clone(),
            store.clone(),
            streams.clone(),
            tasks.clone(),
            self.completions,
            config.protocol.clone(),
        );

        let auth = if config.authorization.enabled {
            let auth_config = Arc::new(config.authorization.clone());
            let validator = Arc::new(TokenValidator::new(auth_config.clone()));
            Some(AuthState {
                config: auth_config,
                validator,
                store: store.clone(),
                refresher: self.refresher,
            })
        } else {
            None
        };

        info!(
            name = %config.protocol.server_name,
            tools = registry.tool_count(),
            authorization = config.authorization.enabled,
            "server assembled"
        );

        Ok(McpServer {
            config,
            registry,
            store,
            broker,
            streams,
            tasks,
            elicitations,
            dispatcher,
            auth,
            start_time: Instant::now(),
        })
    }
}

pub struct McpServer {
    config: Arc<Config>,
    registry: Arc<Registry>,
    store: Arc<dyn SessionStore>,
    broker: Arc<dyn MessageBroker>,
    streams: Arc<StreamManager>,
    tasks: Option<Arc<TaskManager>>,
    elicitations: Arc<ElicitationManager>,
    dispatcher: Arc<Dispatcher>,
    auth: Option<AuthState>,
    start_time: Instant,
}

/// Handle to a running HTTP server.
pub struct ServerHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<()>,
    sweeper: tokio::task::JoinHandle<()>,
    pub local_addr: SocketAddr,
}

impl ServerHandle {
    /// Signal shutdown and wait for the listener to wind down. Connections
    /// that refuse to drain (long-lived SSE streams) are aborted after a
    /// grace period.
    pub async fn close(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.sweeper.abort();
        if tokio::time::timeout(std::time::Duration::from_secs(5), &mut self.task)
            .await
            .is_err()
        {
            self.task.abort();
        }
    }
}

impl McpServer {
    pub fn builder(config: Config) -> McpServerBuilder {
        McpServerBuilder {
            config,
            registry: None,
            store: None,
            broker: None,
            completions: None,
            refresher: None,
        }
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn streams(&self) -> &Arc<StreamManager> {
        &self.streams
    }

    pub fn elicitations(&self) -> &Arc<ElicitationManager> {
        &self.elicitations
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Axum router serving the Streamable HTTP transport for this server.
    pub fn router(&self) -> Router {
        create_router(
            HttpState {
                config: self.config.clone(),
                dispatcher: self.dispatcher.clone(),
                streams: self.streams.clone(),
                store: self.store.clone(),
                elicitations: self.elicitations.clone(),
                start_time: self.start_time,
            },
            self.auth.clone(),
        )
    }

    /// Stdio transport bound to this server's dispatcher.
    pub fn stdio(&self, debug: bool) -> StdioTransport {
        StdioTransport::new(self.dispatcher.clone(), self.store.clone(), debug)
    }

    /// Bind and serve until the returned handle is closed. The sweeper runs
    /// alongside on its configured interval.
    pub async fn serve(self: Arc<Self>) -> Result<ServerHandle> {
        let addr: SocketAddr = format!("{}:{}", self.config.server.host, self.config.server.port)
            .parse()
            .map_err(|e| anyhow!("invalid listen address: {e}"))?;
        self.serve_on(addr).await
    }

    pub async fn serve_on(self: Arc<Self>, addr: SocketAddr) -> Result<ServerHandle> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("MCP endpoint listening on {local_addr}");

        let sweeper = Sweeper {
            store: self.store.clone(),
            streams: self.streams.clone(),
            tasks: self.tasks.clone(),
            elicitations: self.elicitations.clone(),
            jwks: self
                .auth
                .as_ref()
                .and_then(|auth| auth.validator.jwks_cache()),
            session_idle_ttl: self.config.session.idle_ttl,
        }
        .spawn(self.config.session.sweep_interval);

        let router = self.router();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let streams = self.streams.clone();
        let broker = self.broker.clone();
        let task = tokio::spawn(async move {
            let server = axum::serve(listener, router).with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });
            if let Err(err) = server.await {
                tracing::error!("HTTP server error: {err}");
            }
            streams.close_all().await;
            let _ = broker.close().await;
        });

        Ok(ServerHandle {
            shutdown_tx: Some(shutdown_tx),
            task,
            sweeper,
            local_addr,
        })
    }

    /// Ask the user for out-of-band input via an external URL. Creates the
    /// elicitation record and pushes `elicitation/create` to every stream of
    /// the session.
    pub async fn elicit_url(
        &self,
        session_id: &str,
        message: impl Into<String>,
        url: impl Into<String>,
    ) -> Result<ElicitationRecord> {
        let message = message.into();
        let url = url.into();
        let user_id = self
            .store
            .get(session_id)
            .await?
            .and_then(|session| session.auth.map(|a| a.subject));
        let record = self.elicitations.create(
            Some(session_id.to_string()),
            user_id,
            message.clone(),
            url.clone(),
        );

        self.streams
            .publish_to_session(
                session_id,
                json!({
                    "jsonrpc": "2.0",
                    "method": "elicitation/create",
                    "params": {
                        "mode": "url",
                        "elicitationId": record.id,
                        "url": url,
                        "message": message,
                    },
                }),
            )
            .await;
        Ok(record)
    }

    /// Emit a `notifications/message` log frame to a session, honoring the
    /// minimum level it selected via `logging/setLevel`.
    pub async fn log_to_session(
        &self,
        session_id: &str,
        level: LogLevel,
        logger: &str,
        data: serde_json::Value,
    ) -> Result<()> {
        if let Some(session) = self.store.get(session_id).await? {
            if let Some(minimum) = session.log_level {
                if level < minimum {
                    debug!(session = session_id, %level, "log frame below session level");
                    return Ok(());
                }
            }
        }
        self.streams
            .publish_to_session(
                session_id,
                json!({
                    "jsonrpc": "2.0",
                    "method": "notifications/message",
                    "params": {"level": level, "logger": logger, "data": data},
                }),
            )
            .await;
        Ok(())
    }

    /// Forward progress for a long-running operation to a session.
    pub async fn notify_progress(
        &self,
        session_id: &str,
        progress_token: serde_json::Value,
        progress: f64,
        total: Option<f64>,
    ) {
        let mut params = json!({"progressToken": progress_token, "progress": progress});
        if let Some(total) = total {
            params["total"] = json!(total);
        }
        self.streams
            .publish_to_session(
                session_id,
                json!({
                    "jsonrpc": "2.0",
                    "method": "notifications/progress",
                    "params": params,
                }),
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elicitation::ElicitationStatus;

    #[tokio::test]
    async fn builder_defaults_assemble() {
        let server = McpServer::builder(Config::default()).build().await.unwrap();
        assert!(server.uptime_seconds() < 1);
        assert_eq!(server.elicitations().record_count(), 0);
    }

    #[tokio::test]
    async fn elicit_url_creates_record_for_session() {
        let server = McpServer::builder(Config::default()).build().await.unwrap();
        let session = server.store().create(None).await.unwrap();
        let record = server
            .elicit_url(&session.id, "Approve the thing", "https://example.com/approve/1")
            .await
            .unwrap();
        assert_eq!(record.status, ElicitationStatus::Pending);
        assert_eq!(record.session_id.as_deref(), Some(session.id.as_str()));
        assert_eq!(server.elicitations().record_count(), 1);
    }
}

//! Session store
//!
//! The store owns all session data: per-session metadata, per-stream event
//! history, and the token-hash index. The trait contract is identical for
//! the in-memory backing shipped here and for distributed backings; callers
//! never reach around it.

pub mod memory;

pub use memory::MemoryStore;

use crate::auth::context::{AuthorizationContext, TokenRefresh};
use crate::protocol::LogLevel;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;

/// Messages retained per stream before the oldest is discarded.
pub const STREAM_HISTORY_LIMIT: usize = 1000;

/// Messages retained in the session-level history (broadcasts only).
pub const SESSION_HISTORY_LIMIT: usize = 100;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session store backend failure: {0}")]
    Backend(String),
}

/// Result of an append. A nonexistent session or stream is reported as
/// `NotFound`, not an error; callers use it to tear down dangling
/// subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Append {
    /// Message stored under the given event id.
    Stored { event_id: u64 },
    NotFound,
}

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub event_id: u64,
    pub message: Value,
    pub stored_at: DateTime<Utc>,
}

/// Read-only view of a session handed to callers. The store keeps exclusive
/// ownership of the live record.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub event_counter: u64,
    pub auth: Option<AuthorizationContext>,
    pub refresh: Option<TokenRefresh>,
    pub log_level: Option<LogLevel>,
    /// Stream ids ordered by creation; the most recently created last.
    pub stream_ids: Vec<String>,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Create a session, optionally seeded with an authorization context.
    async fn create(&self, auth: Option<AuthorizationContext>) -> Result<SessionSnapshot, StoreError>;

    async fn get(&self, session_id: &str) -> Result<Option<SessionSnapshot>, StoreError>;

    /// Returns true when a session was actually removed.
    async fn delete(&self, session_id: &str) -> Result<bool, StoreError>;

    /// Advance `lastActivity`. Returns false for unknown sessions.
    async fn touch(&self, session_id: &str) -> Result<bool, StoreError>;

    /// Remove sessions idle past `idle_ttl` that have no attached stream and
    /// are not referenced by a pending task or elicitation. Returns the
    /// number of sessions removed.
    async fn sweep_expired(
        &self,
        idle_ttl: Duration,
        attached: &HashSet<String>,
        referenced: &HashSet<String>,
    ) -> Result<usize, StoreError>;

    /// Append a message. With a stream id and no explicit event id the store
    /// assigns the next dense id for that stream; appends are linearizable
    /// per (session, stream). Without a stream id the message lands in the
    /// session-level history under the caller-supplied event id.
    async fn add_message(
        &self,
        session_id: &str,
        stream_id: Option<&str>,
        event_id: Option<u64>,
        message: Value,
    ) -> Result<Append, StoreError>;

    /// Messages with `event_id > last_event_id`, ascending.
    async fn messages_since(
        &self,
        session_id: &str,
        stream_id: Option<&str>,
        last_event_id: u64,
    ) -> Result<Vec<StoredMessage>, StoreError>;

    async fn get_by_token_hash(&self, token_hash: &str)
        -> Result<Option<SessionSnapshot>, StoreError>;

    async fn bind_token(&self, token_hash: &str, session_id: &str) -> Result<(), StoreError>;

    /// Replace the session's authorization context (and refresh block).
    /// Returns false for unknown sessions.
    async fn update_authorization(
        &self,
        session_id: &str,
        auth: AuthorizationContext,
        refresh: Option<TokenRefresh>,
    ) -> Result<bool, StoreError>;

    /// Create a stream record; `None` for unknown sessions.
    async fn create_stream(&self, session_id: &str) -> Result<Option<String>, StoreError>;

    async fn delete_stream(&self, session_id: &str, stream_id: &str) -> Result<bool, StoreError>;

    /// Mark stream activity. Unknown session or stream is a no-op returning
    /// false.
    async fn touch_stream(&self, session_id: &str, stream_id: &str) -> Result<bool, StoreError>;

    async fn set_log_level(&self, session_id: &str, level: LogLevel) -> Result<bool, StoreError>;

    /// Number of live sessions (diagnostics and sweeping reports).
    async fn session_count(&self) -> Result<usize, StoreError>;
}

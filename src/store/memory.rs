//! In-memory session store
//!
//! Sessions live behind a read-write map of per-session locks, so appends
//! are linearizable per session while unrelated sessions proceed in
//! parallel. Histories are bounded ring buffers.

use super::{
    Append, SessionSnapshot, SessionStore, StoreError, StoredMessage, SESSION_HISTORY_LIMIT,
    STREAM_HISTORY_LIMIT,
};
use crate::auth::context::{AuthorizationContext, TokenRefresh};
use crate::protocol::LogLevel;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

struct StreamState {
    event_counter: u64,
    last_event_id: u64,
    last_activity: DateTime<Utc>,
    history: VecDeque<StoredMessage>,
}

impl StreamState {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            event_counter: 0,
            last_event_id: 0,
            last_activity: now,
            history: VecDeque::new(),
        }
    }
}

struct SessionState {
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    event_counter: u64,
    auth: Option<AuthorizationContext>,
    refresh: Option<TokenRefresh>,
    log_level: Option<LogLevel>,
    /// Insertion-ordered stream records.
    streams: Vec<(String, StreamState)>,
    history: VecDeque<StoredMessage>,
}

impl SessionState {
    fn snapshot(&self, id: &str) -> SessionSnapshot {
        SessionSnapshot {
            id: id.to_string(),
            created_at: self.created_at,
            last_activity: self.last_activity,
            event_counter: self.event_counter,
            auth: self.auth.clone(),
            refresh: self.refresh.clone(),
            log_level: self.log_level,
            stream_ids: self.streams.iter().map(|(id, _)| id.clone()).collect(),
        }
    }

    fn stream_mut(&mut self, stream_id: &str) -> Option<&mut StreamState> {
        self.streams
            .iter_mut()
            .find(|(id, _)| id == stream_id)
            .map(|(_, state)| state)
    }
}

type SessionMap = HashMap<String, Arc<Mutex<SessionState>>>;

/// In-memory [`SessionStore`] backing.
#[derive(Default)]
pub struct MemoryStore {
    sessions: RwLock<SessionMap>,
    token_index: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn session(&self, session_id: &str) -> Option<Arc<Mutex<SessionState>>> {
        self.sessions.read().await.get(session_id).cloned()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create(
        &self,
        auth: Option<AuthorizationContext>,
    ) -> Result<SessionSnapshot, StoreError> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let state = SessionState {
            created_at: now,
            last_activity: now,
            event_counter: 0,
            auth,
            refresh: None,
            log_level: None,
            streams: Vec::new(),
            history: VecDeque::new(),
        };
        let snapshot = state.snapshot(&id);
        if let Some(ctx) = &snapshot.auth {
            self.token_index
                .write()
                .await
                .insert(ctx.token_hash.clone(), id.clone());
        }
        self.sessions
            .write()
            .await
            .insert(id, Arc::new(Mutex::new(state)));
        Ok(snapshot)
    }

    async fn get(&self, session_id: &str) -> Result<Option<SessionSnapshot>, StoreError> {
        match self.session(session_id).await {
            Some(entry) => Ok(Some(entry.lock().await.snapshot(session_id))),
            None => Ok(None),
        }
    }

    async fn delete(&self, session_id: &str) -> Result<bool, StoreError> {
        let removed = self.sessions.write().await.remove(session_id);
        if let Some(entry) = &removed {
            let state = entry.lock().await;
            if let Some(ctx) = &state.auth {
                self.token_index.write().await.remove(&ctx.token_hash);
            }
        }
        Ok(removed.is_some())
    }

    async fn touch(&self, session_id: &str) -> Result<bool, StoreError> {
        match self.session(session_id).await {
            Some(entry) => {
                entry.lock().await.last_activity = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn sweep_expired(
        &self,
        idle_ttl: Duration,
        attached: &HashSet<String>,
        referenced: &HashSet<String>,
    ) -> Result<usize, StoreError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(idle_ttl)
                .map_err(|e| StoreError::Backend(e.to_string()))?;
        let candidates: Vec<String> = {
            let sessions = self.sessions.read().await;
            let mut expired = Vec::new();
            for (id, entry) in sessions.iter() {
                if attached.contains(id) || referenced.contains(id) {
                    continue;
                }
                let state = entry.lock().await;
                if state.last_activity < cutoff {
                    expired.push(id.clone());
                }
            }
            expired
        };
        let mut removed = 0;
        for id in candidates {
            if self.delete(&id).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn add_message(
        &self,
        session_id: &str,
        stream_id: Option<&str>,
        event_id: Option<u64>,
        message: Value,
    ) -> Result<Append, StoreError> {
        let Some(entry) = self.session(session_id).await else {
            return Ok(Append::NotFound);
        };
        let mut state = entry.lock().await;
        state.last_activity = Utc::now();
        match stream_id {
            Some(stream_id) => {
                let Some(stream) = state.stream_mut(stream_id) else {
                    return Ok(Append::NotFound);
                };
                let assigned = match event_id {
                    Some(explicit) => explicit.max(stream.event_counter + 1),
                    None => stream.event_counter + 1,
                };
                stream.event_counter = assigned;
                stream.last_event_id = assigned;
                stream.last_activity = Utc::now();
                stream.history.push_back(StoredMessage {
                    event_id: assigned,
                    message,
                    stored_at: Utc::now(),
                });
                if stream.history.len() > STREAM_HISTORY_LIMIT {
                    stream.history.pop_front();
                }
                Ok(Append::Stored { event_id: assigned })
            }
            None => {
                let assigned = match event_id {
                    Some(explicit) => explicit.max(state.event_counter + 1),
                    None => state.event_counter + 1,
                };
                state.event_counter = assigned;
                state.history.push_back(StoredMessage {
                    event_id: assigned,
                    message,
                    stored_at: Utc::now(),
                });
                if state.history.len() > SESSION_HISTORY_LIMIT {
                    state.history.pop_front();
                }
                Ok(Append::Stored { event_id: assigned })
            }
        }
    }

    async fn messages_since(
        &self,
        session_id: &str,
        stream_id: Option<&str>,
        last_event_id: u64,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let Some(entry) = self.session(session_id).await else {
            return Ok(Vec::new());
        };
        let mut state = entry.lock().await;
        let history = match stream_id {
            Some(stream_id) => match state.stream_mut(stream_id) {
                Some(stream) => &stream.history,
                None => return Ok(Vec::new()),
            },
            None => &state.history,
        };
        Ok(history
            .iter()
            .filter(|m| m.event_id > last_event_id)
            .cloned()
            .collect())
    }

    async fn get_by_token_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<SessionSnapshot>, StoreError> {
        let session_id = self.token_index.read().await.get(token_hash).cloned();
        match session_id {
            Some(id) => self.get(&id).await,
            None => Ok(None),
        }
    }

    async fn bind_token(&self, token_hash: &str, session_id: &str) -> Result<(), StoreError> {
        self.token_index
            .write()
            .await
            .insert(token_hash.to_string(), session_id.to_string());
        Ok(())
    }

    async fn update_authorization(
        &self,
        session_id: &str,
        auth: AuthorizationContext,
        refresh: Option<TokenRefresh>,
    ) -> Result<bool, StoreError> {
        let Some(entry) = self.session(session_id).await else {
            return Ok(false);
        };
        self.bind_token(&auth.token_hash, session_id).await?;
        let mut state = entry.lock().await;
        state.auth = Some(auth);
        if refresh.is_some() {
            state.refresh = refresh;
        }
        state.last_activity = Utc::now();
        Ok(true)
    }

    async fn create_stream(&self, session_id: &str) -> Result<Option<String>, StoreError> {
        let Some(entry) = self.session(session_id).await else {
            return Ok(None);
        };
        let stream_id = Uuid::new_v4().to_string();
        let mut state = entry.lock().await;
        let now = Utc::now();
        state.last_activity = now;
        state.streams.push((stream_id.clone(), StreamState::new(now)));
        Ok(Some(stream_id))
    }

    async fn delete_stream(&self, session_id: &str, stream_id: &str) -> Result<bool, StoreError> {
        let Some(entry) = self.session(session_id).await else {
            return Ok(false);
        };
        let mut state = entry.lock().await;
        let before = state.streams.len();
        state.streams.retain(|(id, _)| id != stream_id);
        Ok(state.streams.len() != before)
    }

    async fn touch_stream(&self, session_id: &str, stream_id: &str) -> Result<bool, StoreError> {
        let Some(entry) = self.session(session_id).await else {
            return Ok(false);
        };
        let mut state = entry.lock().await;
        state.last_activity = Utc::now();
        match state.stream_mut(stream_id) {
            Some(stream) => {
                stream.last_activity = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn set_log_level(&self, session_id: &str, level: LogLevel) -> Result<bool, StoreError> {
        let Some(entry) = self.session(session_id).await else {
            return Ok(false);
        };
        entry.lock().await.log_level = Some(level);
        Ok(true)
    }

    async fn session_count(&self) -> Result<usize, StoreError> {
        Ok(self.sessions.read().await.len())
    }
}

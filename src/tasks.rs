//! Asynchronous task subsystem
//!
//! Any request may defer its execution into a task (`_meta.task.ttl`). The
//! dispatcher creates the record, answers immediately, and runs the handler
//! in the background. Status transitions are monotonic; terminal states are
//! absorbing. Expired records are swept out by TTL.

use crate::auth::context::AuthorizationContext;
use crate::protocol::{CreateTaskResult, TaskStatus};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("task not found")]
    NotFound,
    #[error("task already in terminal state")]
    AlreadyTerminal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskRecord {
    pub id: String,
    pub status: TaskStatus,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub ttl_ms: u64,
    pub poll_interval_ms: Option<u64>,
    pub result: Option<Value>,
    pub auth: Option<AuthorizationContext>,
    pub session_id: Option<String>,
}

impl TaskRecord {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.created_at + chrono::Duration::milliseconds(self.ttl_ms as i64)
    }

    pub fn create_result(&self) -> CreateTaskResult {
        CreateTaskResult {
            task_id: self.id.clone(),
            status: self.status,
            created_at: self.created_at,
            ttl: self.ttl_ms,
            poll_interval: self.poll_interval_ms,
        }
    }
}

struct TaskEntry {
    record: TaskRecord,
    cancellation: CancellationToken,
}

pub struct TaskManager {
    tasks: DashMap<String, TaskEntry>,
    default_ttl: Duration,
    max_ttl: Duration,
    poll_interval_ms: Option<u64>,
}

impl TaskManager {
    pub fn new(default_ttl: Duration, max_ttl: Duration, poll_interval_ms: Option<u64>) -> Self {
        Self {
            tasks: DashMap::new(),
            default_ttl,
            max_ttl,
            poll_interval_ms,
        }
    }

    /// Create a `working` task. The requested TTL is clamped to the
    /// configured ceiling; absent, the default applies.
    pub fn create(
        &self,
        requested_ttl_ms: Option<u64>,
        auth: Option<AuthorizationContext>,
        session_id: Option<String>,
    ) -> (TaskRecord, CancellationToken) {
        let ttl_ms = requested_ttl_ms
            .unwrap_or(self.default_ttl.as_millis() as u64)
            .min(self.max_ttl.as_millis() as u64);
        let record = TaskRecord {
            id: Uuid::new_v4().to_string(),
            status: TaskStatus::Working,
            message: None,
            created_at: Utc::now(),
            ttl_ms,
            poll_interval_ms: self.poll_interval_ms,
            result: None,
            auth,
            session_id,
        };
        let cancellation = CancellationToken::new();
        self.tasks.insert(
            record.id.clone(),
            TaskEntry {
                record: record.clone(),
                cancellation: cancellation.clone(),
            },
        );
        (record, cancellation)
    }

    pub fn get(&self, task_id: &str) -> Option<TaskRecord> {
        self.tasks.get(task_id).map(|e| e.record.clone())
    }

    /// Tasks visible to the caller: those whose captured authorization
    /// context matches the caller's subject and client.
    pub fn list(&self, caller: Option<&AuthorizationContext>) -> Vec<TaskRecord> {
        let mut records: Vec<TaskRecord> = self
            .tasks
            .iter()
            .filter(|entry| match (caller, &entry.record.auth) {
                (Some(caller), Some(owner)) => {
                    owner.subject == caller.subject && owner.client_id == caller.client_id
                }
                (None, None) => true,
                _ => false,
            })
            .map(|entry| entry.record.clone())
            .collect();
        records.sort_by_key(|r| r.created_at);
        records
    }

    /// Transition a non-terminal task to `cancelled` and fire its token.
    pub fn cancel(&self, task_id: &str) -> Result<TaskRecord, TaskError> {
        let mut entry = self.tasks.get_mut(task_id).ok_or(TaskError::NotFound)?;
        if entry.record.status.is_terminal() {
            return Err(TaskError::AlreadyTerminal);
        }
        entry.record.status = TaskStatus::Cancelled;
        entry.record.message = Some("Cancelled by request".to_string());
        entry.cancellation.cancel();
        Ok(entry.record.clone())
    }

    pub fn complete(&self, task_id: &str, result: Value) -> Result<(), TaskError> {
        self.transition(task_id, TaskStatus::Completed, None, Some(result))
    }

    pub fn fail(&self, task_id: &str, message: impl Into<String>) -> Result<(), TaskError> {
        self.transition(task_id, TaskStatus::Failed, Some(message.into()), None)
    }

    /// Handler-requested intermediate state; a later transition back to
    /// `working` (or to a terminal state) is allowed.
    pub fn set_input_required(&self, task_id: &str, message: Option<String>) -> Result<(), TaskError> {
        self.transition(task_id, TaskStatus::InputRequired, message, None)
    }

    pub fn set_working(&self, task_id: &str) -> Result<(), TaskError> {
        self.transition(task_id, TaskStatus::Working, None, None)
    }

    fn transition(
        &self,
        task_id: &str,
        status: TaskStatus,
        message: Option<String>,
        result: Option<Value>,
    ) -> Result<(), TaskError> {
        let mut entry = self.tasks.get_mut(task_id).ok_or(TaskError::NotFound)?;
        if entry.record.status.is_terminal() {
            return Err(TaskError::AlreadyTerminal);
        }
        entry.record.status = status;
        if message.is_some() {
            entry.record.message = message;
        }
        if status.is_terminal() {
            entry.record.result = result;
        }
        Ok(())
    }

    /// Delete tasks past their TTL; returns the number removed.
    pub fn sweep(&self) -> usize {
        let now = Utc::now();
        let expired: Vec<String> = self
            .tasks
            .iter()
            .filter(|entry| entry.record.expires_at() < now)
            .map(|entry| entry.record.id.clone())
            .collect();
        for id in &expired {
            if let Some((_, entry)) = self.tasks.remove(id) {
                entry.cancellation.cancel();
                debug!(task = %id, "expired task removed");
            }
        }
        expired.len()
    }

    /// Sessions referenced by non-terminal tasks; these block session GC.
    pub fn referenced_sessions(&self) -> HashSet<String> {
        self.tasks
            .iter()
            .filter(|entry| !entry.record.status.is_terminal())
            .filter_map(|entry| entry.record.session_id.clone())
            .collect()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }
}

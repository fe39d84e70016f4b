//! URL-mode elicitation
//!
//! The server asks a human for out-of-band input by sending an
//! `elicitation/create` message carrying an external URL. The external agent
//! reports back through the completion/cancellation callbacks; completion is
//! broadcast so every attached stream of the session learns about it.
//! Terminal records reject further transitions.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ElicitationStatus {
    Pending,
    Completed,
    Cancelled,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ElicitationError {
    #[error("not_found")]
    NotFound,
    #[error("already_completed")]
    AlreadyCompleted,
    #[error("already_cancelled")]
    AlreadyCancelled,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ElicitationRecord {
    pub id: String,
    pub url: String,
    pub message: String,
    pub status: ElicitationStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

pub struct ElicitationManager {
    records: DashMap<String, ElicitationRecord>,
    record_ttl: Duration,
}

impl ElicitationManager {
    pub fn new(record_ttl: Duration) -> Self {
        Self {
            records: DashMap::new(),
            record_ttl,
        }
    }

    pub fn create(
        &self,
        session_id: Option<String>,
        user_id: Option<String>,
        message: String,
        url: String,
    ) -> ElicitationRecord {
        let record = ElicitationRecord {
            id: Uuid::new_v4().to_string(),
            url,
            message,
            status: ElicitationStatus::Pending,
            created_at: Utc::now(),
            completed_at: None,
            user_id,
            session_id,
        };
        self.records.insert(record.id.clone(), record.clone());
        record
    }

    pub fn get(&self, id: &str) -> Option<ElicitationRecord> {
        self.records.get(id).map(|r| r.clone())
    }

    pub fn complete(&self, id: &str) -> Result<ElicitationRecord, ElicitationError> {
        self.finish(id, ElicitationStatus::Completed)
    }

    pub fn cancel(&self, id: &str) -> Result<ElicitationRecord, ElicitationError> {
        self.finish(id, ElicitationStatus::Cancelled)
    }

    fn finish(
        &self,
        id: &str,
        status: ElicitationStatus,
    ) -> Result<ElicitationRecord, ElicitationError> {
        let mut record = self.records.get_mut(id).ok_or(ElicitationError::NotFound)?;
        match record.status {
            ElicitationStatus::Completed => Err(ElicitationError::AlreadyCompleted),
            ElicitationStatus::Cancelled => Err(ElicitationError::AlreadyCancelled),
            ElicitationStatus::Pending => {
                record.status = status;
                record.completed_at = Some(Utc::now());
                Ok(record.clone())
            }
        }
    }

    /// Purge records older than the configured TTL; returns the count.
    pub fn sweep(&self) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.record_ttl)
                .unwrap_or_else(|_| chrono::Duration::hours(1));
        let stale: Vec<String> = self
            .records
            .iter()
            .filter(|r| r.created_at < cutoff)
            .map(|r| r.id.clone())
            .collect();
        for id in &stale {
            self.records.remove(id);
            debug!(elicitation = %id, "stale elicitation removed");
        }
        stale.len()
    }

    /// Sessions with a pending elicitation; these block session GC.
    pub fn referenced_sessions(&self) -> HashSet<String> {
        self.records
            .iter()
            .filter(|r| r.status == ElicitationStatus::Pending)
            .filter_map(|r| r.session_id.clone())
            .collect()
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }
}

//! TTL sweeper
//!
//! One periodic task performs every TTL-based cleanup: idle sessions,
//! expired tasks, stale elicitations, and aged JWKS entries. Each target
//! exposes a sweep that reports how many entries it removed.

use crate::auth::JwksCache;
use crate::elicitation::ElicitationManager;
use crate::store::SessionStore;
use crate::stream::StreamManager;
use crate::tasks::TaskManager;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub struct Sweeper {
    pub store: Arc<dyn SessionStore>,
    pub streams: Arc<StreamManager>,
    pub tasks: Option<Arc<TaskManager>>,
    pub elicitations: Arc<ElicitationManager>,
    pub jwks: Option<Arc<JwksCache>>,
    pub session_idle_ttl: Duration,
}

impl Sweeper {
    /// Run the sweeper on an interval until the handle is aborted.
    pub fn spawn(self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.sweep_once().await;
            }
        })
    }

    /// A single pass over every TTL-bounded store.
    pub async fn sweep_once(&self) {
        let mut referenced: HashSet<String> = HashSet::new();
        if let Some(tasks) = &self.tasks {
            referenced.extend(tasks.referenced_sessions());
        }
        referenced.extend(self.elicitations.referenced_sessions());
        let attached = self.streams.attached_sessions();

        let sessions = match self
            .store
            .sweep_expired(self.session_idle_ttl, &attached, &referenced)
            .await
        {
            Ok(count) => count,
            Err(err) => {
                warn!(reason = %err, "session sweep failed");
                0
            }
        };
        let tasks = self.tasks.as_ref().map(|t| t.sweep()).unwrap_or(0);
        let elicitations = self.elicitations.sweep();
        let jwks = match &self.jwks {
            Some(cache) => cache.sweep().await,
            None => 0,
        };

        if sessions + tasks + elicitations + jwks > 0 {
            debug!(sessions, tasks, elicitations, jwks, "sweep removed expired entries");
        }
    }
}

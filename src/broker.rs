//! Message broker
//!
//! Topic-based publish/subscribe used to fan messages out across server
//! instances. The local broker delivers at-least-once to every subscriber of
//! a topic, in publish order for a single publisher. Handlers run outside
//! the subscriber-table lock.

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

/// Well-known topic paths.
pub mod topics {
    pub const BROADCAST: &str = "mcp/broadcast/notification";

    pub fn session(session_id: &str) -> String {
        format!("mcp/session/{session_id}/message")
    }

    pub fn user(user_id: &str) -> String {
        format!("mcp/user/{user_id}/message")
    }
}

pub type SubscriberId = u64;

/// Boxed async handler invoked once per delivered message.
pub type TopicHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker is closed")]
    Closed,
}

#[async_trait]
pub trait MessageBroker: Send + Sync {
    async fn publish(&self, topic: &str, payload: Value) -> Result<(), BrokerError>;

    async fn subscribe(&self, topic: &str, handler: TopicHandler)
        -> Result<SubscriberId, BrokerError>;

    async fn unsubscribe(&self, topic: &str, id: SubscriberId) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// In-process broker. Every instance of the server connected to the same
/// `LocalBroker` value shares delivery; distributed deployments substitute a
/// backing that bridges topics over the network.
#[derive(Default)]
pub struct LocalBroker {
    subscribers: RwLock<HashMap<String, Vec<(SubscriberId, TopicHandler)>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl LocalBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscriber_count(&self, topic: &str) -> usize {
        self.subscribers
            .read()
            .await
            .get(topic)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl MessageBroker for LocalBroker {
    async fn publish(&self, topic: &str, payload: Value) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        // Clone the handler list so delivery happens without the table lock.
        let handlers: Vec<TopicHandler> = {
            let table = self.subscribers.read().await;
            match table.get(topic) {
                Some(entries) => entries.iter().map(|(_, h)| Arc::clone(h)).collect(),
                None => return Ok(()),
            }
        };
        // Sequential delivery keeps per-topic FIFO for this publisher.
        for handler in handlers {
            handler(payload.clone()).await;
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: TopicHandler,
    ) -> Result<SubscriberId, BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.subscribers
            .write()
            .await
            .entry(topic.to_string())
            .or_default()
            .push((id, handler));
        Ok(id)
    }

    async fn unsubscribe(&self, topic: &str, id: SubscriberId) -> Result<(), BrokerError> {
        let mut table = self.subscribers.write().await;
        if let Some(entries) = table.get_mut(topic) {
            entries.retain(|(sid, _)| *sid != id);
            if entries.is_empty() {
                table.remove(topic);
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::SeqCst);
        self.subscribers.write().await.clear();
        Ok(())
    }
}

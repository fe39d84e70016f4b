//! SSE stream manager
//!
//! Owns every live SSE connection: per-stream event-id assignment backed by
//! the store, replay on reconnect, directed-vs-broadcast routing, and
//! cross-instance fan-out through the broker. A session may hold any number
//! of concurrent streams; a directed message reaches exactly one of them,
//! a broadcast reaches all of them.

use crate::broker::{topics, MessageBroker, SubscriberId, TopicHandler};
use crate::store::{Append, SessionStore, StoreError};
use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("session not found")]
    SessionNotFound,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A frame ready for the wire: the SSE `id:` field and single-line JSON data.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    pub event_id: String,
    pub data: String,
}

impl OutboundFrame {
    fn new(event_id: u64, message: &Value) -> Self {
        Self {
            event_id: event_id.to_string(),
            data: message.to_string(),
        }
    }
}

#[derive(Clone)]
struct AttachedStream {
    stream_id: String,
    tx: mpsc::Sender<OutboundFrame>,
}

struct SessionStreams {
    streams: Vec<AttachedStream>,
    subscriptions: Vec<(String, SubscriberId)>,
}

/// Everything the transport needs to serve one SSE connection.
pub struct StreamAttachment {
    pub session_id: String,
    pub stream_id: String,
    /// History frames to emit before going live, ascending event id.
    pub replay: Vec<OutboundFrame>,
    pub rx: mpsc::Receiver<OutboundFrame>,
    pub guard: StreamGuard,
}

/// Detaches the stream when the connection goes away.
pub struct StreamGuard {
    manager: Weak<StreamManager>,
    session_id: String,
    stream_id: String,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        let session_id = self.session_id.clone();
        let stream_id = self.stream_id.clone();
        tokio::spawn(async move {
            manager.detach(&session_id, &stream_id).await;
        });
    }
}

pub struct StreamManager {
    store: Arc<dyn SessionStore>,
    broker: Arc<dyn MessageBroker>,
    sessions: DashMap<String, SessionStreams>,
    queue_capacity: usize,
    /// Self-reference handed to broker handlers and stream guards so they
    /// never keep the manager alive on their own.
    weak: Weak<StreamManager>,
}

impl StreamManager {
    pub fn new(
        store: Arc<dyn SessionStore>,
        broker: Arc<dyn MessageBroker>,
        queue_capacity: usize,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            store,
            broker,
            sessions: DashMap::new(),
            queue_capacity,
            weak: weak.clone(),
        })
    }

    /// Install the fleet-wide broadcast subscription. Called once at server
    /// assembly.
    pub async fn start(&self) {
        let weak = self.weak.clone();
        let handler: TopicHandler = Arc::new(move |payload| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(manager) = weak.upgrade() {
                    manager.deliver_broadcast_local(payload).await;
                }
            })
        });
        if let Err(err) = self.broker.subscribe(topics::BROADCAST, handler).await {
            warn!(reason = %err, "failed to subscribe to broadcast topic");
        }
    }

    /// Attach an SSE connection to a session. `resume_stream` reattaches a
    /// known stream record (keeping its event counter); otherwise, when the
    /// client presents `Last-Event-ID`, the most recent stream record is
    /// resumed so its history can be replayed.
    pub async fn attach(
        &self,
        session_id: &str,
        user_id: Option<&str>,
        resume_stream: Option<&str>,
        last_event_id: Option<u64>,
    ) -> Result<StreamAttachment, StreamError> {
        let stream_id = self
            .resolve_stream(session_id, resume_stream, last_event_id)
            .await?;

        let replay = match last_event_id {
            Some(last) => self
                .store
                .messages_since(session_id, Some(&stream_id), last)
                .await?
                .into_iter()
                .map(|m| OutboundFrame::new(m.event_id, &m.message))
                .collect(),
            None => Vec::new(),
        };

        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let attached = AttachedStream {
            stream_id: stream_id.clone(),
            tx,
        };

        let mut entry = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionStreams {
                streams: Vec::new(),
                subscriptions: Vec::new(),
            });
        let first_stream = entry.streams.is_empty();
        entry.streams.push(attached);
        drop(entry);

        if first_stream {
            self.subscribe_session_topics(session_id, user_id).await;
        }

        debug!(session = session_id, stream = %stream_id, "stream attached");
        Ok(StreamAttachment {
            session_id: session_id.to_string(),
            stream_id: stream_id.clone(),
            replay,
            rx,
            guard: StreamGuard {
                manager: self.weak.clone(),
                session_id: session_id.to_string(),
                stream_id,
            },
        })
    }

    async fn resolve_stream(
        &self,
        session_id: &str,
        resume_stream: Option<&str>,
        last_event_id: Option<u64>,
    ) -> Result<String, StreamError> {
        if let Some(stream_id) = resume_stream {
            if self.store.touch_stream(session_id, stream_id).await? {
                return Ok(stream_id.to_string());
            }
        }
        if last_event_id.is_some() {
            if let Some(session) = self.store.get(session_id).await? {
                if let Some(latest) = session.stream_ids.last() {
                    return Ok(latest.clone());
                }
            }
        }
        self.store
            .create_stream(session_id)
            .await?
            .ok_or(StreamError::SessionNotFound)
    }

    async fn subscribe_session_topics(&self, session_id: &str, user_id: Option<&str>) {
        let mut topics_to_join = vec![topics::session(session_id)];
        if let Some(user_id) = user_id {
            topics_to_join.push(topics::user(user_id));
        }

        let mut subscriptions = Vec::new();
        for topic in topics_to_join {
            let weak = self.weak.clone();
            let session = session_id.to_string();
            let handler: TopicHandler = Arc::new(move |payload| {
                let weak = weak.clone();
                let session = session.clone();
                Box::pin(async move {
                    if let Some(manager) = weak.upgrade() {
                        manager.deliver_local(&session, payload).await;
                    }
                })
            });
            match self.broker.subscribe(&topic, handler).await {
                Ok(id) => subscriptions.push((topic, id)),
                Err(err) => warn!(topic = %topic, reason = %err, "broker subscribe failed"),
            }
        }

        if let Some(mut entry) = self.sessions.get_mut(session_id) {
            entry.subscriptions.extend(subscriptions);
        }
    }

    /// Remove a stream from the attached set. The last detach for a session
    /// also drops its broker subscriptions before returning.
    pub async fn detach(&self, session_id: &str, stream_id: &str) {
        let orphaned_subscriptions = {
            let Some(mut entry) = self.sessions.get_mut(session_id) else {
                return;
            };
            entry.streams.retain(|s| s.stream_id != stream_id);
            if entry.streams.is_empty() {
                let subs = std::mem::take(&mut entry.subscriptions);
                drop(entry);
                self.sessions.remove(session_id);
                subs
            } else {
                Vec::new()
            }
        };
        for (topic, id) in orphaned_subscriptions {
            if let Err(err) = self.broker.unsubscribe(&topic, id).await {
                warn!(topic = %topic, reason = %err, "broker unsubscribe failed");
            }
        }
        debug!(session = session_id, stream = stream_id, "stream detached");
    }

    /// Publish a message toward a session. Delivery to locally attached
    /// streams happens via the broker subscription, so peer instances see the
    /// same message.
    pub async fn publish_to_session(&self, session_id: &str, message: Value) {
        let topic = topics::session(session_id);
        if let Err(err) = self.broker.publish(&topic, message).await {
            warn!(session = session_id, reason = %err, "session publish failed");
        }
    }

    /// Publish a fleet-wide broadcast.
    pub async fn publish_broadcast(&self, message: Value) {
        if let Err(err) = self.broker.publish(topics::BROADCAST, message).await {
            warn!(reason = %err, "broadcast publish failed");
        }
    }

    /// Local delivery for a session-topic message: broadcast-class methods
    /// reach every attached stream, everything else exactly one.
    async fn deliver_local(&self, session_id: &str, message: Value) {
        if is_broadcast_message(&message) {
            self.deliver_session_broadcast(session_id, &message).await;
        } else {
            self.deliver_directed(session_id, &message).await;
        }
    }

    async fn deliver_broadcast_local(&self, message: Value) {
        let session_ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for session_id in session_ids {
            self.deliver_session_broadcast(&session_id, &message).await;
        }
    }

    /// Directed delivery: first available stream takes the message. Streams
    /// whose queues reject the write are detached on the spot.
    async fn deliver_directed(&self, session_id: &str, message: &Value) {
        let streams = self.streams_snapshot(session_id);
        for stream in streams {
            match self
                .store
                .add_message(session_id, Some(&stream.stream_id), None, message.clone())
                .await
            {
                Ok(Append::Stored { event_id }) => {
                    let frame = OutboundFrame::new(event_id, message);
                    if stream.tx.try_send(frame).is_ok() {
                        return;
                    }
                    warn!(session = session_id, stream = %stream.stream_id, "stream write failed; detaching");
                    self.detach(session_id, &stream.stream_id).await;
                }
                Ok(Append::NotFound) => {
                    self.detach(session_id, &stream.stream_id).await;
                }
                Err(err) => {
                    warn!(session = session_id, reason = %err, "message append failed");
                    return;
                }
            }
        }
        debug!(session = session_id, "directed message had no live stream");
    }

    /// Session broadcast: a common timestamp event id, stored once in the
    /// session-level history, written to every attached stream.
    async fn deliver_session_broadcast(&self, session_id: &str, message: &Value) {
        let event_id = Utc::now().timestamp_millis() as u64;
        match self
            .store
            .add_message(session_id, None, Some(event_id), message.clone())
            .await
        {
            Ok(Append::Stored { .. }) => {}
            Ok(Append::NotFound) => {
                // Session is gone; drop its local streams and subscriptions.
                let streams = self.streams_snapshot(session_id);
                for stream in streams {
                    self.detach(session_id, &stream.stream_id).await;
                }
                return;
            }
            Err(err) => {
                warn!(session = session_id, reason = %err, "broadcast append failed");
            }
        }

        let frame = OutboundFrame {
            event_id: event_id.to_string(),
            data: message.to_string(),
        };
        for stream in self.streams_snapshot(session_id) {
            if stream.tx.try_send(frame.clone()).is_err() {
                warn!(session = session_id, stream = %stream.stream_id, "stream write failed; detaching");
                self.detach(session_id, &stream.stream_id).await;
            }
        }
    }

    /// Write a frame to one specific stream (streamed tool responses).
    /// Returns false when the stream is no longer writable.
    pub async fn send_to_stream(
        &self,
        session_id: &str,
        stream_id: &str,
        message: Value,
    ) -> bool {
        let target = self
            .streams_snapshot(session_id)
            .into_iter()
            .find(|s| s.stream_id == stream_id);
        let Some(stream) = target else {
            return false;
        };
        match self
            .store
            .add_message(session_id, Some(stream_id), None, message.clone())
            .await
        {
            Ok(Append::Stored { event_id }) => {
                let frame = OutboundFrame::new(event_id, &message);
                if stream.tx.try_send(frame).is_err() {
                    self.detach(session_id, stream_id).await;
                    return false;
                }
                true
            }
            _ => {
                self.detach(session_id, stream_id).await;
                false
            }
        }
    }

    fn streams_snapshot(&self, session_id: &str) -> Vec<AttachedStream> {
        self.sessions
            .get(session_id)
            .map(|entry| entry.streams.clone())
            .unwrap_or_default()
    }

    pub fn has_active_stream(&self, session_id: &str) -> bool {
        self.sessions
            .get(session_id)
            .map(|entry| !entry.streams.is_empty())
            .unwrap_or(false)
    }

    pub fn active_stream_count(&self, session_id: &str) -> usize {
        self.sessions
            .get(session_id)
            .map(|entry| entry.streams.len())
            .unwrap_or(0)
    }

    /// Sessions with at least one attached stream; the sweeper treats these
    /// as alive.
    pub fn attached_sessions(&self) -> HashSet<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    /// Drop every attached stream (graceful shutdown).
    pub async fn close_all(&self) {
        let sessions: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for session_id in sessions {
            for stream in self.streams_snapshot(&session_id) {
                self.detach(&session_id, &stream.stream_id).await;
            }
        }
    }
}

/// Server-initiated notifications and elicitation prompts fan out to every
/// attached stream; everything else is directed.
fn is_broadcast_message(message: &Value) -> bool {
    match message.get("method").and_then(Value::as_str) {
        Some(method) => method.starts_with("notifications/") || method == "elicitation/create",
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::LocalBroker;
    use crate::store::{MemoryStore, SessionStore};
    use serde_json::json;

    async fn setup() -> (Arc<StreamManager>, Arc<MemoryStore>, String) {
        let store = Arc::new(MemoryStore::new());
        let broker = Arc::new(LocalBroker::new());
        let manager = StreamManager::new(store.clone(), broker, 16);
        manager.start().await;
        let session = store.create(None).await.unwrap();
        (manager, store, session.id)
    }

    #[tokio::test]
    async fn directed_message_reaches_exactly_one_stream() {
        let (manager, _store, session) = setup().await;
        let mut first = manager.attach(&session, None, None, None).await.unwrap();
        let mut second = manager.attach(&session, None, None, None).await.unwrap();
        assert_eq!(manager.active_stream_count(&session), 2);

        manager
            .publish_to_session(&session, json!({"jsonrpc": "2.0", "id": 1, "result": {}}))
            .await;

        let delivered_first = first.rx.try_recv().is_ok();
        let delivered_second = second.rx.try_recv().is_ok();
        assert!(delivered_first ^ delivered_second, "exactly one stream receives a directed message");
    }

    #[tokio::test]
    async fn notifications_fan_out_to_all_streams() {
        let (manager, _store, session) = setup().await;
        let mut first = manager.attach(&session, None, None, None).await.unwrap();
        let mut second = manager.attach(&session, None, None, None).await.unwrap();

        manager
            .publish_to_session(
                &session,
                json!({"jsonrpc": "2.0", "method": "notifications/message", "params": {"level": "info"}}),
            )
            .await;

        let f1 = first.rx.try_recv().expect("first stream frame");
        let f2 = second.rx.try_recv().expect("second stream frame");
        assert_eq!(f1.event_id, f2.event_id);
    }

    #[tokio::test]
    async fn stream_event_ids_start_at_one_and_increase() {
        let (manager, _store, session) = setup().await;
        let mut attachment = manager.attach(&session, None, None, None).await.unwrap();

        for n in 0..3 {
            manager
                .publish_to_session(&session, json!({"jsonrpc": "2.0", "id": n, "result": {}}))
                .await;
        }

        let ids: Vec<u64> = (0..3)
            .map(|_| attachment.rx.try_recv().unwrap().event_id.parse().unwrap())
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn replay_resumes_strictly_after_last_event_id() {
        let (manager, store, session) = setup().await;
        let attachment = manager.attach(&session, None, None, None).await.unwrap();
        let stream_id = attachment.stream_id.clone();
        for n in 1..=7u64 {
            store
                .add_message(&session, Some(&stream_id), None, json!({"n": n}))
                .await
                .unwrap();
        }
        manager.detach(&session, &stream_id).await;
        drop(attachment);

        let resumed = manager
            .attach(&session, None, Some(&stream_id), Some(5))
            .await
            .unwrap();
        let ids: Vec<&str> = resumed.replay.iter().map(|f| f.event_id.as_str()).collect();
        assert_eq!(ids, vec!["6", "7"]);

        // A cursor newer than anything the stream has seen replays nothing.
        let resumed = manager
            .attach(&session, None, Some(&stream_id), Some(50))
            .await
            .unwrap();
        assert!(resumed.replay.is_empty());
    }

    #[tokio::test]
    async fn last_detach_unsubscribes_session_topic() {
        let store = Arc::new(MemoryStore::new());
        let broker = Arc::new(LocalBroker::new());
        let manager = StreamManager::new(store.clone(), broker.clone(), 16);
        manager.start().await;
        let session = store.create(None).await.unwrap();

        let attachment = manager.attach(&session.id, None, None, None).await.unwrap();
        let topic = topics::session(&session.id);
        assert_eq!(broker.subscriber_count(&topic).await, 1);

        manager.detach(&session.id, &attachment.stream_id).await;
        assert_eq!(broker.subscriber_count(&topic).await, 0);
        assert!(!manager.has_active_stream(&session.id));
    }

    #[tokio::test]
    async fn attach_to_unknown_session_fails() {
        let (manager, _store, _session) = setup().await;
        let result = manager.attach("missing", None, None, None).await;
        assert!(matches!(result, Err(StreamError::SessionNotFound)));
    }
}

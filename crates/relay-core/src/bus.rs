//! Broadcast bus: fan-out delivery to topic subscribers plus unicast
//! pushes to single sessions.
//!
//! Fan-out rides a `tokio::sync::broadcast` channel per topic; receivers
//! that subscribe after a publish never see it (no durability). Sender
//! exclusion is carried on the message and filtered at the receiving side
//! with [`Broadcast::delivers_to`].

use crate::message::{Broadcast, Delivery, SessionId, TopicId};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace};

/// Default per-topic fan-out capacity.
const DEFAULT_TOPIC_CAPACITY: usize = 1024;

/// Bus errors.
#[derive(Debug, Error)]
pub enum BusError {
    /// No session registered under the given ID.
    #[error("Unknown session: {0}")]
    UnknownSession(SessionId),

    /// The session's connection has gone away.
    #[error("Session outbound closed: {0}")]
    SessionGone(SessionId),
}

/// The broadcast bus.
pub struct Bus {
    /// Fan-out senders, one per active topic.
    topics: DashMap<TopicId, broadcast::Sender<Arc<Broadcast>>>,
    /// Per-session unicast routes to the owning connection.
    sessions: DashMap<SessionId, mpsc::UnboundedSender<Delivery>>,
    /// Fan-out capacity for newly opened topics.
    capacity: usize,
}

impl Bus {
    /// Create a bus with default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_TOPIC_CAPACITY)
    }

    /// Create a bus with a specific per-topic capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            sessions: DashMap::new(),
            capacity,
        }
    }

    /// Open a topic, creating its fan-out channel if absent.
    pub fn open_topic(&self, topic: &str) {
        self.topics.entry(topic.to_string()).or_insert_with(|| {
            debug!(topic = %topic, "Opening topic fan-out");
            broadcast::channel(self.capacity).0
        });
    }

    /// Tear down a topic's fan-out channel.
    pub fn close_topic(&self, topic: &str) {
        if self.topics.remove(topic).is_some() {
            debug!(topic = %topic, "Closed topic fan-out");
        }
    }

    /// Subscribe to a topic's fan-out.
    ///
    /// Returns `None` if the topic is not open.
    #[must_use]
    pub fn subscribe(&self, topic: &str) -> Option<broadcast::Receiver<Arc<Broadcast>>> {
        self.topics.get(topic).map(|tx| tx.subscribe())
    }

    /// Register a session's unicast route.
    pub fn register_session(&self, session: SessionId, outbound: mpsc::UnboundedSender<Delivery>) {
        self.sessions.insert(session, outbound);
    }

    /// Remove a session's unicast route.
    pub fn unregister_session(&self, session: SessionId) {
        self.sessions.remove(&session);
    }

    /// Publish to every session subscribed to the topic, including the
    /// publisher.
    ///
    /// Returns the number of subscribers the message reached.
    pub fn publish(&self, topic: &str, event: impl Into<String>, payload: Value) -> usize {
        self.send(Broadcast::new(topic, event, payload))
    }

    /// Publish to every session on the topic except one.
    pub fn publish_except(
        &self,
        topic: &str,
        event: impl Into<String>,
        payload: Value,
        except: SessionId,
    ) -> usize {
        self.send(Broadcast::new(topic, event, payload).except(except))
    }

    /// Unicast to a single session.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is unknown or its connection is gone.
    pub fn push(
        &self,
        session: SessionId,
        topic: &str,
        event: impl Into<String>,
        payload: Value,
    ) -> Result<(), BusError> {
        let outbound = self
            .sessions
            .get(&session)
            .ok_or(BusError::UnknownSession(session))?;

        outbound
            .send(Delivery::new(topic, event, payload))
            .map_err(|_| BusError::SessionGone(session))
    }

    fn send(&self, message: Broadcast) -> usize {
        if let Some(tx) = self.topics.get(&message.topic) {
            let topic = message.topic.clone();
            let count = tx.send(Arc::new(message)).unwrap_or_default();
            trace!(topic = %topic, recipients = count, "Published");
            count
        } else {
            trace!(topic = %message.topic, "Publish to closed topic");
            0
        }
    }

    /// Number of open topics.
    #[must_use]
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_publish_reaches_all_subscribers() {
        let bus = Bus::new();
        bus.open_topic("room:1");

        let mut rx1 = bus.subscribe("room:1").unwrap();
        let mut rx2 = bus.subscribe("room:1").unwrap();

        let count = bus.publish("room:1", "content:updated", json!({"content": "hi"}));
        assert_eq!(count, 2);

        assert_eq!(rx1.try_recv().unwrap().event, "content:updated");
        assert_eq!(rx2.try_recv().unwrap().event, "content:updated");
    }

    #[test]
    fn test_publish_to_closed_topic() {
        let bus = Bus::new();
        assert_eq!(bus.publish("room:1", "x", json!({})), 0);
        assert!(bus.subscribe("room:1").is_none());
    }

    #[test]
    fn test_late_subscriber_misses_message() {
        let bus = Bus::new();
        bus.open_topic("room:1");
        let _rx = bus.subscribe("room:1").unwrap();

        bus.publish("room:1", "content:updated", json!({}));

        let mut late = bus.subscribe("room:1").unwrap();
        assert!(late.try_recv().is_err());
    }

    #[test]
    fn test_publish_except_filters_at_receiver() {
        let bus = Bus::new();
        bus.open_topic("room:1");

        let me = SessionId::generate();
        let other = SessionId::generate();
        let mut rx = bus.subscribe("room:1").unwrap();

        bus.publish_except("room:1", "content:updated", json!({}), me);

        let msg = rx.try_recv().unwrap();
        assert!(!msg.delivers_to(me));
        assert!(msg.delivers_to(other));
    }

    #[tokio::test]
    async fn test_push_unicast() {
        let bus = Bus::new();
        let session = SessionId::generate();
        let (tx, mut rx) = mpsc::unbounded_channel();

        bus.register_session(session, tx);
        bus.push(session, "room:1", "presence_state", json!({}))
            .unwrap();

        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.event, "presence_state");
        assert_eq!(delivery.topic, "room:1");

        bus.unregister_session(session);
        assert!(matches!(
            bus.push(session, "room:1", "presence_state", json!({})),
            Err(BusError::UnknownSession(_))
        ));
    }
}

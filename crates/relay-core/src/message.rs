//! Identifiers and message types used internally by the broker.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// A topic name partitioning the message space (e.g. `"room:42"`).
pub type TopicId = String;

static CONN_COUNTER: AtomicU64 = AtomicU64::new(0);
static SESSION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a registered connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Create a connection ID from an existing string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh connection ID.
    ///
    /// Combines a timestamp with an atomic counter so IDs stay unique even
    /// within the same nanosecond.
    #[must_use]
    pub fn generate() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        let counter = CONN_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{:x}", timestamp.wrapping_add(counter)))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Unique identifier for a channel session (one connection on one topic).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl SessionId {
    /// Generate a fresh session ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(SESSION_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sess_{:x}", self.0)
    }
}

/// A message fanned out to every session on a topic.
///
/// Transient: produced by a session or the presence store, consumed by the
/// bus, never persisted.
#[derive(Debug, Clone)]
pub struct Broadcast {
    /// Target topic.
    pub topic: TopicId,
    /// Event name (e.g. `content:updated`, `presence_diff`).
    pub event: String,
    /// Structured payload.
    pub payload: Value,
    /// Session excluded from delivery, for sender-exclusive broadcasts.
    pub except: Option<SessionId>,
}

impl Broadcast {
    /// Create a broadcast delivered to every session on the topic.
    #[must_use]
    pub fn new(topic: impl Into<TopicId>, event: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            event: event.into(),
            payload,
            except: None,
        }
    }

    /// Exclude one session from delivery.
    #[must_use]
    pub fn except(mut self, session: SessionId) -> Self {
        self.except = Some(session);
        self
    }

    /// Whether this broadcast should be delivered to the given session.
    #[must_use]
    pub fn delivers_to(&self, session: SessionId) -> bool {
        self.except != Some(session)
    }
}

/// A message addressed to a single connection: the final form of both
/// broadcasts and unicast pushes.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Originating topic.
    pub topic: TopicId,
    /// Event name.
    pub event: String,
    /// Structured payload.
    pub payload: Value,
}

impl Delivery {
    /// Create a delivery.
    #[must_use]
    pub fn new(topic: impl Into<TopicId>, event: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            event: event.into(),
            payload,
        }
    }
}

impl From<&Broadcast> for Delivery {
    fn from(b: &Broadcast) -> Self {
        Self {
            topic: b.topic.clone(),
            event: b.event.clone(),
            payload: b.payload.clone(),
        }
    }
}

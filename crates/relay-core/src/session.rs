//! Channel sessions.
//!
//! A session binds one connection to one topic and walks a small state
//! machine: `Joining -> Joined -> Left`. `Joining` exists only while the
//! join resolver runs; a session that fails to resolve is discarded without
//! ever being registered. `Left` is terminal.

use crate::message::{ConnectionId, SessionId, TopicId};
use crate::presence::PresenceRef;
use serde_json::Value;
use std::collections::HashMap;

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Join requested, resolver pending.
    Joining,
    /// Active; inbound events are accepted.
    Joined,
    /// Terminal; all resources released, presence untracked.
    Left,
}

/// Session-local key-value state, passed into every handler invocation.
///
/// Explicit and owned by the session; never global.
#[derive(Debug, Default)]
pub struct Assigns(HashMap<String, Value>);

impl Assigns {
    /// Create an empty bag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Insert a value, returning the previous one.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(key.into(), value)
    }

    /// Remove a value.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }
}

/// Result of handling an inbound event.
///
/// Broadcasts and presence diffs are never returned here; they are emitted
/// as side-channel fan-out, observable by all sessions on the topic
/// including the sender.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerResult {
    /// Reply to the sender with a payload.
    Reply(Value),
    /// No reply.
    NoReply,
    /// Error reply to the sender only.
    Error(Value),
}

/// One connection's membership in one topic.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    connection: ConnectionId,
    topic: TopicId,
    presence_key: String,
    presence_ref: PresenceRef,
    state: SessionState,
    assigns: Assigns,
}

impl Session {
    /// Create a session in the `Joining` state.
    #[must_use]
    pub fn new(
        connection: ConnectionId,
        topic: impl Into<TopicId>,
        presence_key: impl Into<String>,
        presence_ref: PresenceRef,
    ) -> Self {
        Self {
            id: SessionId::generate(),
            connection,
            topic: topic.into(),
            presence_key: presence_key.into(),
            presence_ref,
            state: SessionState::Joining,
            assigns: Assigns::new(),
        }
    }

    /// Session ID.
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// The owning connection.
    #[must_use]
    pub fn connection(&self) -> &ConnectionId {
        &self.connection
    }

    /// The joined topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Presence key this session tracks under (the principal's ID).
    #[must_use]
    pub fn presence_key(&self) -> &str {
        &self.presence_key
    }

    /// Reference tag of this session's presence meta.
    #[must_use]
    pub fn presence_ref(&self) -> &PresenceRef {
        &self.presence_ref
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether inbound events are accepted.
    #[must_use]
    pub fn is_joined(&self) -> bool {
        self.state == SessionState::Joined
    }

    /// Session-local state.
    #[must_use]
    pub fn assigns(&self) -> &Assigns {
        &self.assigns
    }

    /// Mutable session-local state.
    pub fn assigns_mut(&mut self) -> &mut Assigns {
        &mut self.assigns
    }

    /// Transition `Joining -> Joined` after the resolver succeeds.
    pub fn confirm(&mut self) {
        debug_assert_eq!(self.state, SessionState::Joining);
        self.state = SessionState::Joined;
    }

    /// Transition to `Left`. Terminal; idempotent.
    pub fn depart(&mut self) {
        self.state = SessionState::Left;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::Presence;
    use serde_json::json;

    fn session() -> Session {
        let mut presence = Presence::new("node-a");
        let (tag, _) = presence.track("user-1", json!({}));
        Session::new(ConnectionId::from("conn-1"), "room:1", "user-1", tag)
    }

    #[test]
    fn test_lifecycle() {
        let mut s = session();
        assert_eq!(s.state(), SessionState::Joining);
        assert!(!s.is_joined());

        s.confirm();
        assert!(s.is_joined());

        s.depart();
        assert_eq!(s.state(), SessionState::Left);
        assert!(!s.is_joined());

        // Terminal and idempotent.
        s.depart();
        assert_eq!(s.state(), SessionState::Left);
    }

    #[test]
    fn test_assigns() {
        let mut s = session();
        s.assigns_mut().insert("object_id", json!(42));

        assert_eq!(s.assigns().get("object_id"), Some(&json!(42)));
        assert_eq!(s.assigns_mut().remove("object_id"), Some(json!(42)));
        assert!(s.assigns().get("object_id").is_none());
    }
}

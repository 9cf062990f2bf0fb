//! Topic broker.
//!
//! The broker routes joins to topics, activates topics on first join via the
//! external join resolver, and orchestrates each session's inbound events
//! against the presence store and the broadcast bus.

use crate::bus::Bus;
use crate::error::BrokerError;
use crate::hooks::{Authenticator, HookError, JoinResolver, UpdatePersister};
use crate::message::{Broadcast, ConnectionId, Delivery, SessionId, TopicId};
use crate::presence::{Meta, Presence, PresenceDiff};
use crate::registry::Registry;
use crate::session::{HandlerResult, Session};
use dashmap::DashMap;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, info, warn};

/// Maximum topic name length.
pub const MAX_TOPIC_NAME_LENGTH: usize = 256;

/// Event names understood and emitted by the broker.
pub mod events {
    /// Inbound: apply a content update.
    pub const CONTENT_UPDATE: &str = "content:update";
    /// Inbound: the sender stopped editing.
    pub const TYPING_STOP: &str = "typing:stop";
    /// Outbound broadcast: content changed.
    pub const CONTENT_UPDATED: &str = "content:updated";
    /// Outbound broadcast: presence joins/leaves delta.
    pub const PRESENCE_DIFF: &str = "presence_diff";
    /// Outbound unicast: full presence snapshot.
    pub const PRESENCE_STATE: &str = "presence_state";
}

/// Validate a topic name.
///
/// # Errors
///
/// Returns an error message if the topic name is invalid.
pub fn validate_topic_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Topic name cannot be empty");
    }
    if name.len() > MAX_TOPIC_NAME_LENGTH {
        return Err("Topic name too long");
    }
    if name.starts_with('$') {
        return Err("Topic names starting with '$' are reserved");
    }
    if !name.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("Topic name contains invalid characters");
    }
    Ok(())
}

/// The part of a topic name after the first `:`, handed to the resolver
/// (`"42"` for `"room:42"`).
fn topic_suffix(topic: &str) -> &str {
    topic.split_once(':').map_or(topic, |(_, suffix)| suffix)
}

/// Broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Maximum number of active topics.
    pub max_topics: usize,
    /// Maximum joins per connection.
    pub max_joins_per_connection: usize,
    /// Fan-out capacity per topic.
    pub topic_capacity: usize,
    /// Node name stamped onto presence metas created here.
    pub node: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_topics: 10_000,
            max_joins_per_connection: 100,
            topic_capacity: 1024,
            node: "relay@local".to_string(),
        }
    }
}

/// Per-topic state, created on first join and torn down when the last
/// session leaves and no presence remains.
struct TopicEntry {
    /// Domain object fetched by the join resolver.
    object: Value,
    presence: Presence,
    sessions: HashSet<SessionId>,
}

/// A successful join.
pub struct JoinAccept {
    /// The created session.
    pub session: SessionId,
    /// Reply payload for the joiner: the domain object and the current
    /// presence snapshot.
    pub reply: Value,
    /// Fan-out receiver for the topic.
    pub receiver: broadcast::Receiver<Arc<Broadcast>>,
}

/// Broker statistics.
#[derive(Debug, Clone)]
pub struct BrokerStats {
    /// Number of active topics.
    pub topic_count: usize,
    /// Number of registered connections.
    pub connection_count: usize,
    /// Number of live sessions.
    pub session_count: usize,
}

/// The topic broker.
pub struct Broker {
    registry: Registry,
    bus: Bus,
    topics: DashMap<TopicId, TopicEntry>,
    /// Sessions behind a mutex: inbound events for one session never
    /// overlap, even across the persister await.
    sessions: DashMap<SessionId, Arc<Mutex<Session>>>,
    authenticator: Arc<dyn Authenticator>,
    resolver: Arc<dyn JoinResolver>,
    persister: Arc<dyn UpdatePersister>,
    config: BrokerConfig,
}

impl Broker {
    /// Create a broker with default configuration.
    #[must_use]
    pub fn new(
        authenticator: Arc<dyn Authenticator>,
        resolver: Arc<dyn JoinResolver>,
        persister: Arc<dyn UpdatePersister>,
    ) -> Self {
        Self::with_config(BrokerConfig::default(), authenticator, resolver, persister)
    }

    /// Create a broker with custom configuration.
    #[must_use]
    pub fn with_config(
        config: BrokerConfig,
        authenticator: Arc<dyn Authenticator>,
        resolver: Arc<dyn JoinResolver>,
        persister: Arc<dyn UpdatePersister>,
    ) -> Self {
        info!(node = %config.node, "Creating broker");
        Self {
            registry: Registry::new(),
            bus: Bus::with_capacity(config.topic_capacity),
            topics: DashMap::new(),
            sessions: DashMap::new(),
            authenticator,
            resolver,
            persister,
            config,
        }
    }

    /// The broadcast bus.
    #[must_use]
    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    /// Broker statistics.
    #[must_use]
    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            topic_count: self.topics.len(),
            connection_count: self.registry.count(),
            session_count: self.sessions.len(),
        }
    }

    /// Register a connection after verifying credentials.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::AuthenticationFailed`] if the authenticator
    /// rejects the credentials.
    pub async fn connect(
        &self,
        credentials: Option<&str>,
        outbound: mpsc::UnboundedSender<Delivery>,
    ) -> Result<ConnectionId, BrokerError> {
        self.registry
            .register(credentials, outbound, self.authenticator.as_ref())
            .await
    }

    /// Tear down a connection: leave every session it holds, then
    /// unregister. Emits exactly one presence leave diff per joined topic.
    pub async fn disconnect(&self, connection: &ConnectionId) {
        for session in self.registry.sessions_of(connection) {
            if let Err(e) = self.leave(session).await {
                warn!(connection = %connection, session = %session, error = %e, "Leave during disconnect failed");
            }
        }
        self.registry.unregister(connection);
    }

    /// Join a connection to a topic.
    ///
    /// The first join to a topic invokes the join resolver; later joins
    /// reuse the resolved object. A second join from the same connection to
    /// the same topic is rejected, never silently upgraded.
    ///
    /// # Errors
    ///
    /// Returns an error if the topic name is invalid, the connection is
    /// unknown, limits are exceeded, the join is a duplicate, or the
    /// resolver fails.
    pub async fn join(
        &self,
        connection: &ConnectionId,
        topic: &str,
        params: Value,
    ) -> Result<JoinAccept, BrokerError> {
        validate_topic_name(topic).map_err(BrokerError::InvalidTopic)?;

        let principal = self
            .registry
            .principal(connection)
            .ok_or(BrokerError::ConnectionLost)?;
        let outbound = self
            .registry
            .outbound(connection)
            .ok_or(BrokerError::ConnectionLost)?;

        if self.registry.join_count(connection) >= self.config.max_joins_per_connection {
            return Err(BrokerError::MaxJoinsReached);
        }
        if self.registry.session_on(connection, topic).is_some() {
            return Err(BrokerError::DuplicateJoin(topic.to_string()));
        }

        // First join activates the topic. The resolver runs outside any
        // map guard; concurrent first-joins may both resolve, only one
        // inserts.
        if !self.topics.contains_key(topic) {
            if self.topics.len() >= self.config.max_topics {
                return Err(BrokerError::MaxTopicsReached);
            }
            let object = self
                .resolver
                .resolve(topic_suffix(topic))
                .await
                .map_err(|e| match e {
                    HookError::NotFound => BrokerError::TopicNotFound(topic.to_string()),
                    other => BrokerError::JoinRejected(other.to_string()),
                })?;

            self.topics.entry(topic.to_string()).or_insert_with(|| {
                debug!(topic = %topic, "Activating topic");
                self.bus.open_topic(topic);
                TopicEntry {
                    object,
                    presence: Presence::new(self.config.node.clone()),
                    sessions: HashSet::new(),
                }
            });
        }

        // Join params become the initial presence meta; typing starts false.
        let mut meta = match params {
            Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        meta.entry("typing").or_insert(Value::Bool(false));

        // Everything the joiner sees happens under the topic-entry guard:
        // subscribe first, then track and snapshot, then publish. Any diff
        // from a concurrent session is either in the snapshot (it ran
        // before) or reaches the receiver (it publishes under the guard
        // after us) -- never neither.
        let (accept, tag) = {
            let mut entry = self
                .topics
                .get_mut(topic)
                .ok_or_else(|| BrokerError::TopicNotFound(topic.to_string()))?;

            let receiver = self
                .bus
                .subscribe(topic)
                .ok_or_else(|| BrokerError::TopicNotFound(topic.to_string()))?;

            let (tag, join_diff) = entry.presence.track(&principal.id, Value::Object(meta));
            let snapshot = entry.presence.snapshot();

            let mut session =
                Session::new(connection.clone(), topic, principal.id.clone(), tag.clone());
            session
                .assigns_mut()
                .insert("user", principal.data.clone());
            session.confirm();
            let sid = session.id();

            entry.sessions.insert(sid);
            self.sessions.insert(sid, Arc::new(Mutex::new(session)));

            // The joiner is already subscribed and sees its own join diff.
            self.bus
                .publish(topic, events::PRESENCE_DIFF, join_diff.to_value());

            let accept = JoinAccept {
                session: sid,
                reply: json!({ "object": entry.object.clone(), "presence": snapshot }),
                receiver,
            };
            (accept, tag)
        };
        let sid = accept.session;

        if let Err(e) = self.registry.mark_joined(connection, topic, sid) {
            // Roll back: the join diff is already out, so the retraction
            // must be too. A just-activated topic may now be empty.
            self.sessions.remove(&sid);
            if let Some(mut entry) = self.topics.get_mut(topic) {
                entry.sessions.remove(&sid);
                if let Some(diff) = entry.presence.untrack(&principal.id, &tag) {
                    self.bus
                        .publish(topic, events::PRESENCE_DIFF, diff.to_value());
                }
            }
            self.deactivate_if_empty(topic);
            return Err(e);
        }

        self.bus.register_session(sid, outbound);

        info!(connection = %connection, topic = %topic, session = %sid, "Joined");

        Ok(accept)
    }

    /// Handle an inbound event for a session.
    ///
    /// Broadcasts and presence diffs are emitted as side effects; the
    /// return value is only the reply to the sender.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is unknown or already left.
    pub async fn handle_in(
        &self,
        session: SessionId,
        event: &str,
        payload: Value,
    ) -> Result<HandlerResult, BrokerError> {
        let cell = self
            .sessions
            .get(&session)
            .map(|s| s.value().clone())
            .ok_or(BrokerError::SessionNotFound)?;

        let guard = cell.lock().await;
        if !guard.is_joined() {
            return Err(BrokerError::SessionNotFound);
        }

        match event {
            events::CONTENT_UPDATE => self.handle_content_update(&guard, payload).await,
            events::TYPING_STOP => self.handle_typing_stop(&guard),
            _ => {
                debug!(session = %session, event = %event, "Unknown event");
                Ok(HandlerResult::Error(
                    json!({ "reason": "unknown event", "event": event }),
                ))
            }
        }
    }

    /// Leave a session. Terminal: presence is untracked, the leave diff
    /// published, and empty topics torn down.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is unknown.
    pub async fn leave(&self, session: SessionId) -> Result<(), BrokerError> {
        let (_, cell) = self
            .sessions
            .remove(&session)
            .ok_or(BrokerError::SessionNotFound)?;

        let mut guard = cell.lock().await;
        guard.depart();
        let topic = guard.topic().to_string();

        if let Some(mut entry) = self.topics.get_mut(&topic) {
            entry.sessions.remove(&session);
            let diff = entry
                .presence
                .untrack(guard.presence_key(), guard.presence_ref());
            // Published under the guard: diff order matches untrack order.
            if let Some(diff) = diff {
                self.bus
                    .publish(&topic, events::PRESENCE_DIFF, diff.to_value());
            }
        }

        self.bus.unregister_session(session);
        self.registry.mark_left(guard.connection(), &topic);
        self.deactivate_if_empty(&topic);

        info!(session = %session, topic = %topic, "Left");
        Ok(())
    }

    /// Full presence snapshot for a topic, or `None` if inactive.
    #[must_use]
    pub fn list(&self, topic: &str) -> Option<Value> {
        self.topics.get(topic).map(|e| e.presence.snapshot())
    }

    /// The local node's presence contributions for a topic, for sharing
    /// with cluster peers.
    #[must_use]
    pub fn extract_presence(&self, topic: &str) -> Option<BTreeMap<String, Vec<Meta>>> {
        self.topics.get(topic).map(|e| e.presence.extract_local())
    }

    /// Merge a peer node's presence state for a topic and publish the
    /// resulting diff. Returns `None` if the topic is not active here.
    pub fn merge_presence(
        &self,
        topic: &str,
        node: &str,
        state: BTreeMap<String, Vec<Meta>>,
    ) -> Option<PresenceDiff> {
        let mut entry = self.topics.get_mut(topic)?;
        let diff = entry.presence.merge_remote(node, state);
        if !diff.is_empty() {
            self.bus
                .publish(topic, events::PRESENCE_DIFF, diff.to_value());
        }
        Some(diff)
    }

    /// Drop a departed peer node's presence contributions from every topic,
    /// publishing leave diffs where anything changed.
    pub fn presence_node_down(&self, node: &str) {
        let topics: Vec<TopicId> = self.topics.iter().map(|e| e.key().clone()).collect();
        for topic in topics {
            if let Some(mut entry) = self.topics.get_mut(&topic) {
                let diff = entry.presence.remove_node(node);
                if !diff.is_empty() {
                    self.bus
                        .publish(&topic, events::PRESENCE_DIFF, diff.to_value());
                }
            }
            self.deactivate_if_empty(&topic);
        }
    }

    async fn handle_content_update(
        &self,
        session: &Session,
        payload: Value,
    ) -> Result<HandlerResult, BrokerError> {
        let Some(content) = payload.get("content").and_then(Value::as_str) else {
            return Ok(HandlerResult::Error(
                json!({ "reason": "invalid payload: missing content" }),
            ));
        };

        let topic = session.topic();
        let object = self
            .topics
            .get(topic)
            .map(|e| e.object.clone())
            .ok_or_else(|| BrokerError::TopicNotFound(topic.to_string()))?;

        // Suspension point: the session mutex stays held, so no second
        // event for this session runs until the reply and broadcasts are
        // out.
        match self.persister.apply(&object, content).await {
            Ok(updated) => {
                if let Some(mut entry) = self.topics.get_mut(topic) {
                    entry.object = updated;
                    let diff = Self::set_typing(&mut entry.presence, session, true);

                    self.bus.publish(
                        topic,
                        events::CONTENT_UPDATED,
                        json!({ "content": content }),
                    );
                    if let Some(diff) = diff {
                        self.bus
                            .publish(topic, events::PRESENCE_DIFF, diff.to_value());
                    }
                }
                Ok(HandlerResult::NoReply)
            }
            Err(e) => {
                // Sender-only error; no broadcast, no presence change.
                let err = BrokerError::UpdateFailed(e.to_string());
                warn!(session = %session.id(), topic = %topic, error = %err, "Persist rejected");
                Ok(HandlerResult::Error(json!({ "reason": err.to_string() })))
            }
        }
    }

    fn handle_typing_stop(&self, session: &Session) -> Result<HandlerResult, BrokerError> {
        let topic = session.topic();

        let snapshot = match self.topics.get_mut(topic) {
            Some(mut entry) => {
                if let Some(diff) = Self::set_typing(&mut entry.presence, session, false) {
                    self.bus
                        .publish(topic, events::PRESENCE_DIFF, diff.to_value());
                }
                entry.presence.snapshot()
            }
            None => return Err(BrokerError::TopicNotFound(topic.to_string())),
        };

        // The sender alone gets the full snapshot.
        if let Err(e) = self
            .bus
            .push(session.id(), topic, events::PRESENCE_STATE, snapshot)
        {
            warn!(session = %session.id(), error = %e, "Snapshot push failed");
        }

        Ok(HandlerResult::NoReply)
    }

    fn set_typing(presence: &mut Presence, session: &Session, typing: bool) -> Option<PresenceDiff> {
        let mut data = presence.data_of(session.presence_key(), session.presence_ref())?;
        data["typing"] = Value::Bool(typing);
        presence.update(session.presence_key(), session.presence_ref(), data)
    }

    fn deactivate_if_empty(&self, topic: &str) {
        let empty = self
            .topics
            .get(topic)
            .is_some_and(|e| e.sessions.is_empty() && e.presence.is_empty());
        if empty {
            self.topics.remove(topic);
            self.bus.close_topic(topic);
            debug!(topic = %topic, "Deactivated empty topic");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::Principal;
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct TokenAuth;

    #[async_trait]
    impl Authenticator for TokenAuth {
        async fn verify(&self, credentials: Option<&str>) -> Result<Principal, HookError> {
            match credentials {
                Some(user) => Ok(Principal::new(user).with_data(json!({ "name": user }))),
                None => Err(HookError::Rejected("missing token".into())),
            }
        }
    }

    struct MapResolver(HashMap<String, Value>);

    #[async_trait]
    impl JoinResolver for MapResolver {
        async fn resolve(&self, topic_suffix: &str) -> Result<Value, HookError> {
            self.0.get(topic_suffix).cloned().ok_or(HookError::NotFound)
        }
    }

    struct OkPersister;

    #[async_trait]
    impl UpdatePersister for OkPersister {
        async fn apply(&self, object: &Value, new_content: &str) -> Result<Value, HookError> {
            let mut updated = object.clone();
            updated["content"] = json!(new_content);
            Ok(updated)
        }
    }

    struct FailPersister;

    #[async_trait]
    impl UpdatePersister for FailPersister {
        async fn apply(&self, _object: &Value, _new_content: &str) -> Result<Value, HookError> {
            Err(HookError::Failure("storage unavailable".into()))
        }
    }

    fn broker_with(persister: Arc<dyn UpdatePersister>) -> Broker {
        let mut objects = HashMap::new();
        objects.insert("42".to_string(), json!({ "id": 42, "content": "" }));
        objects.insert("7".to_string(), json!({ "id": 7, "content": "seven" }));

        Broker::new(Arc::new(TokenAuth), Arc::new(MapResolver(objects)), persister)
    }

    fn broker() -> Broker {
        broker_with(Arc::new(OkPersister))
    }

    async fn connect(
        broker: &Broker,
        user: &str,
    ) -> (ConnectionId, mpsc::UnboundedReceiver<Delivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = broker.connect(Some(user), tx).await.unwrap();
        (id, rx)
    }

    fn drain(rx: &mut broadcast::Receiver<Arc<Broadcast>>) -> Vec<Arc<Broadcast>> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[tokio::test]
    async fn test_join_resolves_and_tracks() {
        // Scenario A: join resolves the domain object and tracks presence.
        let broker = broker();
        let (conn, _rx) = connect(&broker, "user-1").await;

        let accept = broker.join(&conn, "room:42", json!({})).await.unwrap();
        assert_eq!(accept.reply["object"]["id"], 42);
        assert_eq!(accept.reply["object"]["content"], "");

        let list = broker.list("room:42").unwrap();
        let metas = list["user-1"]["metas"].as_array().unwrap();
        assert_eq!(metas.len(), 1);
        assert_eq!(metas[0]["typing"], false);
        assert_eq!(metas[0]["name"], "user-1");
    }

    #[tokio::test]
    async fn test_join_unknown_topic() {
        let broker = broker();
        let (conn, _rx) = connect(&broker, "user-1").await;

        let err = broker.join(&conn, "room:999", json!({})).await;
        assert!(matches!(err, Err(BrokerError::TopicNotFound(_))));
        assert_eq!(broker.stats().topic_count, 0);
    }

    #[tokio::test]
    async fn test_duplicate_join_rejected() {
        let broker = broker();
        let (conn, _rx) = connect(&broker, "user-1").await;

        broker.join(&conn, "room:42", json!({})).await.unwrap();
        let err = broker.join(&conn, "room:42", json!({})).await;
        assert!(matches!(err, Err(BrokerError::DuplicateJoin(_))));

        // The original session is untouched.
        let list = broker.list("room:42").unwrap();
        assert_eq!(list["user-1"]["metas"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_topic_names() {
        let broker = broker();
        let (conn, _rx) = connect(&broker, "user-1").await;

        for bad in ["", "$internal"] {
            assert!(matches!(
                broker.join(&conn, bad, json!({})).await,
                Err(BrokerError::InvalidTopic(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_authentication_failure() {
        let broker = broker();
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(matches!(
            broker.connect(None, tx).await,
            Err(BrokerError::AuthenticationFailed)
        ));
        assert_eq!(broker.stats().connection_count, 0);
    }

    #[tokio::test]
    async fn test_join_diff_reaches_everyone_including_joiner() {
        let broker = broker();
        let (c1, _d1) = connect(&broker, "user-1").await;
        let (c2, _d2) = connect(&broker, "user-2").await;

        let mut a1 = broker.join(&c1, "room:42", json!({})).await.unwrap();
        let own = drain(&mut a1.receiver);
        assert_eq!(own.len(), 1);
        assert_eq!(own[0].event, events::PRESENCE_DIFF);
        assert!(own[0].payload["joins"]["user-1"].is_object());

        let mut a2 = broker.join(&c2, "room:42", json!({})).await.unwrap();
        let seen_by_first = drain(&mut a1.receiver);
        assert_eq!(seen_by_first.len(), 1);
        assert!(seen_by_first[0].payload["joins"]["user-2"].is_object());
        // The second joiner sees its own join but not the first one's.
        let own2 = drain(&mut a2.receiver);
        assert_eq!(own2.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_joiners_see_each_other() {
        // Two users race to join the same fresh topic. Each joiner must
        // learn about the other through the snapshot or through a diff on
        // its receiver; a diff slipping between the two is a lost update.
        for i in 0..300 {
            let broker = Arc::new(broker());
            let (c1, _d1) = connect(&broker, "user-1").await;
            let (c2, _d2) = connect(&broker, "user-2").await;

            let b1 = Arc::clone(&broker);
            let j1 = tokio::spawn(async move { b1.join(&c1, "room:42", json!({})).await.unwrap() });
            let b2 = Arc::clone(&broker);
            let j2 = tokio::spawn(async move { b2.join(&c2, "room:42", json!({})).await.unwrap() });

            let mut a1 = j1.await.unwrap();
            let mut a2 = j2.await.unwrap();

            for (accept, other) in [(&mut a1, "user-2"), (&mut a2, "user-1")] {
                let mut seen: Vec<String> = accept.reply["presence"]
                    .as_object()
                    .unwrap()
                    .keys()
                    .cloned()
                    .collect();
                for msg in drain(&mut accept.receiver) {
                    if msg.event == events::PRESENCE_DIFF {
                        if let Some(joins) = msg.payload["joins"].as_object() {
                            seen.extend(joins.keys().cloned());
                        }
                    }
                }
                assert!(
                    seen.iter().any(|k| k == other),
                    "iteration {i}: joiner missed {other}; saw {seen:?}"
                );
            }
        }
    }

    #[tokio::test]
    async fn test_content_update_broadcasts_and_marks_typing() {
        // Scenario B.
        let broker = broker();
        let (c1, _d1) = connect(&broker, "user-1").await;
        let (c2, _d2) = connect(&broker, "user-2").await;

        let mut a1 = broker.join(&c1, "room:42", json!({})).await.unwrap();
        let mut a2 = broker.join(&c2, "room:42", json!({})).await.unwrap();
        drain(&mut a1.receiver);
        drain(&mut a2.receiver);

        let result = broker
            .handle_in(a1.session, events::CONTENT_UPDATE, json!({"content": "hello"}))
            .await
            .unwrap();
        assert_eq!(result, HandlerResult::NoReply);

        let seen = drain(&mut a2.receiver);
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].event, events::CONTENT_UPDATED);
        assert_eq!(seen[0].payload["content"], "hello");
        assert_eq!(seen[1].event, events::PRESENCE_DIFF);
        assert_eq!(seen[1].payload["joins"]["user-1"]["metas"][0]["typing"], true);

        // The sender observes the same fan-out.
        let own = drain(&mut a1.receiver);
        assert_eq!(own.len(), 2);

        // The updated object serves subsequent joins.
        let (c3, _d3) = connect(&broker, "user-3").await;
        let a3 = broker.join(&c3, "room:42", json!({})).await.unwrap();
        assert_eq!(a3.reply["object"]["content"], "hello");
    }

    #[tokio::test]
    async fn test_failed_update_replies_only_to_sender() {
        // Scenario C.
        let broker = broker_with(Arc::new(FailPersister));
        let (c1, _d1) = connect(&broker, "user-1").await;
        let (c2, _d2) = connect(&broker, "user-2").await;

        let mut a1 = broker.join(&c1, "room:42", json!({})).await.unwrap();
        let mut a2 = broker.join(&c2, "room:42", json!({})).await.unwrap();
        drain(&mut a1.receiver);
        drain(&mut a2.receiver);

        let result = broker
            .handle_in(a1.session, events::CONTENT_UPDATE, json!({"content": "hello"}))
            .await
            .unwrap();
        match result {
            HandlerResult::Error(payload) => {
                assert_eq!(payload["reason"], "Update failed: storage unavailable");
            }
            other => panic!("Expected error reply, got {:?}", other),
        }

        // No broadcast to anyone, presence unchanged.
        assert!(drain(&mut a1.receiver).is_empty());
        assert!(drain(&mut a2.receiver).is_empty());
        let list = broker.list("room:42").unwrap();
        assert_eq!(list["user-1"]["metas"][0]["typing"], false);
    }

    #[tokio::test]
    async fn test_typing_stop_unicasts_snapshot() {
        let broker = broker();
        let (c1, mut d1) = connect(&broker, "user-1").await;
        let (c2, mut d2) = connect(&broker, "user-2").await;

        let mut a1 = broker.join(&c1, "room:42", json!({})).await.unwrap();
        let a2 = broker.join(&c2, "room:42", json!({})).await.unwrap();

        broker
            .handle_in(a1.session, events::CONTENT_UPDATE, json!({"content": "x"}))
            .await
            .unwrap();
        drain(&mut a1.receiver);

        let result = broker
            .handle_in(a1.session, events::TYPING_STOP, json!({}))
            .await
            .unwrap();
        assert_eq!(result, HandlerResult::NoReply);

        // Fan-out carries the typing:false diff.
        let seen = drain(&mut a1.receiver);
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].payload["joins"]["user-1"]["metas"][0]["typing"], false);

        // Only the sender's connection receives the snapshot push.
        let delivery = d1.recv().await.unwrap();
        assert_eq!(delivery.event, events::PRESENCE_STATE);
        assert!(delivery.payload["user-1"]["metas"].is_array());
        assert!(delivery.payload["user-2"]["metas"].is_array());
        assert!(d2.try_recv().is_err());

        let _ = a2;
    }

    #[tokio::test]
    async fn test_unknown_event() {
        let broker = broker();
        let (conn, _d) = connect(&broker, "user-1").await;
        let accept = broker.join(&conn, "room:42", json!({})).await.unwrap();

        let result = broker
            .handle_in(accept.session, "no:such:event", json!({}))
            .await
            .unwrap();
        assert!(matches!(result, HandlerResult::Error(_)));
    }

    #[tokio::test]
    async fn test_two_sessions_same_user() {
        // Scenario D: the same user in two tabs.
        let broker = broker();
        let (c1, _d1) = connect(&broker, "user-1").await;
        let (c2, _d2) = connect(&broker, "user-1").await;

        broker.join(&c1, "room:42", json!({})).await.unwrap();
        let a2 = broker.join(&c2, "room:42", json!({})).await.unwrap();

        let list = broker.list("room:42").unwrap();
        assert_eq!(list["user-1"]["metas"].as_array().unwrap().len(), 2);

        broker.leave(a2.session).await.unwrap();
        let list = broker.list("room:42").unwrap();
        assert_eq!(list["user-1"]["metas"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_cascades_all_joins() {
        let broker = broker();
        let (c1, _d1) = connect(&broker, "user-1").await;
        let (c2, _d2) = connect(&broker, "user-2").await;

        broker.join(&c1, "room:42", json!({})).await.unwrap();
        broker.join(&c1, "room:7", json!({})).await.unwrap();
        let mut w42 = broker.join(&c2, "room:42", json!({})).await.unwrap();
        let mut w7 = broker.join(&c2, "room:7", json!({})).await.unwrap();
        drain(&mut w42.receiver);
        drain(&mut w7.receiver);

        broker.disconnect(&c1).await;

        // Exactly one leave diff per topic, no residual metas.
        for rx in [&mut w42.receiver, &mut w7.receiver] {
            let seen = drain(rx);
            assert_eq!(seen.len(), 1);
            assert_eq!(seen[0].event, events::PRESENCE_DIFF);
            assert_eq!(seen[0].payload["leaves"]["user-1"]["metas"].as_array().unwrap().len(), 1);
        }
        for topic in ["room:42", "room:7"] {
            let list = broker.list(topic).unwrap();
            assert!(list.get("user-1").is_none());
        }
        assert_eq!(broker.stats().connection_count, 1);

        // Events from the dead connection's sessions are refused.
        let err = broker
            .handle_in(w42.session, events::TYPING_STOP, json!({}))
            .await;
        assert!(err.is_ok(), "survivor session still works");
    }

    #[tokio::test]
    async fn test_last_leave_deactivates_topic() {
        let broker = broker();
        let (conn, _d) = connect(&broker, "user-1").await;

        let accept = broker.join(&conn, "room:42", json!({})).await.unwrap();
        assert_eq!(broker.stats().topic_count, 1);

        broker.leave(accept.session).await.unwrap();
        assert_eq!(broker.stats().topic_count, 0);
        assert!(broker.list("room:42").is_none());

        // Further events for the departed session fail.
        let err = broker
            .handle_in(accept.session, events::TYPING_STOP, json!({}))
            .await;
        assert!(matches!(err, Err(BrokerError::SessionNotFound)));

        // Rejoin re-resolves the topic from scratch.
        let accept = broker.join(&conn, "room:42", json!({})).await.unwrap();
        assert_eq!(accept.reply["object"]["id"], 42);
    }

    #[tokio::test]
    async fn test_merge_and_node_down() {
        let broker = broker();
        let (conn, _d) = connect(&broker, "user-1").await;
        let mut accept = broker.join(&conn, "room:42", json!({})).await.unwrap();
        drain(&mut accept.receiver);

        // A peer node reports one meta for another user.
        let mut remote = Presence::new("relay@peer");
        remote.track("user-9", json!({"typing": false}));
        let diff = broker
            .merge_presence("room:42", "relay@peer", remote.extract_local())
            .unwrap();
        assert!(diff.leaves.is_empty());

        let seen = drain(&mut accept.receiver);
        assert_eq!(seen.len(), 1);
        assert!(seen[0].payload["joins"]["user-9"].is_object());
        assert!(broker.list("room:42").unwrap().get("user-9").is_some());

        // The peer goes away; its contributions are dropped.
        broker.presence_node_down("relay@peer");
        let seen = drain(&mut accept.receiver);
        assert_eq!(seen.len(), 1);
        assert!(seen[0].payload["leaves"]["user-9"].is_object());
        assert!(broker.list("room:42").unwrap().get("user-9").is_none());

        // Local contributions are what peers would receive from us.
        let local = broker.extract_presence("room:42").unwrap();
        assert!(local.contains_key("user-1"));
        assert!(!local.contains_key("user-9"));
    }

    #[tokio::test]
    async fn test_max_joins_per_connection() {
        let mut config = BrokerConfig::default();
        config.max_joins_per_connection = 1;

        let mut objects = HashMap::new();
        objects.insert("42".to_string(), json!({ "id": 42, "content": "" }));
        objects.insert("7".to_string(), json!({ "id": 7, "content": "" }));
        let broker = Broker::with_config(
            config,
            Arc::new(TokenAuth),
            Arc::new(MapResolver(objects)),
            Arc::new(OkPersister),
        );

        let (conn, _d) = connect(&broker, "user-1").await;
        broker.join(&conn, "room:42", json!({})).await.unwrap();
        assert!(matches!(
            broker.join(&conn, "room:7", json!({})).await,
            Err(BrokerError::MaxJoinsReached)
        ));
    }

    #[test]
    fn test_topic_suffix() {
        assert_eq!(topic_suffix("room:42"), "42");
        assert_eq!(topic_suffix("room:42:extra"), "42:extra");
        assert_eq!(topic_suffix("lobby"), "lobby");
    }

    #[test]
    fn test_validate_topic_name() {
        assert!(validate_topic_name("room:42").is_ok());
        assert!(validate_topic_name("").is_err());
        assert!(validate_topic_name("$reserved").is_err());
        assert!(validate_topic_name(&"a".repeat(MAX_TOPIC_NAME_LENGTH + 1)).is_err());
        assert!(validate_topic_name("room:\u{7}").is_err());
    }
}

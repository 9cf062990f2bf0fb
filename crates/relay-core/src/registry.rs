//! Connection registry.
//!
//! Tracks live connections, their verified principal, and the sessions they
//! hold. Authentication is delegated to the [`Authenticator`] collaborator;
//! the registry only records its outcome. Channel sessions refer to
//! connections by ID and never own them.

use crate::error::BrokerError;
use crate::hooks::{Authenticator, Principal};
use crate::message::{ConnectionId, Delivery, SessionId, TopicId};
use dashmap::DashMap;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// A registered connection.
#[derive(Debug)]
pub struct Connection {
    /// Connection ID.
    pub id: ConnectionId,
    /// Verified identity, opaque to the broker.
    pub principal: Principal,
    /// Route for messages bound for this connection.
    outbound: mpsc::UnboundedSender<Delivery>,
    /// Topic to session for every active join.
    sessions: HashMap<TopicId, SessionId>,
}

/// The connection registry.
#[derive(Debug, Default)]
pub struct Registry {
    connections: DashMap<ConnectionId, Connection>,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live connections.
    #[must_use]
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Register a connection after verifying its credentials.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::AuthenticationFailed`] if the authenticator
    /// rejects the credentials; nothing is registered in that case.
    pub async fn register(
        &self,
        credentials: Option<&str>,
        outbound: mpsc::UnboundedSender<Delivery>,
        authenticator: &dyn Authenticator,
    ) -> Result<ConnectionId, BrokerError> {
        let principal = authenticator.verify(credentials).await.map_err(|e| {
            warn!(error = %e, "Authentication rejected");
            BrokerError::AuthenticationFailed
        })?;

        let id = ConnectionId::generate();
        debug!(connection = %id, principal = %principal.id, "Connection registered");

        self.connections.insert(
            id.clone(),
            Connection {
                id: id.clone(),
                principal,
                outbound,
                sessions: HashMap::new(),
            },
        );

        Ok(id)
    }

    /// Whether a connection is registered.
    #[must_use]
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    /// The principal a connection authenticated as.
    #[must_use]
    pub fn principal(&self, id: &ConnectionId) -> Option<Principal> {
        self.connections.get(id).map(|c| c.principal.clone())
    }

    /// The outbound route for a connection.
    #[must_use]
    pub fn outbound(&self, id: &ConnectionId) -> Option<mpsc::UnboundedSender<Delivery>> {
        self.connections.get(id).map(|c| c.outbound.clone())
    }

    /// Number of topics the connection has joined.
    #[must_use]
    pub fn join_count(&self, id: &ConnectionId) -> usize {
        self.connections.get(id).map_or(0, |c| c.sessions.len())
    }

    /// Record a join. Fails on a duplicate join to the same topic.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionLost`] for an unknown connection and
    /// [`BrokerError::DuplicateJoin`] if the topic is already joined.
    pub fn mark_joined(
        &self,
        id: &ConnectionId,
        topic: &str,
        session: SessionId,
    ) -> Result<(), BrokerError> {
        let mut conn = self
            .connections
            .get_mut(id)
            .ok_or(BrokerError::ConnectionLost)?;

        if conn.sessions.contains_key(topic) {
            return Err(BrokerError::DuplicateJoin(topic.to_string()));
        }
        conn.sessions.insert(topic.to_string(), session);
        Ok(())
    }

    /// Remove a join record.
    pub fn mark_left(&self, id: &ConnectionId, topic: &str) {
        if let Some(mut conn) = self.connections.get_mut(id) {
            conn.sessions.remove(topic);
        }
    }

    /// The session a connection holds on a topic, if any.
    #[must_use]
    pub fn session_on(&self, id: &ConnectionId, topic: &str) -> Option<SessionId> {
        self.connections.get(id)?.sessions.get(topic).copied()
    }

    /// Every session held by a connection.
    #[must_use]
    pub fn sessions_of(&self, id: &ConnectionId) -> Vec<SessionId> {
        self.connections
            .get(id)
            .map(|c| c.sessions.values().copied().collect())
            .unwrap_or_default()
    }

    /// Remove a connection. The caller is responsible for cascading the
    /// leave through the broker first.
    pub fn unregister(&self, id: &ConnectionId) -> Option<Connection> {
        let removed = self.connections.remove(id).map(|(_, c)| c);
        if removed.is_some() {
            debug!(connection = %id, "Connection unregistered");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::HookError;
    use async_trait::async_trait;

    struct AllowAll;

    #[async_trait]
    impl Authenticator for AllowAll {
        async fn verify(&self, credentials: Option<&str>) -> Result<Principal, HookError> {
            match credentials {
                Some(token) => Ok(Principal::new(format!("user-{token}"))),
                None => Err(HookError::Rejected("missing token".into())),
            }
        }
    }

    fn outbound() -> mpsc::UnboundedSender<Delivery> {
        mpsc::unbounded_channel().0
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let registry = Registry::new();
        let id = registry
            .register(Some("1"), outbound(), &AllowAll)
            .await
            .unwrap();

        assert!(registry.contains(&id));
        assert_eq!(registry.principal(&id).unwrap().id, "user-1");
        assert_eq!(registry.count(), 1);
    }

    #[tokio::test]
    async fn test_register_rejected() {
        let registry = Registry::new();
        let err = registry.register(None, outbound(), &AllowAll).await;

        assert!(matches!(err, Err(BrokerError::AuthenticationFailed)));
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_join_rejected() {
        let registry = Registry::new();
        let id = registry
            .register(Some("1"), outbound(), &AllowAll)
            .await
            .unwrap();

        let s1 = SessionId::generate();
        registry.mark_joined(&id, "room:1", s1).unwrap();
        assert_eq!(registry.session_on(&id, "room:1"), Some(s1));

        let err = registry.mark_joined(&id, "room:1", SessionId::generate());
        assert!(matches!(err, Err(BrokerError::DuplicateJoin(_))));

        // A different topic is fine.
        registry
            .mark_joined(&id, "room:2", SessionId::generate())
            .unwrap();
        assert_eq!(registry.join_count(&id), 2);
    }

    #[tokio::test]
    async fn test_mark_left_allows_rejoin() {
        let registry = Registry::new();
        let id = registry
            .register(Some("1"), outbound(), &AllowAll)
            .await
            .unwrap();

        registry
            .mark_joined(&id, "room:1", SessionId::generate())
            .unwrap();
        registry.mark_left(&id, "room:1");

        assert!(registry
            .mark_joined(&id, "room:1", SessionId::generate())
            .is_ok());
    }

    #[tokio::test]
    async fn test_unregister() {
        let registry = Registry::new();
        let id = registry
            .register(Some("1"), outbound(), &AllowAll)
            .await
            .unwrap();

        assert!(registry.unregister(&id).is_some());
        assert!(!registry.contains(&id));
        assert!(registry.sessions_of(&id).is_empty());
    }
}

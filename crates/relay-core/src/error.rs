//! Broker error taxonomy.
//!
//! Every variant is recovered at the session boundary: a failing join or
//! update never takes down the bus or the presence store for other sessions.

use thiserror::Error;

/// Broker errors.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Credentials were rejected by the authenticator. No connection is
    /// registered.
    #[error("Authentication failed")]
    AuthenticationFailed,

    /// Invalid topic name.
    #[error("Invalid topic name: {0}")]
    InvalidTopic(&'static str),

    /// The join resolver found no domain object for the topic.
    #[error("Topic not found: {0}")]
    TopicNotFound(String),

    /// The join resolver rejected the join.
    #[error("Join rejected: {0}")]
    JoinRejected(String),

    /// The connection already holds a session on this topic.
    #[error("Already joined topic: {0}")]
    DuplicateJoin(String),

    /// Per-connection join limit reached.
    #[error("Maximum joins per connection reached")]
    MaxJoinsReached,

    /// Broker-wide topic limit reached.
    #[error("Maximum topics reached")]
    MaxTopicsReached,

    /// The update persister failed; the sender gets an error reply and no
    /// broadcast is emitted.
    #[error("Update failed: {0}")]
    UpdateFailed(String),

    /// The connection is not (or no longer) registered.
    #[error("Connection not registered")]
    ConnectionLost,

    /// No live session with the given ID.
    #[error("Session not found")]
    SessionNotFound,
}

//! External collaborator traits.
//!
//! The broker never parses credentials, fetches domain objects, or persists
//! content itself. Those concerns are delegated to implementations of the
//! traits below, supplied when the broker is built.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Errors returned by collaborators.
#[derive(Debug, Error)]
pub enum HookError {
    /// The requested object does not exist.
    #[error("not found")]
    NotFound,

    /// The operation was rejected (bad credentials, validation failure).
    #[error("rejected: {0}")]
    Rejected(String),

    /// The collaborator failed (I/O, backend down).
    #[error("{0}")]
    Failure(String),
}

/// A verified identity, produced by an [`Authenticator`].
///
/// The broker treats the principal as opaque: `id` keys presence entries,
/// `data` rides along into handlers untouched.
#[derive(Debug, Clone)]
pub struct Principal {
    /// Stable identity key (typically a user ID).
    pub id: String,
    /// Arbitrary verified claims.
    pub data: Value,
}

impl Principal {
    /// Create a principal with no claims.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            data: Value::Null,
        }
    }

    /// Attach claims data.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}

/// Verifies connection credentials.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Verify credentials and produce a principal.
    ///
    /// # Errors
    ///
    /// Returns an error if the credentials are missing or invalid.
    async fn verify(&self, credentials: Option<&str>) -> Result<Principal, HookError>;
}

/// Resolves the domain object behind a topic on first join.
///
/// Invoked once per topic activation with the suffix of the topic name
/// (`"42"` for `"room:42"`).
#[async_trait]
pub trait JoinResolver: Send + Sync {
    /// Look up the domain object for a topic.
    ///
    /// # Errors
    ///
    /// Returns [`HookError::NotFound`] if no such object exists.
    async fn resolve(&self, topic_suffix: &str) -> Result<Value, HookError>;
}

/// Applies content updates to a domain object.
#[async_trait]
pub trait UpdatePersister: Send + Sync {
    /// Persist new content, returning the updated object.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails; the broker then replies to the
    /// sender only and emits no broadcast.
    async fn apply(&self, object: &Value, new_content: &str) -> Result<Value, HookError>;
}

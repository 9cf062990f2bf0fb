//! In-memory collaborators for running the server standalone.
//!
//! Production deployments replace these with real implementations: a JWT
//! verifier for the authenticator, a database-backed resolver and persister
//! for the domain objects.

use async_trait::async_trait;
use dashmap::DashMap;
use relay_core::{Authenticator, HookError, JoinResolver, Principal, UpdatePersister};
use serde_json::{json, Value};
use tracing::debug;

/// Accepts any non-empty token and uses it as the user identity.
///
/// A stand-in for real token verification; the broker only ever sees the
/// resulting opaque principal.
pub struct TokenAuthenticator;

#[async_trait]
impl Authenticator for TokenAuthenticator {
    async fn verify(&self, credentials: Option<&str>) -> Result<Principal, HookError> {
        match credentials {
            Some(token) if !token.is_empty() => {
                Ok(Principal::new(token).with_data(json!({ "name": token })))
            }
            _ => Err(HookError::Rejected("missing or empty token".into())),
        }
    }
}

/// In-memory domain object store serving as both join resolver and update
/// persister.
///
/// Objects are created on first resolve with empty content, keyed by the
/// topic suffix.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: DashMap<String, Value>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn valid_object_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

#[async_trait]
impl JoinResolver for MemoryStore {
    async fn resolve(&self, topic_suffix: &str) -> Result<Value, HookError> {
        if !valid_object_id(topic_suffix) {
            return Err(HookError::NotFound);
        }

        let object = self
            .objects
            .entry(topic_suffix.to_string())
            .or_insert_with(|| {
                debug!(id = %topic_suffix, "Creating object");
                json!({ "id": topic_suffix, "content": "" })
            })
            .clone();

        Ok(object)
    }
}

#[async_trait]
impl UpdatePersister for MemoryStore {
    async fn apply(&self, object: &Value, new_content: &str) -> Result<Value, HookError> {
        let id = object
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| HookError::Failure("object without id".into()))?;

        let mut stored = self.objects.get_mut(id).ok_or(HookError::NotFound)?;
        stored["content"] = json!(new_content);
        Ok(stored.clone())
    }
}

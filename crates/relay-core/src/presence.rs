//! Replicated presence store.
//!
//! Presence is a per-topic map of key (typically a user ID) to a small
//! ordered list of *metas*, one per concurrent connection holding that key.
//! Every meta carries a unique reference tag and the name of the node that
//! created it.
//!
//! Mutations return a [`PresenceDiff`] instead of publishing anything
//! themselves; the broker decides where the diff goes. Replication follows
//! per-node ownership: a node is authoritative for the metas it created,
//! peers union them in via [`Presence::merge_remote`] (last-writer-wins per
//! tag) and drop them via [`Presence::remove_node`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

static REF_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique reference tag identifying one meta.
///
/// Tags stay valid across [`Presence::update`] calls; only
/// [`Presence::untrack`] retires them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PresenceRef(String);

impl PresenceRef {
    /// Generate a fresh node-scoped reference.
    fn generate(node: &str) -> Self {
        let counter = REF_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("{}-{:x}", node, counter))
    }

    /// Get the reference as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PresenceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One connection's presence metadata under a key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    /// Unique reference tag.
    #[serde(rename = "ref")]
    pub tag: PresenceRef,
    /// Node that created this meta.
    pub node: String,
    /// User-defined metadata. Always a JSON object.
    #[serde(flatten)]
    pub data: Value,
}

/// Metas wrapper giving snapshots and diffs their `{key: {metas: [..]}}`
/// wire shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metas {
    /// Metas in track order.
    pub metas: Vec<Meta>,
}

/// A joins/leaves delta describing a presence change.
///
/// An update is modeled as leave-old + join-new of the same key, so client
/// reconciliation stays a single code path.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PresenceDiff {
    /// Keys gaining metas.
    pub joins: BTreeMap<String, Metas>,
    /// Keys losing metas.
    pub leaves: BTreeMap<String, Metas>,
}

impl PresenceDiff {
    /// Whether the diff carries no change.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.joins.is_empty() && self.leaves.is_empty()
    }

    /// Serialize to a JSON value for broadcasting.
    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_default()
    }

    fn join(&mut self, key: &str, meta: Meta) {
        self.joins.entry(key.to_string()).or_default().metas.push(meta);
    }

    fn leave(&mut self, key: &str, meta: Meta) {
        self.leaves.entry(key.to_string()).or_default().metas.push(meta);
    }
}

/// Presence tracker for a single topic.
#[derive(Debug)]
pub struct Presence {
    /// Name of the local node; stamped onto every tracked meta.
    node: String,
    /// Key to metas, one meta per live connection holding the key.
    entries: BTreeMap<String, Vec<Meta>>,
}

fn normalize(data: Value) -> Value {
    if data.is_object() {
        data
    } else {
        Value::Object(serde_json::Map::new())
    }
}

impl Presence {
    /// Create a presence tracker owned by the given node.
    #[must_use]
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            entries: BTreeMap::new(),
        }
    }

    /// Number of present keys.
    #[must_use]
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// Whether no key is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether a key is present.
    #[must_use]
    pub fn is_present(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Get the metadata currently held under a reference tag.
    #[must_use]
    pub fn data_of(&self, key: &str, tag: &PresenceRef) -> Option<Value> {
        self.entries
            .get(key)?
            .iter()
            .find(|m| &m.tag == tag)
            .map(|m| m.data.clone())
    }

    /// Track a new meta under a key, creating the entry if absent.
    ///
    /// Returns the generated reference tag and the join diff to publish.
    pub fn track(&mut self, key: impl Into<String>, data: Value) -> (PresenceRef, PresenceDiff) {
        let key = key.into();
        let tag = PresenceRef::generate(&self.node);
        let meta = Meta {
            tag: tag.clone(),
            node: self.node.clone(),
            data: normalize(data),
        };

        self.entries.entry(key.clone()).or_default().push(meta.clone());
        debug!(key = %key, tag = %tag, "Presence: tracked");

        let mut diff = PresenceDiff::default();
        diff.join(&key, meta);
        (tag, diff)
    }

    /// Replace the metadata held under a reference tag. The tag is preserved.
    ///
    /// Returns a diff with the key in both `joins` (new state) and `leaves`
    /// (old state), or `None` if the tag is unknown.
    pub fn update(&mut self, key: &str, tag: &PresenceRef, data: Value) -> Option<PresenceDiff> {
        let meta = self
            .entries
            .get_mut(key)?
            .iter_mut()
            .find(|m| &m.tag == tag)?;

        let old = meta.clone();
        meta.data = normalize(data);
        let new = meta.clone();

        let mut diff = PresenceDiff::default();
        diff.leave(key, old);
        diff.join(key, new);
        Some(diff)
    }

    /// Remove the meta with the given reference tag. The key is removed
    /// entirely once its last meta is gone.
    ///
    /// Returns the leave diff to publish, or `None` if the tag is unknown.
    pub fn untrack(&mut self, key: &str, tag: &PresenceRef) -> Option<PresenceDiff> {
        let metas = self.entries.get_mut(key)?;
        let pos = metas.iter().position(|m| &m.tag == tag)?;
        let removed = metas.remove(pos);
        let emptied = metas.is_empty();
        if emptied {
            self.entries.remove(key);
        }
        debug!(key = %key, tag = %tag, "Presence: untracked");

        let mut diff = PresenceDiff::default();
        diff.leave(key, removed);
        Some(diff)
    }

    /// Full current snapshot, no mutation. Used to bootstrap newly joined
    /// sessions.
    #[must_use]
    pub fn list(&self) -> BTreeMap<String, Metas> {
        self.entries
            .iter()
            .map(|(key, metas)| (key.clone(), Metas { metas: metas.clone() }))
            .collect()
    }

    /// Snapshot serialized to a JSON value.
    #[must_use]
    pub fn snapshot(&self) -> Value {
        serde_json::to_value(self.list()).unwrap_or_default()
    }

    /// The metas created by the local node, for sharing with peers.
    #[must_use]
    pub fn extract_local(&self) -> BTreeMap<String, Vec<Meta>> {
        self.entries
            .iter()
            .filter_map(|(key, metas)| {
                let local: Vec<Meta> =
                    metas.iter().filter(|m| m.node == self.node).cloned().collect();
                if local.is_empty() {
                    None
                } else {
                    Some((key.clone(), local))
                }
            })
            .collect()
    }

    /// Merge a peer node's reported state, replacing that node's previous
    /// contributions.
    ///
    /// Membership is the union across nodes; per tag the incoming meta wins.
    /// Metas the peer no longer reports are removed. Metas stamped with a
    /// different node name are ignored.
    pub fn merge_remote(
        &mut self,
        node: &str,
        incoming: BTreeMap<String, Vec<Meta>>,
    ) -> PresenceDiff {
        let mut diff = PresenceDiff::default();

        // Pass 1: retire this node's metas that disappeared or changed.
        let keys: Vec<String> = self.entries.keys().cloned().collect();
        for key in keys {
            let Some(metas) = self.entries.get_mut(&key) else {
                continue;
            };
            let mut kept = Vec::with_capacity(metas.len());
            for meta in metas.drain(..) {
                if meta.node != node {
                    kept.push(meta);
                    continue;
                }
                match incoming
                    .get(&key)
                    .and_then(|ms| ms.iter().find(|m| m.tag == meta.tag))
                {
                    Some(new) if new.data == meta.data => kept.push(meta),
                    _ => diff.leave(&key, meta),
                }
            }
            let emptied = kept.is_empty();
            *metas = kept;
            if emptied {
                self.entries.remove(&key);
            }
        }

        // Pass 2: union in metas not already present.
        for (key, metas) in incoming {
            for meta in metas {
                if meta.node != node {
                    debug!(key = %key, node = %meta.node, "Presence: ignoring mis-stamped meta");
                    continue;
                }
                let entry = self.entries.entry(key.clone()).or_default();
                if !entry.iter().any(|m| m.tag == meta.tag) {
                    diff.join(&key, meta.clone());
                    entry.push(meta);
                }
            }
        }

        diff
    }

    /// Drop every meta contributed by a node that left the cluster.
    pub fn remove_node(&mut self, node: &str) -> PresenceDiff {
        let mut diff = PresenceDiff::default();

        let keys: Vec<String> = self.entries.keys().cloned().collect();
        for key in keys {
            let Some(metas) = self.entries.get_mut(&key) else {
                continue;
            };
            let (gone, kept): (Vec<Meta>, Vec<Meta>) =
                metas.drain(..).partition(|m| m.node == node);
            let emptied = kept.is_empty();
            *metas = kept;
            if !gone.is_empty() {
                diff.leaves.insert(key.clone(), Metas { metas: gone });
            }
            if emptied {
                self.entries.remove(&key);
            }
        }

        if !diff.is_empty() {
            debug!(node = %node, "Presence: removed node contributions");
        }
        diff
    }
}

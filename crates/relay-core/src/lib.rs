//! # relay-core
//!
//! Topic-based realtime messaging and distributed presence broker.
//!
//! This crate provides the engine behind Relay:
//!
//! - **Registry** - Live connections and their verified identity
//! - **Broker** - Topic activation, joins, and per-session event handling
//! - **Presence** - Replicated per-key metadata with join/leave diffs
//! - **Bus** - Fan-out broadcasts and unicast pushes
//! - **Hooks** - Traits for the external authenticator, join resolver, and
//!   update persister
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Registry   │────▶│   Broker    │────▶│   Session   │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                        │         │
//!                        ▼         ▼
//!                 ┌──────────┐  ┌──────────┐
//!                 │ Presence │  │   Bus    │
//!                 └──────────┘  └──────────┘
//! ```
//!
//! Transport, credential verification, and persistence stay outside: the
//! broker consumes them through the [`hooks`] traits and an outbound
//! [`message::Delivery`] channel per connection.

pub mod broker;
pub mod bus;
pub mod error;
pub mod hooks;
pub mod message;
pub mod presence;
pub mod registry;
pub mod session;

pub use broker::{events, Broker, BrokerConfig, BrokerStats, JoinAccept};
pub use bus::{Bus, BusError};
pub use error::BrokerError;
pub use hooks::{Authenticator, HookError, JoinResolver, Principal, UpdatePersister};
pub use message::{Broadcast, ConnectionId, Delivery, SessionId, TopicId};
pub use presence::{Meta, Metas, Presence, PresenceDiff, PresenceRef};
pub use registry::Registry;
pub use session::{Assigns, HandlerResult, Session, SessionState};

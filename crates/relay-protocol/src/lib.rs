//! # relay-protocol
//!
//! Wire protocol definitions for the Relay messaging broker.
//!
//! This crate defines the binary protocol spoken between Relay clients and
//! servers: frame types, the length-prefixed MessagePack codec, and protocol
//! versioning.
//!
//! ## Frame Types
//!
//! - `Connect` / `Connected` - Handshake and authentication
//! - `Join` / `Leave` / `Reply` - Topic membership
//! - `Event` - Client events addressed to a joined topic
//! - `Broadcast` - Server-pushed messages (broadcasts, presence diffs)
//! - `Error`, `Ping` / `Pong` - Failures and keepalive
//!
//! ## Example
//!
//! ```rust
//! use relay_protocol::{codec, Frame};
//! use serde_json::json;
//!
//! let frame = Frame::join(1, "room:42", json!({"typing": false}));
//!
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod frames;
pub mod version;

pub use codec::{decode, encode, ProtocolError};
pub use frames::{Frame, FrameType, ReplyStatus};
pub use version::{Version, PROTOCOL_VERSION};

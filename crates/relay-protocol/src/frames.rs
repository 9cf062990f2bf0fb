//! Frame types for the Relay protocol.
//!
//! Frames are the unit of communication between clients and the broker.
//! Each frame is serialized with MessagePack (named fields).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum FrameType {
    Connect = 0x01,
    Connected = 0x02,
    Join = 0x03,
    Reply = 0x04,
    Leave = 0x05,
    Event = 0x06,
    Broadcast = 0x07,
    Error = 0x08,
    Ping = 0x09,
    Pong = 0x0A,
}

impl From<FrameType> for u8 {
    fn from(ft: FrameType) -> u8 {
        ft as u8
    }
}

impl TryFrom<u8> for FrameType {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x01 => Ok(FrameType::Connect),
            0x02 => Ok(FrameType::Connected),
            0x03 => Ok(FrameType::Join),
            0x04 => Ok(FrameType::Reply),
            0x05 => Ok(FrameType::Leave),
            0x06 => Ok(FrameType::Event),
            0x07 => Ok(FrameType::Broadcast),
            0x08 => Ok(FrameType::Error),
            0x09 => Ok(FrameType::Ping),
            0x0A => Ok(FrameType::Pong),
            _ => Err("Invalid frame type"),
        }
    }
}

/// Outcome carried by a `Reply` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStatus {
    /// Request succeeded.
    Ok,
    /// Request was rejected or failed.
    Error,
}

/// A protocol frame.
///
/// Client-to-server frames carry a request `id` so replies can be
/// correlated; server-pushed frames (`Broadcast`) carry none.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Initial handshake. Must be the first frame on a connection.
    #[serde(rename = "connect")]
    Connect {
        /// Protocol version.
        version: u8,
        /// Credentials for the authenticator (opaque to the protocol).
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },

    /// Handshake accepted.
    #[serde(rename = "connected")]
    Connected {
        /// Unique connection identifier.
        connection_id: String,
        /// Negotiated protocol version.
        version: u8,
        /// Recommended heartbeat interval in milliseconds.
        heartbeat: u32,
    },

    /// Join a topic.
    #[serde(rename = "join")]
    Join {
        /// Request ID for reply correlation.
        id: u64,
        /// Topic to join.
        topic: String,
        /// Join parameters, passed through to the session.
        #[serde(default)]
        params: Value,
    },

    /// Reply to a Join, Leave, or Event request.
    #[serde(rename = "reply")]
    Reply {
        /// ID of the request this replies to.
        id: u64,
        /// Topic the request addressed.
        topic: String,
        /// Outcome.
        status: ReplyStatus,
        /// Reply payload.
        payload: Value,
    },

    /// Leave a topic.
    #[serde(rename = "leave")]
    Leave {
        /// Request ID for reply correlation.
        id: u64,
        /// Topic to leave.
        topic: String,
    },

    /// Client event addressed to a joined topic.
    #[serde(rename = "event")]
    Event {
        /// Optional request ID; present when the client wants a reply.
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        /// Target topic.
        topic: String,
        /// Event name (e.g. `content:update`).
        event: String,
        /// Event payload.
        payload: Value,
    },

    /// Server-pushed message: a topic broadcast or a direct push.
    #[serde(rename = "broadcast")]
    Broadcast {
        /// Originating topic.
        topic: String,
        /// Event name (e.g. `presence_diff`).
        event: String,
        /// Message payload.
        payload: Value,
    },

    /// Error response.
    #[serde(rename = "error")]
    Error {
        /// ID of the failed request (0 if not applicable).
        id: u64,
        /// Error code.
        code: u16,
        /// Human-readable error message.
        message: String,
    },

    /// Keepalive ping.
    #[serde(rename = "ping")]
    Ping {
        /// Optional timestamp echoed back by the pong.
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Keepalive pong.
    #[serde(rename = "pong")]
    Pong {
        /// Echoed timestamp from the ping.
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl Frame {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Connect { .. } => FrameType::Connect,
            Frame::Connected { .. } => FrameType::Connected,
            Frame::Join { .. } => FrameType::Join,
            Frame::Reply { .. } => FrameType::Reply,
            Frame::Leave { .. } => FrameType::Leave,
            Frame::Event { .. } => FrameType::Event,
            Frame::Broadcast { .. } => FrameType::Broadcast,
            Frame::Error { .. } => FrameType::Error,
            Frame::Ping { .. } => FrameType::Ping,
            Frame::Pong { .. } => FrameType::Pong,
        }
    }

    /// Create a new Connect frame.
    #[must_use]
    pub fn connect(version: u8, token: Option<String>) -> Self {
        Frame::Connect { version, token }
    }

    /// Create a new Connected frame.
    #[must_use]
    pub fn connected(connection_id: impl Into<String>, version: u8, heartbeat: u32) -> Self {
        Frame::Connected {
            connection_id: connection_id.into(),
            version,
            heartbeat,
        }
    }

    /// Create a new Join frame.
    #[must_use]
    pub fn join(id: u64, topic: impl Into<String>, params: Value) -> Self {
        Frame::Join {
            id,
            topic: topic.into(),
            params,
        }
    }

    /// Create a new Leave frame.
    #[must_use]
    pub fn leave(id: u64, topic: impl Into<String>) -> Self {
        Frame::Leave {
            id,
            topic: topic.into(),
        }
    }

    /// Create a new Event frame.
    #[must_use]
    pub fn event(
        id: Option<u64>,
        topic: impl Into<String>,
        event: impl Into<String>,
        payload: Value,
    ) -> Self {
        Frame::Event {
            id,
            topic: topic.into(),
            event: event.into(),
            payload,
        }
    }

    /// Create a successful Reply frame.
    #[must_use]
    pub fn reply_ok(id: u64, topic: impl Into<String>, payload: Value) -> Self {
        Frame::Reply {
            id,
            topic: topic.into(),
            status: ReplyStatus::Ok,
            payload,
        }
    }

    /// Create an error Reply frame.
    #[must_use]
    pub fn reply_error(id: u64, topic: impl Into<String>, payload: Value) -> Self {
        Frame::Reply {
            id,
            topic: topic.into(),
            status: ReplyStatus::Error,
            payload,
        }
    }

    /// Create a new Broadcast frame.
    #[must_use]
    pub fn broadcast(topic: impl Into<String>, event: impl Into<String>, payload: Value) -> Self {
        Frame::Broadcast {
            topic: topic.into(),
            event: event.into(),
            payload,
        }
    }

    /// Create a new Error frame.
    #[must_use]
    pub fn error(id: u64, code: u16, message: impl Into<String>) -> Self {
        Frame::Error {
            id,
            code,
            message: message.into(),
        }
    }

    /// Create a new Ping frame.
    #[must_use]
    pub fn ping(timestamp: Option<u64>) -> Self {
        Frame::Ping { timestamp }
    }

    /// Create a new Pong frame.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        Frame::Pong { timestamp }
    }
}

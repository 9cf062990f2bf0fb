//! Protocol version negotiation.
//!
//! A `Connect` frame carries the client's major version; the server accepts
//! the connection only when [`Version::is_compatible_with`] holds against
//! [`PROTOCOL_VERSION`]. Minor versions never gate the handshake.

use serde::{Deserialize, Serialize};

/// The protocol version this build speaks.
pub const PROTOCOL_VERSION: Version = Version::new(1, 0);

/// A protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    /// Incremented when the wire format breaks.
    pub major: u8,
    /// Incremented for additions old peers can ignore.
    pub minor: u8,
}

impl Version {
    /// Create a version.
    #[must_use]
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Whether two versions can talk to each other.
    ///
    /// Compatibility is symmetric and decided by the major version alone.
    #[must_use]
    pub fn is_compatible_with(&self, other: &Version) -> bool {
        self.major == other.major
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

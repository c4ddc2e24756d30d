//! Protocol versioning for Courier.
//!
//! Clients announce their major version in the `connect` frame; the node
//! accepts any client sharing its major version.

use serde::{Deserialize, Serialize};

/// Current protocol version.
pub const PROTOCOL_VERSION: Version = Version { major: 1, minor: 0 };

/// Protocol version information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    /// Major version - breaking changes increment this.
    pub major: u8,
    /// Minor version - backwards-compatible changes increment this.
    pub minor: u8,
}

impl Version {
    /// Create a new version.
    #[must_use]
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Check if this version is compatible with another version.
    #[must_use]
    pub fn is_compatible_with(&self, other: &Version) -> bool {
        self.major == other.major
    }

    /// Negotiate with a client announcing `client_major`.
    ///
    /// Returns the major version to confirm in the `connected` frame, or
    /// `None` when the client speaks an incompatible protocol.
    #[must_use]
    pub fn negotiate(&self, client_major: u8) -> Option<u8> {
        self.is_compatible_with(&Version::new(client_major, 0))
            .then_some(self.major)
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl Default for Version {
    fn default() -> Self {
        PROTOCOL_VERSION
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiate() {
        assert_eq!(PROTOCOL_VERSION.negotiate(1), Some(1));
        assert_eq!(PROTOCOL_VERSION.negotiate(2), None);
        assert_eq!(PROTOCOL_VERSION.negotiate(0), None);
    }

    #[test]
    fn test_version_display() {
        assert_eq!(Version::new(1, 2).to_string(), "1.2");
    }
}

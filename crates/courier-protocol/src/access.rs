//! Access modes and topic kinds.
//!
//! Both travel on the wire (in subscribe requests and topic descriptions), so
//! they live in the protocol crate and are re-exported by `courier-core`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Access mode of a subscriber on a topic.
///
/// Modes are totally ordered: every mode grants everything the modes below it
/// grant (`Write` implies read, `Admin` implies write).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    /// No access at all.
    None,
    /// Receive messages and presence.
    Read,
    /// Read plus publish.
    Write,
    /// Write plus topic administration (`set_info`).
    Admin,
}

impl AccessMode {
    /// Whether this mode allows receiving messages.
    #[must_use]
    pub fn can_read(self) -> bool {
        self >= AccessMode::Read
    }

    /// Whether this mode allows publishing.
    #[must_use]
    pub fn can_write(self) -> bool {
        self >= AccessMode::Write
    }

    /// Whether this mode allows changing topic metadata.
    #[must_use]
    pub fn can_admin(self) -> bool {
        self == AccessMode::Admin
    }

    /// The weaker of two modes.
    #[must_use]
    pub fn intersect(self, other: AccessMode) -> AccessMode {
        self.min(other)
    }
}

impl Default for AccessMode {
    fn default() -> Self {
        AccessMode::Write
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AccessMode::None => "none",
            AccessMode::Read => "read",
            AccessMode::Write => "write",
            AccessMode::Admin => "admin",
        };
        f.write_str(s)
    }
}

/// Topic kind, derived from the topic name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopicKind {
    /// A user's private channel, `me:<user>`.
    Me,
    /// Conversation between two users (`p2p*` or `dm*`).
    P2p,
    /// Any other named group.
    Group,
}

impl TopicKind {
    /// Classify a topic name.
    #[must_use]
    pub fn of(name: &str) -> TopicKind {
        if name.starts_with("me:") {
            TopicKind::Me
        } else if name.starts_with("p2p") || name.starts_with("dm") {
            TopicKind::P2p
        } else {
            TopicKind::Group
        }
    }

    /// Maximum number of distinct members, if bounded.
    #[must_use]
    pub fn member_limit(self) -> Option<usize> {
        match self {
            TopicKind::Me => Some(1),
            TopicKind::P2p => Some(2),
            TopicKind::Group => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_ordering() {
        assert!(AccessMode::Admin.can_write());
        assert!(AccessMode::Write.can_read());
        assert!(!AccessMode::Read.can_write());
        assert!(!AccessMode::None.can_read());
        assert!(!AccessMode::Write.can_admin());
        assert_eq!(AccessMode::Admin.intersect(AccessMode::Read), AccessMode::Read);
    }

    #[test]
    fn test_topic_kind() {
        assert_eq!(TopicKind::of("me:alice"), TopicKind::Me);
        assert_eq!(TopicKind::of("dm5"), TopicKind::P2p);
        assert_eq!(TopicKind::of("p2pAbc"), TopicKind::P2p);
        assert_eq!(TopicKind::of("grp1"), TopicKind::Group);
        assert_eq!(TopicKind::P2p.member_limit(), Some(2));
        assert_eq!(TopicKind::Group.member_limit(), None);
    }
}

//! Admission rules per topic kind.

use courier_protocol::{AccessMode, TopicKind};
use std::collections::HashMap;

use crate::error::CourierError;
use crate::session::{Identity, UserId};

/// Outcome of an admitted subscribe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Admission {
    /// Mode granted to the session.
    pub mode: AccessMode,
    /// Membership to persist before the session is attached.
    pub persist: Option<(UserId, AccessMode)>,
}

/// Decide whether `identity` may attach to `topic` with `requested` access.
pub(crate) fn admit(
    topic: &str,
    kind: TopicKind,
    members: &HashMap<UserId, AccessMode>,
    identity: &Identity,
    requested: AccessMode,
) -> Result<Admission, CourierError> {
    if requested == AccessMode::None {
        return Err(denied(topic, "mode none requested"));
    }

    let (stored, persist) = match (kind, identity) {
        (TopicKind::Group, Identity::Anonymous) => (AccessMode::Read, None),
        (_, Identity::Anonymous) => return Err(denied(topic, "anonymous access")),
        (_, Identity::User(user)) => match members.get(user) {
            Some(mode) => (*mode, None),
            None => {
                let mode = new_member_mode(topic, kind, members, user)?;
                (mode, Some((user.clone(), mode)))
            }
        },
    };

    let mode = requested.intersect(stored);
    if mode == AccessMode::None {
        return Err(denied(topic, "no access granted"));
    }
    Ok(Admission { mode, persist })
}

fn new_member_mode(
    topic: &str,
    kind: TopicKind,
    members: &HashMap<UserId, AccessMode>,
    user: &UserId,
) -> Result<AccessMode, CourierError> {
    match kind {
        TopicKind::Me => {
            let owner = topic.strip_prefix("me:").unwrap_or_default();
            if owner == user.as_str() {
                Ok(AccessMode::Admin)
            } else {
                Err(denied(topic, "private topic"))
            }
        }
        TopicKind::P2p => {
            if kind.member_limit().is_some_and(|limit| members.len() >= limit) {
                Err(denied(topic, "conversation is full"))
            } else {
                Ok(AccessMode::Write)
            }
        }
        TopicKind::Group => Ok(if members.is_empty() {
            AccessMode::Admin
        } else {
            AccessMode::Write
        }),
    }
}

fn denied(topic: &str, why: &str) -> CourierError {
    CourierError::PermissionDenied(format!("{topic}: {why}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn members(entries: &[(&str, AccessMode)]) -> HashMap<UserId, AccessMode> {
        entries
            .iter()
            .map(|(u, m)| (UserId::new(*u), *m))
            .collect()
    }

    #[test]
    fn test_group_first_member_owns() {
        let admission = admit(
            "grp1",
            TopicKind::Group,
            &HashMap::new(),
            &Identity::user("alice"),
            AccessMode::Admin,
        )
        .unwrap();
        assert_eq!(admission.mode, AccessMode::Admin);
        assert_eq!(
            admission.persist,
            Some((UserId::new("alice"), AccessMode::Admin))
        );

        let admission = admit(
            "grp1",
            TopicKind::Group,
            &members(&[("alice", AccessMode::Admin)]),
            &Identity::user("bob"),
            AccessMode::Admin,
        )
        .unwrap();
        assert_eq!(admission.mode, AccessMode::Write);
    }

    #[test]
    fn test_existing_member_uses_stored_mode() {
        let admission = admit(
            "grp1",
            TopicKind::Group,
            &members(&[("bob", AccessMode::Read)]),
            &Identity::user("bob"),
            AccessMode::Write,
        )
        .unwrap();
        assert_eq!(admission.mode, AccessMode::Read);
        assert_eq!(admission.persist, None);
    }

    #[test]
    fn test_anonymous_rules() {
        let admission = admit(
            "grp1",
            TopicKind::Group,
            &HashMap::new(),
            &Identity::Anonymous,
            AccessMode::Write,
        )
        .unwrap();
        assert_eq!(admission.mode, AccessMode::Read);
        assert_eq!(admission.persist, None);

        assert!(matches!(
            admit(
                "dm5",
                TopicKind::P2p,
                &HashMap::new(),
                &Identity::Anonymous,
                AccessMode::Read
            ),
            Err(CourierError::PermissionDenied(_))
        ));
    }

    #[test]
    fn test_p2p_is_limited_to_two() {
        let full = members(&[("alice", AccessMode::Write), ("bob", AccessMode::Write)]);
        assert!(admit(
            "dm5",
            TopicKind::P2p,
            &full,
            &Identity::user("bob"),
            AccessMode::Write
        )
        .is_ok());
        assert!(matches!(
            admit(
                "dm5",
                TopicKind::P2p,
                &full,
                &Identity::user("carol"),
                AccessMode::Write
            ),
            Err(CourierError::PermissionDenied(_))
        ));
    }

    #[test]
    fn test_me_topic_is_private() {
        assert_eq!(
            admit(
                "me:alice",
                TopicKind::Me,
                &HashMap::new(),
                &Identity::user("alice"),
                AccessMode::Admin
            )
            .unwrap()
            .mode,
            AccessMode::Admin
        );
        assert!(admit(
            "me:alice",
            TopicKind::Me,
            &HashMap::new(),
            &Identity::user("bob"),
            AccessMode::Read
        )
        .is_err());
    }

    #[test]
    fn test_mode_none_is_denied() {
        assert!(matches!(
            admit(
                "grp1",
                TopicKind::Group,
                &HashMap::new(),
                &Identity::user("alice"),
                AccessMode::None
            ),
            Err(CourierError::PermissionDenied(_))
        ));
        assert!(matches!(
            admit(
                "grp1",
                TopicKind::Group,
                &members(&[("alice", AccessMode::None)]),
                &Identity::user("alice"),
                AccessMode::Write
            ),
            Err(CourierError::PermissionDenied(_))
        ));
    }
}

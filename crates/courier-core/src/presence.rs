//! Presence tracking for topics.
//!
//! Every topic keeps one [`Presence`] table for its attached sessions and
//! renders presence events from it.

use courier_protocol::{Frame, PresenceAction};
use std::collections::HashMap;
use tracing::debug;

use crate::message::now_millis;
use crate::session::{Identity, SessionId};

/// Presence state for a single session.
#[derive(Debug, Clone)]
pub struct PresenceState {
    /// Session the state belongs to.
    pub session: SessionId,
    /// Authenticated user behind the session.
    pub user: Option<String>,
    /// User-defined metadata.
    pub data: Option<serde_json::Value>,
    /// When the session joined (ms since epoch).
    pub joined_at: u64,
    /// Last presence change (ms since epoch).
    pub updated_at: u64,
}

impl PresenceState {
    /// Create a new presence state.
    #[must_use]
    pub fn new(session: SessionId, identity: &Identity) -> Self {
        let now = now_millis();
        Self {
            session,
            user: identity.user_id().map(|u| u.to_string()),
            data: None,
            joined_at: now,
            updated_at: now,
        }
    }

    /// Render a presence event for this state.
    #[must_use]
    pub fn event(&self, topic: &str, action: PresenceAction) -> Frame {
        Frame::PresenceEvent {
            topic: topic.to_string(),
            action,
            session: self.session.to_string(),
            user: self.user.clone(),
            data: self.data.clone(),
        }
    }
}

/// Presence tracker for a topic.
#[derive(Debug, Default)]
pub struct Presence {
    members: HashMap<SessionId, PresenceState>,
}

impl Presence {
    /// Create a new presence tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of present sessions.
    #[must_use]
    pub fn count(&self) -> usize {
        self.members.len()
    }

    /// Check if a session is present.
    #[must_use]
    pub fn is_present(&self, session: &SessionId) -> bool {
        self.members.contains_key(session)
    }

    /// Get the presence state of a session.
    #[must_use]
    pub fn get(&self, session: &SessionId) -> Option<&PresenceState> {
        self.members.get(session)
    }

    /// Add a session.
    ///
    /// Returns `true` if the session was not present yet; an existing entry is
    /// left untouched.
    pub fn join(&mut self, session: &SessionId, identity: &Identity) -> bool {
        if self.members.contains_key(session) {
            return false;
        }
        self.members
            .insert(session.clone(), PresenceState::new(session.clone(), identity));
        debug!(session = %session, "Presence: session joined");
        true
    }

    /// Remove a session, returning its last state.
    pub fn leave(&mut self, session: &SessionId) -> Option<PresenceState> {
        let state = self.members.remove(session);
        if state.is_some() {
            debug!(session = %session, "Presence: session left");
        }
        state
    }

    /// Replace a session's presence data.
    ///
    /// Returns the updated state, or `None` if the session is not present.
    pub fn update(
        &mut self,
        session: &SessionId,
        data: Option<serde_json::Value>,
    ) -> Option<&PresenceState> {
        let state = self.members.get_mut(session)?;
        state.data = data;
        state.updated_at = now_millis();
        Some(state)
    }

    /// Drop every session for which `keep` returns false.
    ///
    /// Returns the removed states.
    pub fn retain(&mut self, mut keep: impl FnMut(&SessionId) -> bool) -> Vec<PresenceState> {
        let gone: Vec<SessionId> = self
            .members
            .keys()
            .filter(|id| !keep(id))
            .cloned()
            .collect();
        gone.iter()
            .filter_map(|id| self.members.remove(id))
            .collect()
    }

    /// Check if presence is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sid(s: &str) -> SessionId {
        SessionId::from(s)
    }

    #[test]
    fn test_presence_join_leave() {
        let mut presence = Presence::new();

        assert!(presence.join(&sid("n1-1"), &Identity::user("alice")));
        assert!(!presence.join(&sid("n1-1"), &Identity::user("alice")));

        assert_eq!(presence.count(), 1);
        assert!(presence.is_present(&sid("n1-1")));
        assert_eq!(
            presence.get(&sid("n1-1")).and_then(|s| s.user.clone()),
            Some("alice".to_string())
        );

        assert!(presence.leave(&sid("n1-1")).is_some());
        assert!(presence.leave(&sid("n1-1")).is_none());
        assert!(presence.is_empty());
    }

    #[test]
    fn test_presence_update() {
        let mut presence = Presence::new();
        presence.join(&sid("n1-1"), &Identity::Anonymous);

        let state = presence
            .update(&sid("n1-1"), Some(json!({"status": "away"})))
            .unwrap();
        assert_eq!(state.data, Some(json!({"status": "away"})));
        assert!(presence.update(&sid("n1-2"), None).is_none());
    }

    #[test]
    fn test_presence_event() {
        let mut presence = Presence::new();
        presence.join(&sid("n1-1"), &Identity::user("bob"));
        presence.update(&sid("n1-1"), Some(json!("typing")));

        let frame = presence
            .get(&sid("n1-1"))
            .unwrap()
            .event("grp1", PresenceAction::Update);
        assert_eq!(
            frame,
            Frame::PresenceEvent {
                topic: "grp1".into(),
                action: PresenceAction::Update,
                session: "n1-1".into(),
                user: Some("bob".into()),
                data: Some(json!("typing")),
            }
        );
    }

    #[test]
    fn test_presence_retain() {
        let mut presence = Presence::new();
        presence.join(&sid("n1-1"), &Identity::Anonymous);
        presence.join(&sid("n2-1"), &Identity::Anonymous);

        let gone = presence.retain(|id| id.as_str().starts_with("n1-"));
        assert_eq!(gone.len(), 1);
        assert_eq!(gone[0].session, sid("n2-1"));
        assert_eq!(presence.count(), 1);
    }
}

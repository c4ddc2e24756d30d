//! Persistence collaborator.
//!
//! Topics load their record when they start and write through on every
//! state change that must survive a restart or an ownership move: memberships,
//! messages, and public metadata.

use async_trait::async_trait;
use bytes::Bytes;
use courier_protocol::AccessMode;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

use crate::error::CourierError;
use crate::session::UserId;

/// Storage errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The backend could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The write conflicts with stored state.
    #[error("store conflict: {0}")]
    Conflict(String),
}

impl From<StoreError> for CourierError {
    fn from(err: StoreError) -> Self {
        CourierError::StoreFailure(err.to_string())
    }
}

/// Persisted state of one topic.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TopicRecord {
    /// Persisted memberships and their stored modes.
    pub members: HashMap<UserId, AccessMode>,
    /// Highest sequence id ever appended (0 for a fresh topic).
    pub last_seq: u64,
    /// Public metadata set through `set_info`.
    pub public: Option<serde_json::Value>,
}

/// Storage interface consumed by topic actors.
///
/// Loading an unknown topic yields an empty record.
#[async_trait]
pub trait TopicStore: Send + Sync + 'static {
    /// Load the record of a topic.
    async fn load_topic(&self, topic: &str) -> Result<TopicRecord, StoreError>;

    /// Persist (or update) a membership.
    async fn save_subscription(
        &self,
        topic: &str,
        user: &UserId,
        mode: AccessMode,
    ) -> Result<(), StoreError>;

    /// Drop a membership.
    async fn delete_subscription(&self, topic: &str, user: &UserId) -> Result<(), StoreError>;

    /// Append a message under `seq`.
    async fn append_message(&self, topic: &str, seq: u64, payload: &Bytes)
        -> Result<(), StoreError>;

    /// Replace the public metadata.
    async fn save_info(&self, topic: &str, info: &serde_json::Value) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
struct StoredTopic {
    members: HashMap<UserId, AccessMode>,
    messages: Vec<(u64, Bytes)>,
    public: Option<serde_json::Value>,
}

/// In-process [`TopicStore`].
///
/// One instance can be shared by every node of an in-process cluster, which
/// makes it stand in for a shared database.
#[derive(Debug, Default)]
pub struct MemoryStore {
    topics: DashMap<String, StoredTopic>,
    failing: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with [`StoreError::Unavailable`].
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Messages stored for a topic, in append order.
    #[must_use]
    pub fn messages(&self, topic: &str) -> Vec<(u64, Bytes)> {
        self.topics
            .get(topic)
            .map(|t| t.messages.clone())
            .unwrap_or_default()
    }

    /// Stored mode of a membership.
    #[must_use]
    pub fn member_mode(&self, topic: &str, user: &UserId) -> Option<AccessMode> {
        self.topics
            .get(topic)
            .and_then(|t| t.members.get(user).copied())
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory store switched off".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl TopicStore for MemoryStore {
    async fn load_topic(&self, topic: &str) -> Result<TopicRecord, StoreError> {
        self.check()?;
        Ok(self
            .topics
            .get(topic)
            .map(|t| TopicRecord {
                members: t.members.clone(),
                last_seq: t.messages.last().map_or(0, |(seq, _)| *seq),
                public: t.public.clone(),
            })
            .unwrap_or_default())
    }

    async fn save_subscription(
        &self,
        topic: &str,
        user: &UserId,
        mode: AccessMode,
    ) -> Result<(), StoreError> {
        self.check()?;
        self.topics
            .entry(topic.to_string())
            .or_default()
            .members
            .insert(user.clone(), mode);
        Ok(())
    }

    async fn delete_subscription(&self, topic: &str, user: &UserId) -> Result<(), StoreError> {
        self.check()?;
        if let Some(mut t) = self.topics.get_mut(topic) {
            t.members.remove(user);
        }
        Ok(())
    }

    async fn append_message(
        &self,
        topic: &str,
        seq: u64,
        payload: &Bytes,
    ) -> Result<(), StoreError> {
        self.check()?;
        let mut t = self.topics.entry(topic.to_string()).or_default();
        if let Some((last, _)) = t.messages.last() {
            if *last >= seq {
                return Err(StoreError::Conflict(format!(
                    "seq {seq} not after stored seq {last}"
                )));
            }
        }
        t.messages.push((seq, payload.clone()));
        Ok(())
    }

    async fn save_info(&self, topic: &str, info: &serde_json::Value) -> Result<(), StoreError> {
        self.check()?;
        self.topics.entry(topic.to_string()).or_default().public = Some(info.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_unknown_topic_loads_empty() {
        let store = MemoryStore::new();
        let record = store.load_topic("grp1").await.unwrap();
        assert_eq!(record, TopicRecord::default());
    }

    #[tokio::test]
    async fn test_record_reflects_writes() {
        let store = MemoryStore::new();
        let alice = UserId::new("alice");
        store
            .save_subscription("grp1", &alice, AccessMode::Admin)
            .await
            .unwrap();
        store
            .append_message("grp1", 1, &Bytes::from_static(b"P1"))
            .await
            .unwrap();
        store
            .append_message("grp1", 2, &Bytes::from_static(b"P2"))
            .await
            .unwrap();
        store.save_info("grp1", &json!({"title": "x"})).await.unwrap();

        let record = store.load_topic("grp1").await.unwrap();
        assert_eq!(record.last_seq, 2);
        assert_eq!(record.members.get(&alice), Some(&AccessMode::Admin));
        assert_eq!(record.public, Some(json!({"title": "x"})));

        store.delete_subscription("grp1", &alice).await.unwrap();
        assert_eq!(store.member_mode("grp1", &alice), None);
    }

    #[tokio::test]
    async fn test_append_rejects_stale_seq() {
        let store = MemoryStore::new();
        store
            .append_message("grp1", 3, &Bytes::from_static(b"a"))
            .await
            .unwrap();
        assert!(matches!(
            store
                .append_message("grp1", 3, &Bytes::from_static(b"b"))
                .await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_failing_store() {
        let store = MemoryStore::new();
        store.set_failing(true);
        let err = store.load_topic("grp1").await.unwrap_err();
        assert!(matches!(
            CourierError::from(err),
            CourierError::StoreFailure(_)
        ));
        store.set_failing(false);
        assert!(store.load_topic("grp1").await.is_ok());
    }
}
